//! Адреса назначения и вспомогательный список для загрузки конфигурации
//!
//! [`Address`]: размеченное объединение IPv4/IPv6 с необязательным портом.
//! Разбирается из форм `ip`, `ip:port`, `[ipv6]` и `[ipv6]:port`.
//!
//! [`ConfigList`]: растущий упорядоченный контейнер, в который при загрузке
//! конфигурации складываются записи фильтров и позиции. На горячем пути не
//! используется.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::error::AddrError;

/// Адрес назначения
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 адрес с необязательным портом
    V4(Ipv4Addr, Option<u16>),
    /// IPv6 адрес с необязательным портом
    V6(Ipv6Addr, Option<u16>),
}

impl Address {
    /// Разобрать адрес из текста
    pub fn parse(text: &str) -> Result<Self, AddrError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AddrError::Malformed(text.to_string()));
        }

        // [v6] или [v6]:port
        if let Some(rest) = text.strip_prefix('[') {
            let (inner, tail) = rest
                .split_once(']')
                .ok_or_else(|| AddrError::Malformed(text.to_string()))?;
            let ip: Ipv6Addr = inner
                .parse()
                .map_err(|_| AddrError::Malformed(text.to_string()))?;
            let port = match tail {
                "" => None,
                t => Some(parse_port(t.strip_prefix(':').unwrap_or("x"), text)?),
            };
            return Ok(Address::V6(ip, port));
        }

        if let Ok(ip) = text.parse::<Ipv6Addr>() {
            return Ok(Address::V6(ip, None));
        }
        if let Ok(ip) = text.parse::<Ipv4Addr>() {
            return Ok(Address::V4(ip, None));
        }

        // ip:port (только IPv4, IPv6 с портом обязан быть в скобках)
        if let Some((host, port)) = text.rsplit_once(':') {
            if let Ok(ip) = host.parse::<Ipv4Addr>() {
                return Ok(Address::V4(ip, Some(parse_port(port, text)?)));
            }
            if host.contains(':') {
                return Err(AddrError::Malformed(text.to_string()));
            }
            return Err(classify_other(host, text));
        }

        Err(classify_other(text, text))
    }

    /// IP адрес без порта
    pub fn ip(&self) -> IpAddr {
        match *self {
            Address::V4(ip, _) => IpAddr::V4(ip),
            Address::V6(ip, _) => IpAddr::V6(ip),
        }
    }

    /// Порт, если задан
    pub fn port(&self) -> Option<u16> {
        match *self {
            Address::V4(_, port) | Address::V6(_, port) => port,
        }
    }

    /// Заменить порт
    pub fn with_port(self, port: Option<u16>) -> Self {
        match self {
            Address::V4(ip, _) => Address::V4(ip, port),
            Address::V6(ip, _) => Address::V6(ip, port),
        }
    }

    /// Является ли адрес IPv4 (включая IPv4-mapped IPv6)
    pub fn is_ipv4(&self) -> bool {
        match self {
            Address::V4(..) => true,
            Address::V6(ip, _) => ip.to_ipv4_mapped().is_some(),
        }
    }

    /// Привести IPv4-mapped IPv6 к IPv4
    pub fn canonical(self) -> Self {
        match self {
            Address::V6(ip, port) => match ip.to_ipv4_mapped() {
                Some(v4) => Address::V4(v4, port),
                None => self,
            },
            other => other,
        }
    }
}

fn parse_port(port: &str, text: &str) -> Result<u16, AddrError> {
    match port.parse::<u16>() {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(AddrError::Malformed(text.to_string())),
    }
}

/// Отличить доменное имя / unix-путь от мусора
fn classify_other(host: &str, text: &str) -> AddrError {
    let looks_like_name = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        && host.chars().any(|c| c.is_ascii_alphabetic());

    if looks_like_name || host.starts_with('/') {
        AddrError::UnsupportedFamily(text.to_string())
    } else {
        AddrError::Malformed(text.to_string())
    }
}

impl FromStr for Address {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(a) => Address::V4(*a.ip(), Some(a.port())),
            SocketAddr::V6(a) => Address::V6(*a.ip(), Some(a.port())),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::V4(v4, None),
            IpAddr::V6(v6) => Address::V6(v6, None),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(ip, None) => write!(f, "{}", ip),
            Address::V4(ip, Some(port)) => write!(f, "{}:{}", ip, port),
            Address::V6(ip, None) => write!(f, "{}", ip),
            Address::V6(ip, Some(port)) => write!(f, "[{}]:{}", ip, port),
        }
    }
}

/// Растущий список с сохранением порядка вставки
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigList<T> {
    items: Vec<T>,
}

impl<T> ConfigList<T> {
    /// Создать пустой список
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Добавить элемент в конец и вернуть ссылку на него
    pub fn push(&mut self, item: T) -> &mut T {
        self.items.push(item);
        let last = self.items.len() - 1;
        &mut self.items[last]
    }

    /// Количество элементов
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Пуст ли список
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Итератор по элементам в порядке вставки
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Элементы как срез
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Забрать элементы
    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T> Default for ConfigList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<T> for ConfigList<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<T> IntoIterator for ConfigList<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a ConfigList<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            Address::parse("10.0.0.1").unwrap(),
            Address::V4(Ipv4Addr::new(10, 0, 0, 1), None)
        );
        assert_eq!(
            Address::parse("10.0.0.1:443").unwrap(),
            Address::V4(Ipv4Addr::new(10, 0, 0, 1), Some(443))
        );
        assert_eq!(
            Address::parse("::1").unwrap(),
            Address::V6(Ipv6Addr::LOCALHOST, None)
        );
        assert_eq!(
            Address::parse("[::1]:8080").unwrap(),
            Address::V6(Ipv6Addr::LOCALHOST, Some(8080))
        );
        assert_eq!(
            Address::parse("[2001:db8::1]").unwrap().port(),
            None
        );
    }

    #[test]
    fn test_error_kinds() {
        assert!(matches!(
            Address::parse("example.com"),
            Err(AddrError::UnsupportedFamily(_))
        ));
        assert!(matches!(
            Address::parse("example.com:80"),
            Err(AddrError::UnsupportedFamily(_))
        ));
        assert!(matches!(
            Address::parse("/tmp/socket"),
            Err(AddrError::UnsupportedFamily(_))
        ));
        assert!(matches!(Address::parse("1.2.3"), Err(AddrError::Malformed(_))));
        assert!(matches!(
            Address::parse("10.0.0.1:99999"),
            Err(AddrError::Malformed(_))
        ));
        assert!(matches!(Address::parse("[::1"), Err(AddrError::Malformed(_))));
        assert!(matches!(Address::parse(""), Err(AddrError::Malformed(_))));
    }

    #[test]
    fn test_display_roundtrip() {
        for text in ["1.2.3.4", "1.2.3.4:80", "::1", "[fe80::1]:443"] {
            let addr = Address::parse(text).unwrap();
            assert_eq!(addr.to_string(), text);
        }
    }

    #[test]
    fn test_mapped_ipv4() {
        let addr = Address::parse("::ffff:1.2.3.4").unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(
            addr.canonical(),
            Address::V4(Ipv4Addr::new(1, 2, 3, 4), None)
        );
    }

    #[test]
    fn test_config_list_order() {
        let mut list = ConfigList::new();
        for i in 0..100 {
            let slot = list.push(i);
            *slot += 1;
        }
        assert_eq!(list.len(), 100);
        let collected: Vec<i32> = list.iter().copied().collect();
        assert_eq!(collected, (1..=100).collect::<Vec<_>>());
    }
}
