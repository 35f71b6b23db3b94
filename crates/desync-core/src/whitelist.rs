//! Фильтры допуска соединений к desync
//!
//! Все категории (протоколы, хосты, подсети, порты) объединяются логическим И;
//! ненастроенная категория пропускает всё. Номер запроса (`round`) проверяется
//! отдельно от адресных фильтров.
//!
//! После загрузки фильтры не изменяются и не требуют синхронизации.

use bitflags::bitflags;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::addr::{Address, ConfigList};
use crate::error::ConfigError;
use crate::proto::ProtoKind;

/// Источник списка: встроенный текст (`:a.com b.com`) или путь к файлу
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListSource {
    /// Содержимое задано прямо в конфигурации
    Inline(String),
    /// Путь к файлу, по одной записи в строке
    File(PathBuf),
}

impl ListSource {
    /// Разобрать ссылку на список: префикс `:` означает встроенный текст
    pub fn parse(text: &str) -> Self {
        match text.strip_prefix(':') {
            Some(inline) => ListSource::Inline(inline.to_string()),
            None => ListSource::File(PathBuf::from(text)),
        }
    }

    /// Загрузить содержимое
    pub fn load(&self) -> Result<String, ConfigError> {
        match self {
            ListSource::Inline(text) => Ok(text.clone()),
            ListSource::File(path) => {
                std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
                    path: path.display().to_string(),
                    source,
                })
            }
        }
    }

    fn label(&self) -> String {
        match self {
            ListSource::Inline(_) => "inline".to_string(),
            ListSource::File(path) => path.display().to_string(),
        }
    }
}

/// Записи списка: разделители: пробелы и запятые, `#` начинает комментарий
fn entries(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .flat_map(|line| line.split(|c: char| c.is_whitespace() || c == ','))
        .filter(|item| !item.is_empty())
}

/// Набор имён хостов с совпадением по суффиксу на границе метки
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSet {
    names: HashSet<String>,
}

impl HostSet {
    /// Создать пустой набор
    pub fn new() -> Self {
        Self::default()
    }

    /// Разобрать набор из текста
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut set = Self::new();
        for item in entries(text) {
            set.insert(item)?;
        }
        Ok(set)
    }

    /// Загрузить набор из источника, пустой список не допускается
    pub fn load(source: &ListSource) -> Result<Self, ConfigError> {
        let set = Self::parse(&source.load()?)?;
        if set.is_empty() {
            return Err(ConfigError::EmptyList(source.label()));
        }
        Ok(set)
    }

    /// Добавить имя
    pub fn insert(&mut self, name: &str) -> Result<(), ConfigError> {
        let name = name.trim_start_matches('.').to_ascii_lowercase();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(ConfigError::InvalidHost(name));
        }
        self.names.insert(name);
        Ok(())
    }

    /// Совпадает ли хост с одним из имён точно или как поддомен
    pub fn contains(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let mut rest = host.as_str();
        loop {
            if self.names.contains(rest) {
                return true;
            }
            match rest.split_once('.') {
                Some((_, parent)) => rest = parent,
                None => return false,
            }
        }
    }

    /// Количество имён
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Пуст ли набор
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Подсеть `addr/bits`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    network: IpAddr,
    bits: u8,
}

impl Cidr {
    /// Разобрать `ip` или `ip/bits`
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidCidr(text.to_string());
        let (ip, bits) = match text.split_once('/') {
            Some((ip, bits)) => (ip, Some(bits)),
            None => (text, None),
        };
        let addr = Address::parse(ip).map_err(|_| invalid())?;
        if addr.port().is_some() {
            return Err(invalid());
        }
        let network = canonical_ip(addr.ip());
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let bits = match bits {
            Some(b) => b.parse::<u8>().ok().filter(|&b| b <= max).ok_or_else(invalid)?,
            None => max,
        };
        Ok(Self { network, bits })
    }

    /// Принадлежит ли адрес подсети
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, canonical_ip(ip)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.bits as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.bits as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.bits)
    }
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Список подсетей
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpSet {
    ranges: ConfigList<Cidr>,
}

impl IpSet {
    /// Разобрать список подсетей
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut ranges = ConfigList::new();
        for item in entries(text) {
            ranges.push(Cidr::parse(item)?);
        }
        Ok(Self { ranges })
    }

    /// Загрузить из источника, пустой список не допускается
    pub fn load(source: &ListSource) -> Result<Self, ConfigError> {
        let set = Self::parse(&source.load()?)?;
        if set.ranges.is_empty() {
            return Err(ConfigError::EmptyList(source.label()));
        }
        Ok(set)
    }

    /// Принадлежит ли адрес хотя бы одной подсети
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.ranges.iter().any(|cidr| cidr.contains(ip))
    }

    /// Количество подсетей
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Пуст ли список
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Включительный диапазон портов
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    /// Нижняя граница
    pub lo: u16,
    /// Верхняя граница
    pub hi: u16,
}

impl PortRange {
    /// Принадлежит ли порт диапазону
    pub fn contains(&self, port: u16) -> bool {
        (self.lo..=self.hi).contains(&port)
    }
}

impl FromStr for PortRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPortRange(s.to_string());
        let port = |p: &str| p.trim().parse::<u16>().ok().filter(|&p| p != 0);
        let (lo, hi) = match s.split_once('-') {
            Some((lo, hi)) => (port(lo).ok_or_else(invalid)?, port(hi).ok_or_else(invalid)?),
            None => {
                let p = port(s).ok_or_else(invalid)?;
                (p, p)
            }
        };
        if lo > hi {
            return Err(invalid());
        }
        Ok(Self { lo, hi })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lo == self.hi {
            write!(f, "{}", self.lo)
        } else {
            write!(f, "{}-{}", self.lo, self.hi)
        }
    }
}

bitflags! {
    /// Теги протоколов фильтра
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProtocolSet: u8 {
        /// TLS Client Hello
        const TLS  = 0b0000_0001;
        /// HTTP запрос
        const HTTP = 0b0000_0010;
        /// UDP датаграмма
        const UDP  = 0b0000_0100;
        /// Только IPv4 назначение
        const IPV4 = 0b0000_1000;
    }
}

impl FromStr for ProtocolSet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = ProtocolSet::empty();
        for item in entries(s) {
            out |= match item.to_ascii_lowercase().as_str() {
                "t" | "tls" => ProtocolSet::TLS,
                "h" | "http" => ProtocolSet::HTTP,
                "u" | "udp" => ProtocolSet::UDP,
                "i" | "ipv4" => ProtocolSet::IPV4,
                _ => return Err(ConfigError::UnknownProtocol(item.to_string())),
            };
        }
        Ok(out)
    }
}

/// Транспорт соединения
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transport {
    /// TCP поток
    #[default]
    Tcp,
    /// UDP датаграммы
    Udp,
}

/// Диапазон номеров запросов в соединении, к которым применяется desync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoundRange {
    /// Первый номер (с единицы)
    pub lo: u32,
    /// Последний номер
    pub hi: u32,
}

impl Default for RoundRange {
    fn default() -> Self {
        Self { lo: 1, hi: 1 }
    }
}

impl RoundRange {
    /// Попадает ли номер запроса в диапазон
    pub fn allows(&self, ordinal: u32) -> bool {
        (self.lo..=self.hi).contains(&ordinal)
    }
}

impl FromStr for RoundRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidRound(s.to_string());
        let num = |p: &str| p.trim().parse::<u32>().ok().filter(|&n| n != 0);
        let (lo, hi) = match s.split_once('-') {
            Some((lo, hi)) => (num(lo).ok_or_else(invalid)?, num(hi).ok_or_else(invalid)?),
            None => {
                let n = num(s).ok_or_else(invalid)?;
                (n, n)
            }
        };
        if lo > hi {
            return Err(invalid());
        }
        Ok(Self { lo, hi })
    }
}

/// Сведения о соединении для проверки фильтров
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo<'a> {
    /// Адрес назначения
    pub dst: Address,
    /// Транспорт
    pub transport: Transport,
    /// Тип первого буфера
    pub kind: ProtoKind,
    /// Имя хоста из SNI / Host, если найдено
    pub host: Option<&'a str>,
}

/// Набор фильтров допуска
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    /// Фильтр протоколов
    pub protocols: Option<ProtocolSet>,
    /// Фильтр хостов
    pub hosts: Option<HostSet>,
    /// Фильтр подсетей
    pub ips: Option<IpSet>,
    /// Фильтр портов
    pub ports: Option<ConfigList<PortRange>>,
    /// Диапазон номеров запросов
    pub rounds: RoundRange,
}

impl Whitelist {
    /// Пропускает ли фильтр соединение
    pub fn eligible(&self, conn: &ConnInfo<'_>) -> bool {
        self.protocol_matches(conn)
            && self.ips.as_ref().map_or(true, |set| set.contains(conn.dst.ip()))
            && self.port_matches(conn.dst.port())
            && self.host_matches(conn.host)
    }

    /// Попадает ли номер запроса в настроенный диапазон
    pub fn round_allows(&self, ordinal: u32) -> bool {
        self.rounds.allows(ordinal)
    }

    fn protocol_matches(&self, conn: &ConnInfo<'_>) -> bool {
        let Some(set) = self.protocols else {
            return true;
        };
        if set.contains(ProtocolSet::IPV4) && !conn.dst.is_ipv4() {
            return false;
        }
        let payload = set & (ProtocolSet::TLS | ProtocolSet::HTTP | ProtocolSet::UDP);
        if payload.is_empty() {
            return true;
        }
        match (conn.transport, conn.kind) {
            (Transport::Udp, _) => payload.contains(ProtocolSet::UDP),
            (Transport::Tcp, ProtoKind::Tls) => payload.contains(ProtocolSet::TLS),
            (Transport::Tcp, ProtoKind::Http) => payload.contains(ProtocolSet::HTTP),
            (Transport::Tcp, ProtoKind::Unknown) => false,
        }
    }

    fn port_matches(&self, port: Option<u16>) -> bool {
        match (&self.ports, port) {
            (None, _) => true,
            (Some(ranges), Some(port)) => ranges.iter().any(|r| r.contains(port)),
            (Some(_), None) => false,
        }
    }

    fn host_matches(&self, host: Option<&str>) -> bool {
        match (&self.hosts, host) {
            (None, _) => true,
            (Some(set), Some(host)) => set.contains(host),
            (Some(_), None) => false,
        }
    }
}
