//! Лёгкий сканер протоколов исходящего буфера
//!
//! Находит в первом буфере соединения:
//! - TLS Client Hello и положение имени хоста в расширении SNI;
//! - HTTP запрос и положение значения заголовка `Host`.
//!
//! Кроме того, содержит перезапись TLS записи (разрез одной записи на
//! несколько) и модификации HTTP заголовка Host.
//!
//! Формат начала TLS Client Hello:
//! ```text
//! 0      1..3      3..5        5     6..9     9..11     11..43   43      44..
//! │ 0x16 │ version │ rec len │ 0x01 │ hs len │ version │ random │ sid len │ sid │
//! │ cipher suites (2 + n) │ compression (1 + n) │ extensions (2 + n) │
//! ```

use bitflags::bitflags;
use bytes::{BufMut, BytesMut};

/// Длина заголовка TLS записи
pub const TLS_RECORD_HEADER: usize = 5;

/// Тип записи TLS handshake
pub const TLS_HANDSHAKE: u8 = 0x16;

/// Тип записи TLS alert
pub const TLS_ALERT: u8 = 0x15;

/// Тип расширения server_name
pub const EXT_SERVER_NAME: u16 = 0x0000;

/// Тип расширения padding
pub const EXT_PADDING: u16 = 0x0015;

/// Тип расширения key_share
pub const EXT_KEY_SHARE: u16 = 0x0033;

/// Тип расширения supported_versions
pub const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;

/// Методы HTTP, по которым распознаётся запрос
const HTTP_METHODS: &[&[u8]] = &[
    b"HEAD", b"GET", b"POST", b"PUT", b"DELETE", b"OPTIONS", b"CONNECT", b"TRACE", b"PATCH",
];

bitflags! {
    /// Модификации HTTP заголовка Host
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HttpMod: u8 {
        /// Смешанный регистр имени заголовка (`hOsT:`)
        const HCSMIX  = 0b0000_0001;
        /// Смешанный регистр значения (`ExAmPlE.CoM`)
        const DCSMIX  = 0b0000_0010;
        /// Убрать пробел после двоеточия, дополнить табуляцией
        const RMSPACE = 0b0000_0100;
    }
}

impl HttpMod {
    /// Разобрать список `hcsmix,dcsmix,rmspace` (допускаются сокращения `h,d,r`)
    pub fn parse_list(text: &str) -> Option<Self> {
        let mut out = HttpMod::empty();
        for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            out |= match item {
                "h" | "hcsmix" => HttpMod::HCSMIX,
                "d" | "dcsmix" => HttpMod::DCSMIX,
                "r" | "rmspace" => HttpMod::RMSPACE,
                _ => return None,
            };
        }
        Some(out)
    }
}

/// Распознанный протокол буфера
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtoKind {
    /// Не распознан
    #[default]
    Unknown,
    /// HTTP запрос
    Http,
    /// TLS Client Hello
    Tls,
}

/// Положение имени хоста в буфере
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostField {
    /// Смещение первого байта имени
    pub pos: usize,
    /// Длина имени
    pub len: usize,
}

/// Подсказки протокола для движка: тип буфера и положение имени хоста
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtoHints {
    /// Тип буфера
    pub kind: ProtoKind,
    /// Имя хоста (SNI или Host), если найдено
    pub host: Option<HostField>,
}

impl ProtoHints {
    /// Просканировать буфер
    pub fn scan(buf: &[u8]) -> Self {
        if is_tls_client_hello(buf) {
            return Self {
                kind: ProtoKind::Tls,
                host: parse_tls_sni(buf),
            };
        }
        if is_http_request(buf) {
            return Self {
                kind: ProtoKind::Http,
                host: parse_http_host(buf).map(|h| h.field),
            };
        }
        Self::default()
    }

    /// Положение SNI (только для TLS)
    pub fn sni(&self) -> Option<HostField> {
        match self.kind {
            ProtoKind::Tls => self.host,
            _ => None,
        }
    }

    /// Положение значения Host (только для HTTP)
    pub fn http_host(&self) -> Option<HostField> {
        match self.kind {
            ProtoKind::Http => self.host,
            _ => None,
        }
    }

    /// Имя хоста как строка
    pub fn host_name<'a>(&self, buf: &'a [u8]) -> Option<&'a str> {
        let field = self.host?;
        let bytes = buf.get(field.pos..field.pos + field.len)?;
        std::str::from_utf8(bytes).ok()
    }

    /// Пересчитать положение после вставки заголовков TLS записей в точках `cuts`
    pub fn shifted(&self, cuts: &[usize]) -> Self {
        let host = self.host.map(|field| {
            let inserted = cuts.iter().filter(|&&c| c <= field.pos).count();
            HostField {
                pos: field.pos + inserted * TLS_RECORD_HEADER,
                len: field.len,
            }
        });
        Self {
            kind: self.kind,
            host,
        }
    }
}

/// Прочитать big-endian u16
#[inline]
pub fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    let b = buf.get(at..at + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

/// Записать big-endian u16 (паникует за пределами буфера)
#[inline]
pub fn write_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

/// Является ли буфер TLS Client Hello
pub fn is_tls_client_hello(buf: &[u8]) -> bool {
    buf.len() > 5 && buf[0] == TLS_HANDSHAKE && buf[1] == 0x03 && buf[5] == 0x01
}

/// Является ли буфер TLS Server Hello
pub fn is_tls_server_hello(buf: &[u8]) -> bool {
    buf.len() > 5 && buf[0] == TLS_HANDSHAKE && buf[1] == 0x03 && buf[5] == 0x02
}

/// Является ли буфер HTTP запросом
pub fn is_http_request(buf: &[u8]) -> bool {
    if buf.len() < 16 || !(b'C'..=b'T').contains(&buf[0]) {
        return false;
    }
    HTTP_METHODS
        .iter()
        .any(|m| buf.starts_with(m) && buf.get(m.len()) == Some(&b' '))
}

/// Найти смещение поля длины блока расширений в Hello сообщении
///
/// Работает и для Client Hello, и для Server Hello (у последнего один
/// cipher suite и один метод сжатия без полей длины).
pub fn find_ext_block(buf: &[u8]) -> Option<usize> {
    let sid_len = *buf.get(43)? as usize;
    let mut at = 44 + sid_len;

    if is_tls_server_hello(buf) {
        at += 3;
    } else {
        let cipher_len = read_u16(buf, at)? as usize;
        at += 2 + cipher_len;
        let comp_len = *buf.get(at)? as usize;
        at += 1 + comp_len;
    }

    if at + 2 > buf.len() {
        return None;
    }
    Some(at)
}

/// Найти расширение заданного типа; возвращает смещение его заголовка
pub fn find_tls_ext(buf: &[u8], ext_block: usize, ext_type: u16) -> Option<usize> {
    let block_len = read_u16(buf, ext_block)? as usize;
    let end = (ext_block + 2 + block_len).min(buf.len());

    let mut at = ext_block + 2;
    while at + 4 <= end {
        let kind = read_u16(buf, at)?;
        if kind == ext_type {
            return Some(at);
        }
        let len = read_u16(buf, at + 2)? as usize;
        at += 4 + len;
    }
    None
}

/// Найти имя хоста в SNI
pub fn parse_tls_sni(buf: &[u8]) -> Option<HostField> {
    if !is_tls_client_hello(buf) {
        return None;
    }
    let ext_block = find_ext_block(buf)?;
    let sni = find_tls_ext(buf, ext_block, EXT_SERVER_NAME)?;
    let len = read_u16(buf, sni + 7)? as usize;
    let pos = sni + 9;
    if len == 0 || pos + len > buf.len() {
        return None;
    }
    Some(HostField { pos, len })
}

/// Значение заголовка Host с необязательным портом
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpHost {
    /// Положение имени хоста (без скобок IPv6 и без порта)
    pub field: HostField,
    /// Порт из заголовка (80, если не указан)
    pub port: u16,
}

fn find_case_insensitive(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

/// Найти значение заголовка Host в HTTP запросе
pub fn parse_http_host(buf: &[u8]) -> Option<HttpHost> {
    if !is_http_request(buf) {
        return None;
    }
    let tag = b"\nHost:";
    let mut start = find_case_insensitive(buf, tag)? + tag.len();
    while buf.get(start) == Some(&b' ') || buf.get(start) == Some(&b'\t') {
        start += 1;
    }
    let line_end = start + buf[start..].iter().position(|&c| c == b'\n')?;
    let mut end = line_end;
    while end > start && buf[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    if end == start {
        return None;
    }

    // Необязательный :port в конце
    let mut digits = end;
    while digits > start && buf[digits - 1].is_ascii_digit() {
        digits -= 1;
    }
    let (mut host_end, port) = if digits > start && digits < end && buf[digits - 1] == b':' {
        let port: u16 = std::str::from_utf8(&buf[digits..end]).ok()?.parse().ok()?;
        if port == 0 {
            return None;
        }
        (digits - 1, port)
    } else {
        (end, 80)
    };

    let mut host_start = start;
    if buf[host_start] == b'[' {
        if host_end == 0 || buf[host_end - 1] != b']' {
            return None;
        }
        host_start += 1;
        host_end -= 1;
    }
    if host_end <= host_start {
        return None;
    }

    Some(HttpHost {
        field: HostField {
            pos: host_start,
            len: host_end - host_start,
        },
        port,
    })
}

/// Применить модификации заголовка Host к HTTP запросу
///
/// Длина буфера не меняется. Возвращает `false`, если Host не найден.
pub fn mod_http(buf: &mut [u8], mode: HttpMod) -> bool {
    let Some(host) = parse_http_host(buf) else {
        return false;
    };
    let HostField { pos, len } = host.field;

    // Начало имени заголовка: ищем ':' перед значением, затем 4 байта "Host"
    let Some(colon) = buf[..pos].iter().rposition(|&c| c == b':') else {
        return false;
    };
    if colon < 4 {
        return false;
    }
    let name = colon - 4;

    if mode.contains(HttpMod::HCSMIX) {
        buf[name] = buf[name].to_ascii_lowercase();
        buf[name + 1] = buf[name + 1].to_ascii_uppercase();
        buf[name + 3] = buf[name + 3].to_ascii_uppercase();
    }
    if mode.contains(HttpMod::DCSMIX) {
        for i in (pos..pos + len).step_by(2) {
            buf[i] = buf[i].to_ascii_uppercase();
        }
    }
    if mode.contains(HttpMod::RMSPACE) {
        // Значение целиком, вместе с '[' у IPv6 адреса
        let mut value = colon + 1;
        while value < pos && buf[value].is_ascii_whitespace() {
            value += 1;
        }
        let gap = value - (colon + 1);
        if gap > 0 {
            let mut value_end = value;
            while value_end < buf.len() && !buf[value_end].is_ascii_whitespace() {
                value_end += 1;
            }
            let value_len = value_end - value;
            buf.copy_within(value..value_end, colon + 1);
            buf[colon + 1 + value_len..colon + 1 + value_len + gap].fill(b'\t');
        }
    }
    true
}

/// Является ли ответ TLS alert записью
pub fn is_tls_alert(resp: &[u8]) -> bool {
    resp.len() >= 7 && resp[0] == TLS_ALERT && resp[1] == 0x03
}

/// Ответил ли сервер Server Hello с чужим session id
///
/// Сервер TLS 1.3 обязан вернуть session id клиента. Несовпадение означает,
/// что ответил не настоящий сервер. Если `req` не Client Hello или `resp`
/// не Server Hello, возвращает `false`.
pub fn tls_session_id_mismatch(req: &[u8], resp: &[u8]) -> bool {
    if !is_tls_client_hello(req) || !is_tls_server_hello(resp) {
        return false;
    }
    let (Some(&req_len), Some(&resp_len)) = (req.get(43), resp.get(43)) else {
        return false;
    };
    let (req_len, resp_len) = (req_len as usize, resp_len as usize);
    match (req.get(44..44 + req_len), resp.get(44..44 + resp_len)) {
        (Some(a), Some(b)) => req_len > 0 && a != b,
        _ => false,
    }
}

/// Является ли буфер началом TLS записи (любого типа)
pub fn is_tls_record(buf: &[u8]) -> bool {
    buf.len() >= TLS_RECORD_HEADER && (0x14..=0x17).contains(&buf[0]) && buf[1] == 0x03
}

/// Разрезать первую TLS запись буфера в точках `cuts` (смещения от начала буфера)
///
/// Каждая точка должна лежать строго внутри тела записи, точки строго
/// возрастают. Каждый новый фрагмент получает собственный 5-байтовый заголовок
/// с корректной длиной. Байты за пределами первой записи копируются как есть.
pub fn split_tls_record(buf: &[u8], cuts: &[usize]) -> Option<BytesMut> {
    if !is_tls_record(buf) || cuts.is_empty() {
        return None;
    }
    let body_len = read_u16(buf, 3)? as usize;
    let body_end = (TLS_RECORD_HEADER + body_len).min(buf.len());

    let mut prev = TLS_RECORD_HEADER;
    for &cut in cuts {
        if cut <= prev || cut >= body_end {
            return None;
        }
        prev = cut;
    }

    let mut out = BytesMut::with_capacity(buf.len() + cuts.len() * TLS_RECORD_HEADER);
    let mut prev = TLS_RECORD_HEADER;
    for &cut in cuts {
        out.put_slice(&buf[..3]);
        out.put_u16((cut - prev) as u16);
        out.put_slice(&buf[prev..cut]);
        prev = cut;
    }
    out.put_slice(&buf[..3]);
    out.put_u16((TLS_RECORD_HEADER + body_len - prev) as u16);
    out.put_slice(&buf[prev..]);
    Some(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Минимальный Client Hello с SNI `host`
    pub(crate) fn client_hello(host: &str) -> Vec<u8> {
        let name = host.as_bytes();
        let mut ext = Vec::new();
        // server_name
        ext.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        ext.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
        ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        ext.push(0);
        ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
        ext.extend_from_slice(name);
        // supported_versions
        ext.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);

        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]);
        hello.extend_from_slice(&[0x11; 32]);
        hello.push(32);
        hello.extend_from_slice(&[0x22; 32]);
        hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
        hello.extend_from_slice(&[0x01, 0x00]);
        hello.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        hello.extend_from_slice(&ext);

        let mut hs = vec![0x01];
        hs.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        hs.extend_from_slice(&hello);

        let mut rec = vec![TLS_HANDSHAKE, 0x03, 0x01];
        rec.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        rec.extend_from_slice(&hs);
        rec
    }

    #[test]
    fn test_tls_sni() {
        let buf = client_hello("example.com");
        assert!(is_tls_client_hello(&buf));
        let hints = ProtoHints::scan(&buf);
        assert_eq!(hints.kind, ProtoKind::Tls);
        assert_eq!(hints.host_name(&buf), Some("example.com"));
        assert!(hints.sni().is_some());
        assert!(hints.http_host().is_none());
    }

    #[test]
    fn test_truncated_client_hello() {
        let buf = client_hello("example.com");
        let cut = &buf[..60];
        let hints = ProtoHints::scan(cut);
        assert_eq!(hints.kind, ProtoKind::Tls);
        assert!(hints.host.is_none());
    }

    #[test]
    fn test_http_host() {
        let buf = b"GET / HTTP/1.1\r\nHost: example.com:8080\r\nAccept: */*\r\n\r\n";
        let host = parse_http_host(buf).unwrap();
        assert_eq!(host.port, 8080);
        assert_eq!(
            &buf[host.field.pos..host.field.pos + host.field.len],
            b"example.com"
        );

        let buf = b"POST /x HTTP/1.1\r\nhost:[::1]\r\n\r\n";
        let host = parse_http_host(buf).unwrap();
        assert_eq!(host.port, 80);
        assert_eq!(&buf[host.field.pos..host.field.pos + host.field.len], b"::1");
    }

    #[test]
    fn test_not_http() {
        assert!(!is_http_request(b"GETTING / HTTP/1.1\r\n"));
        assert!(!is_http_request(b"\x16\x03\x01\x00\x10 something long"));
        assert_eq!(ProtoHints::scan(b"random bytes here!!").kind, ProtoKind::Unknown);
    }

    #[test]
    fn test_mod_http() {
        let mut buf = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec();
        assert!(mod_http(&mut buf, HttpMod::all()));
        assert_eq!(&buf[..], &b"GET / HTTP/1.1\r\nhOsT:ExAmPlE.CoM\t\r\n\r\n"[..]);

        let mut buf = b"GET / HTTP/1.1\r\nHost: [::1]:8080\r\n\r\n".to_vec();
        assert!(mod_http(&mut buf, HttpMod::RMSPACE));
        assert_eq!(&buf[..], &b"GET / HTTP/1.1\r\nHost:[::1]:8080\t\r\n\r\n"[..]);
    }

    #[test]
    fn test_http_mod_list() {
        assert_eq!(
            HttpMod::parse_list("hcsmix,r").unwrap(),
            HttpMod::HCSMIX | HttpMod::RMSPACE
        );
        assert!(HttpMod::parse_list("bogus").is_none());
    }

    #[test]
    fn test_split_tls_record() {
        let buf = client_hello("example.com");
        let body_len = read_u16(&buf, 3).unwrap() as usize;
        let out = split_tls_record(&buf, &[10, 40]).unwrap();
        assert_eq!(out.len(), buf.len() + 10);

        // Три записи, тела в сумме равны исходному
        let mut at = 0;
        let mut total = 0;
        let mut body = Vec::new();
        while at < out.len() {
            assert_eq!(out[at], TLS_HANDSHAKE);
            let len = read_u16(&out, at + 3).unwrap() as usize;
            body.extend_from_slice(&out[at + 5..at + 5 + len]);
            total += len;
            at += 5 + len;
        }
        assert_eq!(at, out.len());
        assert_eq!(total, body_len);
        assert_eq!(body, buf[5..].to_vec());
    }

    #[test]
    fn test_split_tls_record_bounds() {
        let buf = client_hello("example.com");
        assert!(split_tls_record(&buf, &[5]).is_none());
        assert!(split_tls_record(&buf, &[buf.len()]).is_none());
        assert!(split_tls_record(&buf, &[20, 10]).is_none());
        assert!(split_tls_record(b"GET / HTTP/1.1\r\n", &[8]).is_none());
    }

    #[test]
    fn test_tls_responses() {
        let req = client_hello("example.com");
        let mut resp = req.clone();
        resp[5] = 0x02;
        assert!(!tls_session_id_mismatch(&req, &resp));
        resp[50] ^= 0xff;
        assert!(tls_session_id_mismatch(&req, &resp));

        assert!(is_tls_alert(&[0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x28]));
        assert!(!is_tls_alert(&resp));
    }

    #[test]
    fn test_hints_shift() {
        let hints = ProtoHints {
            kind: ProtoKind::Tls,
            host: Some(HostField { pos: 100, len: 10 }),
        };
        assert_eq!(hints.shifted(&[50, 100, 120]).host.unwrap().pos, 110);
    }
}
