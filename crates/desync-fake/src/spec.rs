//! Параметры подложного пакета
//!
//! [`FakePacketSpec`] собирается один раз при загрузке конфигурации и дальше
//! не меняется. Файлы payload читаются сразу, строковые payload декодируются
//! сразу.

use bitflags::bitflags;
use bytes::Bytes;
use std::path::PathBuf;

use desync_core::PositionSpec;

use crate::error::FakeError;
use crate::sni::SniTemplate;

/// TTL по умолчанию
pub const DEFAULT_TTL: u8 = desync_core::engine::DEFAULT_FAKE_TTL;

bitflags! {
    /// Режимы модификации подложного Client Hello
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TlsMod: u8 {
        /// Случайные random, session id и key_share
        const RAND = 0b0000_0001;
        /// Основа приманки: настоящий Client Hello соединения
        const ORIG = 0b0000_0010;
    }
}

impl TlsMod {
    /// Разобрать список `rand,orig` (допускаются `r,o`)
    pub fn parse_list(text: &str) -> Result<Self, FakeError> {
        let mut out = TlsMod::empty();
        for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            out |= match item {
                "r" | "rand" => TlsMod::RAND,
                "o" | "orig" => TlsMod::ORIG,
                other => return Err(FakeError::UnknownTlsMod(other.to_string())),
            };
        }
        Ok(out)
    }
}

/// Загруженный пользовательский payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSource {
    /// Строка из конфигурации (`:GET / ...`), escape-последовательности раскрыты
    Literal(Bytes),
    /// Содержимое файла
    File {
        /// Путь к файлу
        path: PathBuf,
        /// Прочитанные байты
        data: Bytes,
    },
}

impl PayloadSource {
    /// Загрузить payload: префикс `:` означает строку, иначе путь к файлу
    pub fn load(text: &str) -> Result<Self, FakeError> {
        match text.strip_prefix(':') {
            Some(literal) => Ok(PayloadSource::Literal(Bytes::from(decode_escapes(literal)?))),
            None => {
                let path = PathBuf::from(text);
                let data = std::fs::read(&path).map_err(|source| FakeError::PayloadUnreadable {
                    path: text.to_string(),
                    source,
                })?;
                Ok(PayloadSource::File {
                    path,
                    data: Bytes::from(data),
                })
            }
        }
    }

    /// Байты payload
    pub fn bytes(&self) -> &Bytes {
        match self {
            PayloadSource::Literal(data) | PayloadSource::File { data, .. } => data,
        }
    }
}

/// Раскрыть escape-последовательности C: `\n \r \t \\ \" \' \xHH \ooo`
pub fn decode_escapes(text: &str) -> Result<Vec<u8>, FakeError> {
    let bad = || FakeError::BadEscape(text.to_string());
    let src = text.as_bytes();
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;

    while i < src.len() {
        if src[i] != b'\\' {
            out.push(src[i]);
            i += 1;
            continue;
        }
        let esc = *src.get(i + 1).ok_or_else(bad)?;
        i += 2;
        match esc {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'\\' | b'"' | b'\'' => out.push(esc),
            b'x' => {
                let hex = src.get(i..i + 2).ok_or_else(bad)?;
                let hex = std::str::from_utf8(hex).map_err(|_| bad())?;
                out.push(u8::from_str_radix(hex, 16).map_err(|_| bad())?);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut value = (esc - b'0') as u32;
                let mut taken = 0;
                while taken < 2 && matches!(src.get(i), Some(b'0'..=b'7')) {
                    value = value * 8 + (src[i] - b'0') as u32;
                    i += 1;
                    taken += 1;
                }
                out.push(u8::try_from(value).map_err(|_| bad())?);
            }
            _ => return Err(bad()),
        }
    }
    Ok(out)
}

/// Параметры построения приманки
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakePacketSpec {
    /// TTL приманки (1..=255)
    pub ttl: u8,
    /// Шаблон подложного SNI / Host
    pub sni: Option<SniTemplate>,
    /// Пользовательский payload вместо встроенного шаблона
    pub payload: Option<PayloadSource>,
    /// TCP опция MD5 signature
    pub md5sig: bool,
    /// Режим модификации Client Hello
    pub tls_mod: TlsMod,
    /// Откуда в приманке начинаются отправляемые байты
    pub offset: Option<PositionSpec>,
    /// Зерно генератора для воспроизводимых приманок
    pub seed: Option<u64>,
}

impl Default for FakePacketSpec {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            sni: None,
            payload: None,
            md5sig: false,
            tls_mod: TlsMod::empty(),
            offset: None,
            seed: None,
        }
    }
}

impl FakePacketSpec {
    /// Создать спецификацию с параметрами по умолчанию
    pub fn new() -> Self {
        Self::default()
    }

    /// Задать TTL с проверкой диапазона
    pub fn with_ttl(mut self, ttl: i64) -> Result<Self, FakeError> {
        self.ttl = u8::try_from(ttl)
            .ok()
            .filter(|&t| t != 0)
            .ok_or(FakeError::InvalidTtl(ttl))?;
        Ok(self)
    }

    /// Задать шаблон SNI
    pub fn with_sni(mut self, pattern: &str) -> Result<Self, FakeError> {
        self.sni = Some(SniTemplate::parse(pattern)?);
        Ok(self)
    }

    /// Задать payload (`:строка` или путь)
    pub fn with_payload(mut self, source: &str) -> Result<Self, FakeError> {
        self.payload = Some(PayloadSource::load(source)?);
        Ok(self)
    }

    /// Задать зерно генератора
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes() {
        assert_eq!(
            decode_escapes(r"GET / HTTP/1.1\r\nX: \x41\101\t\\\'").unwrap(),
            b"GET / HTTP/1.1\r\nX: AA\t\\'".to_vec()
        );
        assert_eq!(decode_escapes(r"\0").unwrap(), vec![0]);
        for bad in [r"\", r"\q", r"\x4", r"\xzz", r"\777"] {
            assert!(decode_escapes(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_payload_sources() {
        let literal = PayloadSource::load(":abc\\n").unwrap();
        assert_eq!(literal.bytes().as_ref(), b"abc\n");

        let path = std::env::temp_dir().join("desync-fake-payload.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let file = PayloadSource::load(path.to_str().unwrap()).unwrap();
        assert_eq!(file.bytes().as_ref(), &[1, 2, 3]);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            PayloadSource::load("/nonexistent/fake.bin"),
            Err(FakeError::PayloadUnreadable { .. })
        ));
    }

    #[test]
    fn test_ttl_range() {
        assert_eq!(FakePacketSpec::new().ttl, 8);
        assert_eq!(FakePacketSpec::new().with_ttl(255).unwrap().ttl, 255);
        assert!(FakePacketSpec::new().with_ttl(0).is_err());
        assert!(FakePacketSpec::new().with_ttl(256).is_err());
    }

    #[test]
    fn test_tls_mod() {
        assert_eq!(TlsMod::parse_list("rand,orig").unwrap(), TlsMod::all());
        assert_eq!(TlsMod::parse_list("r").unwrap(), TlsMod::RAND);
        assert!(TlsMod::parse_list("x").is_err());
    }
}
