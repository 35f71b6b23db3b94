//! Профили desync и параметры автоподбора
//!
//! Профиль это набор позиций, приманка и параметры движка. Профили пробуются по
//! очереди; метки детекторов профиля задают, какие сигналы неудачи
//! распознаются.

use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use desync_core::engine::{Decoy, DesyncEngine, EngineOptions};
use desync_core::{PositionSpec, ProtoHints, Technique};
use desync_fake::FakeGenerator;
use tracing::warn;

use crate::error::{AutoError, Result};

bitflags! {
    /// Метки сигналов неудачи, по которым профиль уступает место следующему
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DetectSet: u8 {
        /// Сброс соединения или таймаут
        const TORST    = 0b0000_0001;
        /// HTTP редирект на чужой домен
        const REDIRECT = 0b0000_0010;
        /// TLS alert или чужой session id
        const SSL_ERR  = 0b0000_0100;
    }
}

impl DetectSet {
    /// Разобрать список `torst,redirect,ssl_err,none`
    pub fn parse_list(text: &str) -> Result<Self> {
        let mut out = DetectSet::empty();
        for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            out |= match item {
                "t" | "torst" => DetectSet::TORST,
                "r" | "redirect" => DetectSet::REDIRECT,
                "s" | "ssl_err" => DetectSet::SSL_ERR,
                "n" | "none" => DetectSet::empty(),
                other => return Err(AutoError::UnknownDetect(other.to_string())),
            };
        }
        Ok(out)
    }
}

impl fmt::Display for DetectSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = [
            (DetectSet::TORST, "torst"),
            (DetectSet::REDIRECT, "redirect"),
            (DetectSet::SSL_ERR, "ssl_err"),
        ]
        .into_iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, name)| name)
        .collect();
        f.write_str(&names.join(","))
    }
}

bitflags! {
    /// Режим автоподбора
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AutoMode: u8 {
        /// Учитывать сигналы, пришедшие после первого ответа
        const POST_RESP = 0b0000_0001;
        /// Сортировать кандидатов по доле успехов
        const SORT      = 0b0000_0010;
    }
}

impl AutoMode {
    /// Разобрать список `post_resp,sort` (допускаются `p,s`)
    pub fn parse_list(text: &str) -> Result<Self> {
        let mut out = AutoMode::empty();
        for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            out |= match item {
                "p" | "post_resp" => AutoMode::POST_RESP,
                "s" | "sort" => AutoMode::SORT,
                other => return Err(AutoError::UnknownMode(other.to_string())),
            };
        }
        Ok(out)
    }
}

/// Профиль desync
#[derive(Debug, Clone)]
pub struct DesyncProfile {
    /// Номер профиля (порядок в конфигурации)
    pub id: usize,
    /// Позиции в порядке применения
    pub parts: Vec<PositionSpec>,
    /// Генератор приманок для техники fake и флага `n`
    pub fake: Option<Arc<FakeGenerator>>,
    /// Параметры движка
    pub options: EngineOptions,
    /// Сигналы, по которым профиль признаётся неудачным
    pub detect: DetectSet,
}

impl DesyncProfile {
    /// Создать профиль без приманки
    pub fn new(id: usize, parts: Vec<PositionSpec>) -> Self {
        Self {
            id,
            parts,
            fake: None,
            options: EngineOptions::default(),
            detect: DetectSet::empty(),
        }
    }

    /// Проверить профиль
    pub fn validate(&self) -> Result<()> {
        let uses_fake = self.parts.iter().any(|p| p.technique == Technique::Fake);
        if uses_fake && self.fake.is_none() {
            return Err(AutoError::FakeWithoutSpec(self.id));
        }
        if self.parts.is_empty() && self.options.udp_fakes == 0 && self.options.http_mod.is_empty() {
            return Err(AutoError::EmptyProfile(self.id));
        }
        Ok(())
    }

    /// Движок с параметрами профиля
    pub fn engine(&self) -> DesyncEngine {
        DesyncEngine::new(self.options)
    }

    /// Построить приманку для буфера; ошибка генератора только логируется
    pub fn decoy(&self, buffer: &[u8], hints: &ProtoHints) -> Option<Decoy> {
        let generator = self.fake.as_ref()?;
        match generator.decoy(buffer, hints) {
            Ok(decoy) => Some(decoy),
            Err(err) => {
                warn!("profile {}: fake: {}", self.id, err);
                None
            }
        }
    }

    /// Позиции в канонической текстовой форме
    pub fn describe(&self) -> String {
        self.parts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Параметры автоподбора
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoConfig {
    /// Режим
    pub mode: AutoMode,
    /// Время жизни записи кэша, секунды
    pub cache_ttl: u64,
    /// Число неудач подряд, после которого запись кэша удаляется
    pub fail_threshold: u32,
    /// Ожидание ответа; `None` без таймаута
    pub timeout: Option<Duration>,
    /// Учитывать порт в ключе кэша
    pub cache_by_port: bool,
}

impl Default for AutoConfig {
    fn default() -> Self {
        Self {
            mode: AutoMode::empty(),
            cache_ttl: 100_800,
            fail_threshold: 3,
            timeout: None,
            cache_by_port: false,
        }
    }
}

/// Объединение меток всех профилей: множество распознаваемых сигналов
pub fn recognized(profiles: &[DesyncProfile]) -> DetectSet {
    profiles
        .iter()
        .fold(DetectSet::empty(), |acc, p| acc | p.detect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use desync_fake::FakePacketSpec;

    #[test]
    fn test_detect_list() {
        assert_eq!(
            DetectSet::parse_list("torst,ssl_err").unwrap(),
            DetectSet::TORST | DetectSet::SSL_ERR
        );
        assert_eq!(DetectSet::parse_list("none").unwrap(), DetectSet::empty());
        assert!(DetectSet::parse_list("bogus").is_err());
        assert_eq!(DetectSet::all().to_string(), "torst,redirect,ssl_err");
        assert_eq!(DetectSet::empty().to_string(), "none");
    }

    #[test]
    fn test_auto_mode() {
        assert_eq!(AutoMode::parse_list("post_resp,sort").unwrap(), AutoMode::all());
        assert!(AutoMode::parse_list("x").is_err());
    }

    #[test]
    fn test_validate() {
        let parts = vec!["fake=1".parse().unwrap()];
        let mut profile = DesyncProfile::new(3, parts);
        assert!(matches!(profile.validate(), Err(AutoError::FakeWithoutSpec(3))));

        profile.fake = Some(Arc::new(FakeGenerator::new(FakePacketSpec::new())));
        assert!(profile.validate().is_ok());
        assert!(profile.decoy(b"", &ProtoHints::default()).is_some());

        assert!(matches!(
            DesyncProfile::new(1, Vec::new()).validate(),
            Err(AutoError::EmptyProfile(1))
        ));
    }

    #[test]
    fn test_recognized_union() {
        let mut a = DesyncProfile::new(0, vec!["1".parse().unwrap()]);
        a.detect = DetectSet::TORST;
        let mut b = DesyncProfile::new(1, vec!["2".parse().unwrap()]);
        b.detect = DetectSet::REDIRECT;
        assert_eq!(recognized(&[a, b]), DetectSet::TORST | DetectSet::REDIRECT);
    }

    #[test]
    fn test_describe() {
        let profile = DesyncProfile::new(0, vec!["1+s".parse().unwrap(), "disorder=-1".parse().unwrap()]);
        assert_eq!(profile.describe(), "split=1+s disorder=-1");
    }
}
