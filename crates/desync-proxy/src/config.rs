//! Конфигурация desync прокси
//!
//! Этот модуль отвечает за загрузку конфигурации и превращение строк из
//! TOML в проверенные объекты: фильтры, профили и параметры автоподбора.

use anyhow::Context;
use desync_auto::{AutoConfig, AutoMode, DesyncProfile, DetectSet};
use desync_core::whitelist::{HostSet, IpSet, ListSource, PortRange, ProtocolSet, RoundRange};
use desync_core::{ConfigList, HttpMod, PositionSpec, Technique, Whitelist};
use desync_fake::spec::decode_escapes;
use desync_fake::{FakeGenerator, FakePacketSpec, TlsMod};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

/// Конфигурация прокси
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Настройки логирования
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Настройки автоподбора и кэша
    #[serde(default)]
    pub auto: AutoSection,

    /// Фильтры допуска
    #[serde(default)]
    pub whitelist: WhitelistConfig,

    /// Профили в порядке перебора
    #[serde(default = "default_profiles", rename = "profile")]
    pub profiles: Vec<ProfileConfig>,
}

/// Настройки логирования
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Уровень логирования (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Настройки автоподбора
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoSection {
    /// Режим: `post_resp`, `sort` через запятую
    #[serde(default)]
    pub mode: String,

    /// Время жизни записи кэша (секунды)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Неудач подряд до удаления записи
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,

    /// Ожидание ответа сервера (миллисекунды, 0 без таймаута)
    #[serde(default)]
    pub timeout_ms: u64,

    /// Учитывать порт в ключе кэша
    #[serde(default)]
    pub cache_by_port: bool,

    /// Файл дампа кэша (пусто: без дампа)
    #[serde(default)]
    pub cache_dump: String,

    /// Интервал очистки устаревших записей (секунды)
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

/// Фильтры допуска; пустое поле означает «все»
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistConfig {
    /// Протоколы: `tls,http,udp,ipv4`
    #[serde(default)]
    pub protocols: String,

    /// Хосты: путь к файлу или `:список`
    #[serde(default)]
    pub hosts: String,

    /// Подсети: путь к файлу или `:список`
    #[serde(default)]
    pub ipset: String,

    /// Диапазоны портов (`443`, `8000-8100`)
    #[serde(default)]
    pub ports: Vec<String>,

    /// Номера запросов, к которым применяется desync (`1`, `1-3`)
    #[serde(default = "default_rounds")]
    pub rounds: String,
}

/// Профиль desync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Позиции `техника=позиция`
    #[serde(default)]
    pub parts: Vec<String>,

    /// Сигналы неудачи: `torst,redirect,ssl_err,none`
    #[serde(default = "default_detect")]
    pub detect: String,

    /// Байт OOB (один символ или escape)
    #[serde(default = "default_oob_data")]
    pub oob_data: String,

    /// Модификации HTTP: `hcsmix,dcsmix,rmspace`
    #[serde(default)]
    pub http_mod: String,

    /// Число UDP приманок перед датаграммой
    #[serde(default)]
    pub udp_fakes: u32,

    /// Параметры приманки
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fake: Option<FakeConfig>,
}

/// Параметры приманки
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FakeConfig {
    /// TTL приманки
    #[serde(default = "default_fake_ttl")]
    pub ttl: i64,

    /// Шаблон SNI (`?` буква, `#` цифра, `*` любой)
    #[serde(default)]
    pub sni: String,

    /// Payload: путь к файлу или `:строка`
    #[serde(default)]
    pub payload: String,

    /// TCP опция MD5 signature
    #[serde(default)]
    pub md5sig: bool,

    /// `rand`, `orig`
    #[serde(default)]
    pub tls_mod: String,

    /// Смещение отправляемых байт в приманке
    #[serde(default)]
    pub offset: String,

    /// Зерно генератора
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Проверенные объекты для запуска
#[derive(Debug)]
pub struct Runtime {
    /// Фильтры
    pub whitelist: Whitelist,
    /// Профили
    pub profiles: Vec<DesyncProfile>,
    /// Параметры автоподбора
    pub auto: AutoConfig,
}

// Значения по умолчанию
fn default_log_level() -> String {
    "info".to_string()
}

fn default_cache_ttl() -> u64 {
    100_800 // 28 часов
}

fn default_fail_threshold() -> u32 {
    3
}

fn default_purge_interval() -> u64 {
    60
}

fn default_rounds() -> String {
    "1".to_string()
}

fn default_detect() -> String {
    "torst".to_string()
}

fn default_oob_data() -> String {
    "a".to_string()
}

fn default_fake_ttl() -> i64 {
    8
}

fn default_profiles() -> Vec<ProfileConfig> {
    vec![
        ProfileConfig {
            parts: vec!["split=1+s".to_string()],
            ..ProfileConfig::default()
        },
        ProfileConfig {
            parts: vec!["disorder=1+s".to_string()],
            detect: "torst,redirect,ssl_err".to_string(),
            ..ProfileConfig::default()
        },
    ]
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            auto: AutoSection::default(),
            whitelist: WhitelistConfig::default(),
            profiles: default_profiles(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for AutoSection {
    fn default() -> Self {
        Self {
            mode: String::new(),
            cache_ttl_secs: default_cache_ttl(),
            fail_threshold: default_fail_threshold(),
            timeout_ms: 0,
            cache_by_port: false,
            cache_dump: String::new(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            protocols: String::new(),
            hosts: String::new(),
            ipset: String::new(),
            ports: Vec::new(),
            rounds: default_rounds(),
        }
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            parts: Vec::new(),
            detect: default_detect(),
            oob_data: default_oob_data(),
            http_mod: String::new(),
            udp_fakes: 0,
            fake: None,
        }
    }
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            ttl: default_fake_ttl(),
            sni: String::new(),
            payload: String::new(),
            md5sig: false,
            tls_mod: String::new(),
            offset: String::new(),
            seed: None,
        }
    }
}

impl ProxyConfig {
    /// Загрузить конфигурацию из TOML файла
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)?;
        let config: ProxyConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Сохранить конфигурацию в TOML файл
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Валидация конфигурации
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.log_level()?;

        if self.profiles.is_empty() {
            anyhow::bail!("Не задано ни одного профиля");
        }

        if self.auto.cache_ttl_secs == 0 {
            anyhow::bail!("cache_ttl_secs должен быть > 0");
        }

        if self.auto.fail_threshold == 0 {
            anyhow::bail!("fail_threshold должен быть > 0");
        }

        if self.auto.purge_interval_secs == 0 {
            anyhow::bail!("purge_interval_secs должен быть > 0");
        }

        // Позиции проверяются без загрузки файлов
        for (id, profile) in self.profiles.iter().enumerate() {
            profile
                .parse_parts()
                .with_context(|| format!("Профиль {}", id))?;
        }

        Ok(())
    }

    /// Уровень логирования
    pub fn log_level(&self) -> Result<Level, anyhow::Error> {
        self.logging
            .level
            .parse::<Level>()
            .map_err(|_| anyhow::anyhow!("Неизвестный уровень логирования: {}", self.logging.level))
    }

    /// Путь к дампу кэша
    pub fn cache_dump(&self) -> Option<PathBuf> {
        (!self.auto.cache_dump.is_empty()).then(|| PathBuf::from(&self.auto.cache_dump))
    }

    /// Интервал очистки кэша
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.auto.purge_interval_secs)
    }

    /// Параметры автоподбора
    pub fn auto_config(&self) -> Result<AutoConfig, anyhow::Error> {
        Ok(AutoConfig {
            mode: AutoMode::parse_list(&self.auto.mode)?,
            cache_ttl: self.auto.cache_ttl_secs,
            fail_threshold: self.auto.fail_threshold,
            timeout: (self.auto.timeout_ms > 0).then(|| Duration::from_millis(self.auto.timeout_ms)),
            cache_by_port: self.auto.cache_by_port,
        })
    }

    /// Собрать проверенные объекты: загружаются списки хостов, подсетей и
    /// файлы payload
    pub fn build(&self) -> Result<Runtime, anyhow::Error> {
        let whitelist = self.whitelist.build().context("Фильтры")?;
        let profiles = self
            .profiles
            .iter()
            .enumerate()
            .map(|(id, p)| p.build(id).with_context(|| format!("Профиль {}", id)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Runtime {
            whitelist,
            profiles,
            auto: self.auto_config()?,
        })
    }
}

impl WhitelistConfig {
    /// Собрать фильтры
    pub fn build(&self) -> Result<Whitelist, anyhow::Error> {
        let protocols = match self.protocols.trim() {
            "" => None,
            text => Some(text.parse::<ProtocolSet>()?),
        };

        let hosts = match self.hosts.trim() {
            "" => None,
            text => Some(HostSet::load(&ListSource::parse(text))?),
        };

        let ips = match self.ipset.trim() {
            "" => None,
            text => Some(IpSet::load(&ListSource::parse(text))?),
        };

        let ports = if self.ports.is_empty() {
            None
        } else {
            let mut list = ConfigList::new();
            for range in &self.ports {
                list.push(range.parse::<PortRange>()?);
            }
            Some(list)
        };

        Ok(Whitelist {
            protocols,
            hosts,
            ips,
            ports,
            rounds: self.rounds.parse::<RoundRange>()?,
        })
    }
}

impl ProfileConfig {
    /// Разобрать позиции
    pub fn parse_parts(&self) -> Result<Vec<PositionSpec>, anyhow::Error> {
        let mut parts = ConfigList::new();
        for text in &self.parts {
            parts.push(text.parse::<PositionSpec>()?);
        }
        Ok(parts.into_vec())
    }

    /// Собрать профиль
    pub fn build(&self, id: usize) -> Result<DesyncProfile, anyhow::Error> {
        let mut profile = DesyncProfile::new(id, self.parse_parts()?);
        profile.detect = DetectSet::parse_list(&self.detect)?;

        let oob = decode_escapes(&self.oob_data)?;
        profile.options.oob_byte = match oob.as_slice() {
            [byte] => *byte,
            _ => anyhow::bail!("oob_data должен быть одним байтом: {:?}", self.oob_data),
        };
        profile.options.http_mod = HttpMod::parse_list(&self.http_mod)
            .ok_or_else(|| anyhow::anyhow!("Неизвестный http_mod: {}", self.http_mod))?;
        profile.options.udp_fakes = self.udp_fakes;

        if let Some(fake) = &self.fake {
            profile.fake = Some(Arc::new(FakeGenerator::new(fake.build()?)));
        }

        profile.validate()?;
        Ok(profile)
    }
}

impl FakeConfig {
    /// Собрать параметры приманки
    pub fn build(&self) -> Result<FakePacketSpec, anyhow::Error> {
        let mut spec = FakePacketSpec::new().with_ttl(self.ttl)?;
        if !self.sni.is_empty() {
            spec = spec.with_sni(&self.sni)?;
        }
        if !self.payload.is_empty() {
            spec = spec.with_payload(&self.payload)?;
        }
        if let Some(seed) = self.seed {
            spec = spec.with_seed(seed);
        }
        spec.md5sig = self.md5sig;
        spec.tls_mod = TlsMod::parse_list(&self.tls_mod)?;
        if !self.offset.is_empty() {
            spec.offset = Some(PositionSpec::parse(Technique::Fake, &self.offset)?);
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use desync_core::{Address, ConnInfo, ProtoKind, Transport};

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.profiles.len(), 2);
        assert_eq!(config.auto.cache_ttl_secs, 100_800);
        assert!(config.validate().is_ok());

        let runtime = config.build().unwrap();
        assert_eq!(runtime.profiles[1].describe(), "disorder=1+s");
        assert_eq!(runtime.auto.timeout, None);
    }

    #[test]
    fn test_validation() {
        let mut config = ProxyConfig::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "debug".to_string();

        config.auto.fail_threshold = 0;
        assert!(config.validate().is_err());
        config.auto.fail_threshold = 3;

        config.profiles[0].parts.push("split=1+sh".to_string());
        assert!(config.validate().is_err());

        config.profiles.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_serialization() {
        let config = ProxyConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[[profile]]"));
        assert!(toml_str.contains("cache_ttl_secs"));

        let deserialized: ProxyConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.profiles[0].parts, config.profiles[0].parts);
    }

    #[test]
    fn test_full_profile() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [auto]
            mode = "post_resp,sort"
            timeout_ms = 1500

            [whitelist]
            protocols = "tls,http"
            hosts = ":example.com youtube.com"
            ipset = ":10.0.0.0/8"
            ports = ["443", "8000-8100"]
            rounds = "1-2"

            [[profile]]
            parts = ["fake=-1+s", "oob=2"]
            detect = "torst,ssl_err"
            oob_data = "\\x00"
            http_mod = "h,r"

            [profile.fake]
            ttl = 5
            sni = "??##.com"
            tls_mod = "rand"
            seed = 7
            "#,
        )
        .unwrap();

        let runtime = config.build().unwrap();
        assert_eq!(runtime.auto.mode, AutoMode::all());
        assert_eq!(runtime.auto.timeout, Some(Duration::from_millis(1500)));

        let profile = &runtime.profiles[0];
        assert_eq!(profile.parts.len(), 2);
        assert_eq!(profile.detect, DetectSet::TORST | DetectSet::SSL_ERR);
        assert_eq!(profile.options.oob_byte, 0);
        assert_eq!(profile.options.http_mod, HttpMod::HCSMIX | HttpMod::RMSPACE);
        let fake = profile.fake.as_ref().unwrap().spec();
        assert_eq!(fake.ttl, 5);
        assert_eq!(fake.seed, Some(7));

        let conn = ConnInfo {
            dst: Address::parse("10.1.2.3:443").unwrap(),
            transport: Transport::Tcp,
            kind: ProtoKind::Tls,
            host: Some("www.youtube.com"),
        };
        assert!(runtime.whitelist.eligible(&conn));
        assert!(!runtime.whitelist.eligible(&ConnInfo {
            host: Some("example.org"),
            ..conn
        }));
        assert!(runtime.whitelist.round_allows(2));
    }

    #[test]
    fn test_build_errors() {
        let mut config = ProxyConfig::default();
        config.profiles[0].parts = vec!["fake=1".to_string()];
        assert!(config.build().is_err());

        let mut config = ProxyConfig::default();
        config.profiles[0].oob_data = "ab".to_string();
        assert!(config.build().is_err());

        let mut config = ProxyConfig::default();
        config.whitelist.hosts = "/nonexistent/hosts.txt".to_string();
        assert!(config.build().is_err());

        let mut config = ProxyConfig::default();
        config.whitelist.ports = vec!["90-80".to_string()];
        assert!(config.build().is_err());
    }
}
