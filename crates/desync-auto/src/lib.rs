//! # Desync Auto (desync-auto)
//!
//! Автоматический подбор профиля desync для адреса назначения и кэш удачных
//! параметров.
//!
//! ## Возможности
//!
//! - Перебор профилей по сигналам неудачи: сброс, таймаут, редирект, TLS alert
//! - Кэш удачных профилей с TTL, счётчиком неудач и дампом в файл
//! - Сортировка кандидатов по доле успехов (`sort`)
//! - Учёт сигналов после первого ответа (`post_resp`)
//! - Оркестрация соединения: фильтры, номер запроса, план отправки
//!
//! ## Пример использования
//!
//! ```rust,no_run
//! use desync_auto::{AutoConfig, CacheHandle, DesyncProfile, Desyncer, ParamCache, Verdict};
//! use desync_core::{Address, Transport, Whitelist};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let profiles = vec![DesyncProfile::new(0, vec!["split=1+s".parse()?])];
//! let config = AutoConfig::default();
//! let cache = CacheHandle::new(ParamCache::new(config.cache_ttl, config.fail_threshold));
//! let desyncer = Desyncer::new(profiles, Whitelist::default(), cache, config)?;
//!
//! let now = desync_auto::unix_now();
//! let mut conn = desyncer.open(Address::parse("1.2.3.4:443")?, Transport::Tcp, now).await;
//! let plan = desyncer.outgoing(&mut conn, b"\x16\x03\x01...", now).await;
//! println!("{} ops", plan.ops.len());
//! if desyncer.incoming(&mut conn, b"\x16\x03\x03...", now).await == Verdict::Retry {
//!     // переподключиться и повторить запрос
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod detect;
pub mod error;
pub mod profile;
pub mod session;
pub mod trial;

// Re-экспорт основных типов
pub use cache::{unix_now, CacheEntry, CacheHandle, CacheKey, ParamCache};
pub use detect::{classify_response, FailureSignal};
pub use error::{AutoError, Result};
pub use profile::{AutoConfig, AutoMode, DesyncProfile, DetectSet};
pub use session::{Connection, Desyncer, Outcome, Verdict};
pub use trial::{Trial, TrialState, TrialStep};

/// Версия библиотеки
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
