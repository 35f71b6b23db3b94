//! # Desync Core (desync-core)
//!
//! Ядро desync прокси: описание того, где и как резать исходящий поток, чтобы
//! система инспекции трафика на пути не смогла его корректно собрать, а
//! настоящий получатель собрал.
//!
//! ## Возможности
//!
//! - **Позиции**: язык `offset[:repeats:skip][+flags]` с якорями SNI / Host
//! - **Протоколы**: поиск SNI в TLS Client Hello и Host в HTTP запросе,
//!   разрез TLS записи, модификации заголовка Host
//! - **Движок**: split, disorder, oob, disoob, fake, tlsrec
//! - **Фильтры**: хосты (по суффиксу), подсети, порты, протоколы, номер запроса
//!
//! ## Структура
//!
//! - [`position`]: Разбор позиций
//! - [`proto`]: Сканер протоколов
//! - [`engine`]: Движок трансформации
//! - [`whitelist`]: Фильтры допуска
//! - [`addr`]: Адреса назначения
//! - [`error`]: Типы ошибок
//!
//! ## Пример использования
//!
//! ```rust,no_run
//! use desync_core::{DesyncEngine, EngineOptions, PositionSpec, ProtoHints};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let parts: Vec<PositionSpec> = vec!["split=1+s".parse()?, "disorder=-1+se".parse()?];
//! let buffer = b"\x16\x03\x01...";
//!
//! let engine = DesyncEngine::new(EngineOptions::default());
//! let plan = engine.apply(&parts, buffer, &ProtoHints::scan(buffer), None);
//! for op in &plan.ops {
//!     println!("{}", op.kind());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod engine;
pub mod error;
pub mod position;
pub mod proto;
pub mod whitelist;

// Re-экспорт основных типов для удобства
pub use addr::{Address, ConfigList};
pub use engine::{Decoy, DesyncEngine, EngineOptions, Plan, WireOp};
pub use error::{AnchorError, ConfigError, DesyncError, ParseError, Result};
pub use position::{Anchor, PosFlags, PositionSpec, Technique};
pub use proto::{HttpMod, ProtoHints, ProtoKind};
pub use whitelist::{ConnInfo, Transport, Whitelist};

/// Версия библиотеки
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_reexports() {
        let spec: PositionSpec = "oob=2".parse().unwrap();
        let plan = DesyncEngine::default().apply_one(
            &spec,
            b"0123456789",
            &ProtoHints::default(),
            None,
        );
        assert_eq!(plan.reassemble(), b"0123456789");
    }
}
