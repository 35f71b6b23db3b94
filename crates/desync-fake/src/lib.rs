//! # Desync Fake (desync-fake)
//!
//! Генератор подложных пакетов для техники `fake`.
//!
//! Приманка должна быть видна системе инспекции, но не должна быть принята
//! настоящим получателем: она уходит с малым TTL или с неверной TCP опцией
//! MD5 signature.
//!
//! ## Возможности
//!
//! - Встроенные шаблоны: TLS 1.3 Client Hello (517 байт) и HTTP запрос
//! - Подмена SNI по шаблону (`?`, `#`, `*`)
//! - Случайные random / session id / key_share (`tls_mod = rand`)
//! - Приманка на основе настоящего Client Hello (`tls_mod = orig`)
//! - Пользовательский payload из файла или строки с escape-последовательностями
//! - Детерминированный результат при заданном зерне
//!
//! ## Пример использования
//!
//! ```rust,no_run
//! use desync_fake::{FakeGenerator, FakePacketSpec};
//! use desync_core::ProtoHints;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let spec = FakePacketSpec::new()
//!     .with_ttl(5)?
//!     .with_sni("??##.com")?
//!     .with_seed(42);
//!
//! let generator = FakeGenerator::new(spec);
//! let decoy = generator.decoy(b"", &ProtoHints::default())?;
//! println!("decoy: {} bytes, ttl {}", decoy.payload.len(), decoy.ttl);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod generator;
pub mod sni;
pub mod spec;
pub mod tls;

// Re-экспорт основных типов
pub use error::{FakeError, Result};
pub use generator::FakeGenerator;
pub use sni::SniTemplate;
pub use spec::{FakePacketSpec, PayloadSource, TlsMod};

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
