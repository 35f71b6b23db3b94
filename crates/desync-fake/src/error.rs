//! Типы ошибок для desync-fake

use thiserror::Error;

/// Ошибки генератора подложных пакетов
#[derive(Error, Debug)]
pub enum FakeError {
    /// Не удалось прочитать файл с payload
    #[error("Не удалось прочитать payload '{path}': {source}")]
    PayloadUnreadable {
        /// Путь к файлу
        path: String,
        /// Исходная ошибка
        #[source]
        source: std::io::Error,
    },

    /// Некорректная escape-последовательность в строковом payload
    #[error("Некорректная escape-последовательность: {0}")]
    BadEscape(String),

    /// TTL вне диапазона 1..=255
    #[error("Некорректный TTL: {0}")]
    InvalidTtl(i64),

    /// Некорректный шаблон SNI
    #[error("Некорректный шаблон SNI: {0}")]
    BadTemplate(String),

    /// Неизвестный режим модификации Client Hello
    #[error("Неизвестный режим tls_mod: {0}")]
    UnknownTlsMod(String),

    /// Буфер не является TLS Client Hello
    #[error("Буфер не является TLS Client Hello")]
    NotClientHello,

    /// Длина имени не помещается в поле SNI
    #[error("Слишком длинное имя хоста: {0} байт")]
    HostTooLong(usize),
}

/// Псевдоним для Result с FakeError
pub type Result<T> = std::result::Result<T, FakeError>;
