//! Типы ошибок для desync-auto

use thiserror::Error;

/// Ошибки автоподбора и кэша параметров
#[derive(Error, Debug)]
pub enum AutoError {
    /// Не удалось прочитать или записать дамп кэша.
    /// Не фатальна: кэш начинает работу пустым
    #[error("Ошибка файла кэша '{path}': {source}")]
    CacheIo {
        /// Путь к дампу
        path: String,
        /// Исходная ошибка
        #[source]
        source: std::io::Error,
    },

    /// Профиль использует технику fake без параметров приманки
    #[error("Профиль {0}: техника fake требует секцию fake")]
    FakeWithoutSpec(usize),

    /// Профиль без позиций и без UDP приманок
    #[error("Профиль {0} не содержит ни одной позиции")]
    EmptyProfile(usize),

    /// Не задано ни одного профиля
    #[error("Не задано ни одного профиля")]
    NoProfiles,

    /// Неизвестная метка детектора
    #[error("Неизвестный детектор: {0}")]
    UnknownDetect(String),

    /// Неизвестный флаг режима автоподбора
    #[error("Неизвестный режим автоподбора: {0}")]
    UnknownMode(String),

    /// Ошибка генератора приманок
    #[error("Ошибка приманки: {0}")]
    Fake(#[from] desync_fake::FakeError),
}

/// Псевдоним для Result с AutoError
pub type Result<T> = std::result::Result<T, AutoError>;
