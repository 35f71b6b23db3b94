//! Типы ошибок для desync-core
//!
//! Ошибки делятся на две группы:
//! - ошибки конфигурации (`ParseError`, `AddrError`, `ConfigError`) фатальны
//!   при старте, конфигурация с ними не применяется;
//! - `AnchorError`: восстановимая ошибка на конкретном буфере: часть
//!   пропускается, соединение идёт без изменений.

use thiserror::Error;

/// Основной тип ошибок ядра
#[derive(Error, Debug)]
pub enum DesyncError {
    /// Ошибка разбора позиции
    #[error("Ошибка позиции: {0}")]
    Parse(#[from] ParseError),

    /// Ошибка разбора адреса
    #[error("Ошибка адреса: {0}")]
    Addr(#[from] AddrError),

    /// Ошибка конфигурации фильтров
    #[error("Ошибка конфигурации: {0}")]
    Config(#[from] ConfigError),

    /// Якорь не найден в буфере
    #[error("Якорь не найден: {0}")]
    Anchor(#[from] AnchorError),

    /// Ошибка ввода-вывода
    #[error("Ошибка I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Ошибки разбора строки позиции `offset[:repeats:skip][+flags]`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Пустая строка
    #[error("Пустая позиция")]
    Empty,

    /// Некорректное целое число
    #[error("Некорректное число '{value}' в позиции '{input}'")]
    BadInteger {
        /// Исходная строка
        input: String,
        /// Неразобранное число
        value: String,
    },

    /// Неизвестный флаг
    #[error("Неизвестный флаг '{flag}' в позиции '{input}'")]
    UnknownFlag {
        /// Исходная строка
        input: String,
        /// Флаг
        flag: char,
    },

    /// Конфликт флагов (два якоря, `e` вместе с `m`)
    #[error("Конфликт флагов в позиции '{input}': {reason}")]
    Conflict {
        /// Исходная строка
        input: String,
        /// Описание конфликта
        reason: &'static str,
    },

    /// Неполная секция повторов (`1:2` без skip)
    #[error("Ожидается формат offset:repeats:skip, получено '{0}'")]
    BadRepeat(String),

    /// Неизвестное имя техники
    #[error("Неизвестная техника: {0}")]
    UnknownTechnique(String),
}

/// Ошибки разбора адреса
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    /// Текст не является адресом
    #[error("Некорректный адрес: {0}")]
    Malformed(String),

    /// Адрес другого семейства (доменное имя, unix-путь)
    #[error("Неподдерживаемое семейство адресов: {0}")]
    UnsupportedFamily(String),
}

/// Ошибки загрузки фильтров (hosts, ipset, порты, протоколы, раунды)
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Не удалось прочитать файл списка
    #[error("Не удалось прочитать '{path}': {source}")]
    Unreadable {
        /// Путь к файлу
        path: String,
        /// Исходная ошибка
        #[source]
        source: std::io::Error,
    },

    /// Некорректное имя хоста
    #[error("Некорректный хост: {0}")]
    InvalidHost(String),

    /// Некорректная подсеть
    #[error("Некорректная подсеть: {0}")]
    InvalidCidr(String),

    /// Некорректный диапазон портов
    #[error("Некорректный диапазон портов: {0}")]
    InvalidPortRange(String),

    /// Неизвестный тег протокола
    #[error("Неизвестный протокол: {0}")]
    UnknownProtocol(String),

    /// Некорректный диапазон раундов
    #[error("Некорректный диапазон раундов: {0}")]
    InvalidRound(String),

    /// Пустой список
    #[error("Список '{0}' не содержит записей")]
    EmptyList(String),
}

/// Поле протокола, относительно которого задана позиция, не найдено
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorError {
    /// В буфере нет TLS Client Hello с SNI
    #[error("SNI не найден в буфере")]
    SniNotFound,

    /// В буфере нет HTTP запроса с заголовком Host
    #[error("Host не найден в буфере")]
    HostNotFound,
}

/// Псевдоним для Result с ошибкой ядра
pub type Result<T> = std::result::Result<T, DesyncError>;
