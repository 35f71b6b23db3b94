//! Шаблон имени хоста для подложного SNI
//!
//! Буквальные символы копируются как есть, маркеры заменяются случайными:
//! `?` — строчная латинская буква, `#` — цифра, `*` — буква или цифра.

use rand::Rng;
use std::fmt;
use std::str::FromStr;

use crate::error::FakeError;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";
const ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Максимальная длина имени хоста
pub const MAX_HOST_LEN: usize = 253;

/// Разобранный шаблон SNI
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SniTemplate {
    pattern: String,
}

impl SniTemplate {
    /// Проверить и сохранить шаблон
    pub fn parse(pattern: &str) -> Result<Self, FakeError> {
        let pattern = pattern.trim();
        let valid = !pattern.is_empty()
            && pattern.len() <= MAX_HOST_LEN
            && pattern
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '?' | '#' | '*'));
        if !valid {
            return Err(FakeError::BadTemplate(pattern.to_string()));
        }
        Ok(Self {
            pattern: pattern.to_string(),
        })
    }

    /// Исходный текст шаблона
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Есть ли в шаблоне маркеры подстановки
    pub fn is_literal(&self) -> bool {
        !self.pattern.contains(['?', '#', '*'])
    }

    /// Подставить случайные символы
    pub fn render<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.pattern
            .chars()
            .map(|c| match c {
                '?' => pick(rng, LETTERS),
                '#' => pick(rng, DIGITS),
                '*' => pick(rng, ALNUM),
                other => other,
            })
            .collect()
    }
}

fn pick<R: Rng + ?Sized>(rng: &mut R, set: &[u8]) -> char {
    set[rng.gen_range(0..set.len())] as char
}

impl FromStr for SniTemplate {
    type Err = FakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SniTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}
