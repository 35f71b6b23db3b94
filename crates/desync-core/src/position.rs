//! Язык позиций фрагментации
//!
//! Формат: `offset[:repeats:skip][+flags]`
//!
//! - `offset`: целое число (отрицательное отсчитывается от конца буфера) или
//!   символьный якорь `s` (SNI) / `h` (HTTP Host), что эквивалентно `0+s` / `0+h`;
//! - `repeats:skip`: сколько раз повторить разрез и шаг между разрезами;
//! - флаги `s` (от SNI), `h` (от Host), `e` (от конца поля или буфера),
//!   `m` (от середины), `n` (вставить нулевой байт-приманку).
//!
//! Разбор выполняется один раз при старте; ошибки разбора фатальны для
//! конфигурации.

use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

bitflags! {
    /// Модификаторы размещения разреза
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PosFlags: u8 {
        /// Нулевой байт-приманка перед фрагментом
        const NULL = 0b0000_0001;
        /// Отсчёт от конца поля / буфера
        const END  = 0b0000_0010;
        /// Отсчёт от середины поля / буфера
        const MID  = 0b0000_0100;
    }
}

/// Точка отсчёта смещения
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Anchor {
    /// Начало потока
    #[default]
    Absolute,
    /// Имя хоста в расширении SNI TLS Client Hello
    Sni,
    /// Значение заголовка HTTP Host
    Host,
}

/// Техника десинхронизации, которая обрабатывает позицию
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Technique {
    /// Разрез на два обычных фрагмента
    #[default]
    Split,
    /// Разрез с отправкой первой части после второй
    Disorder,
    /// Разрез с байтом out-of-band
    Oob,
    /// Disorder + OOB
    Disoob,
    /// Подложный пакет перед реальным фрагментом
    Fake,
    /// Разрез TLS записи на две записи
    TlsRec,
}

impl Technique {
    /// Все техники в порядке объявления
    pub const ALL: [Technique; 6] = [
        Technique::Split,
        Technique::Disorder,
        Technique::Oob,
        Technique::Disoob,
        Technique::Fake,
        Technique::TlsRec,
    ];

    /// Имя техники в конфигурации
    pub fn name(self) -> &'static str {
        match self {
            Technique::Split => "split",
            Technique::Disorder => "disorder",
            Technique::Oob => "oob",
            Technique::Disoob => "disoob",
            Technique::Fake => "fake",
            Technique::TlsRec => "tlsrec",
        }
    }
}

impl FromStr for Technique {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Technique::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseError::UnknownTechnique(s.to_string()))
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Одна инструкция фрагментации
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PositionSpec {
    /// Техника, применяемая в точке разреза
    pub technique: Technique,
    /// Смещение (относительно якоря)
    pub offset: i64,
    /// Точка отсчёта
    pub anchor: Anchor,
    /// Количество повторов (0 и 1 означают один раз)
    pub repeats: u32,
    /// Шаг между повторами в байтах
    pub skip: i64,
    /// Модификаторы
    pub flags: PosFlags,
}

impl PositionSpec {
    /// Разобрать позицию для заданной техники
    pub fn parse(technique: Technique, text: &str) -> Result<Self, ParseError> {
        let input = text.trim();
        if input.is_empty() {
            return Err(ParseError::Empty);
        }

        let (body, flag_str) = match input.split_once('+') {
            Some((body, flags)) => (body, Some(flags)),
            None => (input, None),
        };

        let mut spec = PositionSpec {
            technique,
            ..Default::default()
        };

        let mut fields = body.split(':');
        let offset_str = fields.next().unwrap_or_default();
        match offset_str {
            "s" => spec.anchor = Anchor::Sni,
            "h" => spec.anchor = Anchor::Host,
            _ => spec.offset = parse_int(input, offset_str)?,
        }

        match (fields.next(), fields.next(), fields.next()) {
            (None, _, _) => {}
            (Some(r), Some(s), None) => {
                let repeats = parse_int(input, r)?;
                spec.repeats = u32::try_from(repeats).map_err(|_| ParseError::BadInteger {
                    input: input.to_string(),
                    value: r.to_string(),
                })?;
                spec.skip = parse_int(input, s)?;
            }
            _ => return Err(ParseError::BadRepeat(input.to_string())),
        }

        if let Some(flags) = flag_str {
            if flags.is_empty() {
                return Err(ParseError::UnknownFlag {
                    input: input.to_string(),
                    flag: '+',
                });
            }
            for c in flags.chars() {
                match c {
                    's' | 'h' => {
                        let anchor = if c == 's' { Anchor::Sni } else { Anchor::Host };
                        if spec.anchor != Anchor::Absolute {
                            return Err(ParseError::Conflict {
                                input: input.to_string(),
                                reason: "указано более одного якоря",
                            });
                        }
                        spec.anchor = anchor;
                    }
                    'e' => spec.flags |= PosFlags::END,
                    'm' => spec.flags |= PosFlags::MID,
                    'n' => spec.flags |= PosFlags::NULL,
                    other => {
                        return Err(ParseError::UnknownFlag {
                            input: input.to_string(),
                            flag: other,
                        })
                    }
                }
            }
        }

        if spec.flags.contains(PosFlags::END | PosFlags::MID) {
            return Err(ParseError::Conflict {
                input: input.to_string(),
                reason: "флаги 'e' и 'm' взаимоисключающие",
            });
        }

        Ok(spec)
    }

    /// Количество применений разреза
    pub fn count(&self) -> u32 {
        self.repeats.max(1)
    }

    /// Текстовая форма позиции без имени техники
    pub fn pos_text(&self) -> String {
        let mut out = self.offset.to_string();
        if self.repeats != 0 || self.skip != 0 {
            out.push_str(&format!(":{}:{}", self.repeats, self.skip));
        }

        let mut flags = String::new();
        match self.anchor {
            Anchor::Absolute => {}
            Anchor::Sni => flags.push('s'),
            Anchor::Host => flags.push('h'),
        }
        if self.flags.contains(PosFlags::END) {
            flags.push('e');
        }
        if self.flags.contains(PosFlags::MID) {
            flags.push('m');
        }
        if self.flags.contains(PosFlags::NULL) {
            flags.push('n');
        }
        if !flags.is_empty() {
            out.push('+');
            out.push_str(&flags);
        }
        out
    }
}

fn parse_int(input: &str, value: &str) -> Result<i64, ParseError> {
    value.trim().parse::<i64>().map_err(|_| ParseError::BadInteger {
        input: input.to_string(),
        value: value.to_string(),
    })
}

/// Форма `technique=pos`; без `=` техника считается `split`
impl FromStr for PositionSpec {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((tech, pos)) => PositionSpec::parse(tech.parse()?, pos),
            None => PositionSpec::parse(Technique::Split, s),
        }
    }
}

impl fmt::Display for PositionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.technique, self.pos_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_offset() {
        let spec = PositionSpec::parse(Technique::Split, "5").unwrap();
        assert_eq!(spec.offset, 5);
        assert_eq!(spec.anchor, Anchor::Absolute);
        assert_eq!(spec.repeats, 0);
        assert_eq!(spec.skip, 0);
        assert!(spec.flags.is_empty());
        assert_eq!(spec.count(), 1);
    }

    #[test]
    fn test_full_form() {
        let spec = PositionSpec::parse(Technique::Disorder, "-2:3:10+sen").unwrap();
        assert_eq!(spec.technique, Technique::Disorder);
        assert_eq!(spec.offset, -2);
        assert_eq!(spec.anchor, Anchor::Sni);
        assert_eq!(spec.repeats, 3);
        assert_eq!(spec.skip, 10);
        assert_eq!(spec.flags, PosFlags::END | PosFlags::NULL);
    }

    #[test]
    fn test_symbolic_anchor() {
        let spec = PositionSpec::parse(Technique::Split, "h+m").unwrap();
        assert_eq!(spec.offset, 0);
        assert_eq!(spec.anchor, Anchor::Host);
        assert_eq!(spec.flags, PosFlags::MID);

        let spec = PositionSpec::parse(Technique::Split, "s").unwrap();
        assert_eq!(spec.anchor, Anchor::Sni);
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "abc", "5:1:1+z", "1:2", "1:2:3:4", "1+", "x:1:1", "1:-1:0"] {
            assert!(
                PositionSpec::parse(Technique::Split, bad).is_err(),
                "должно быть отклонено: {bad:?}"
            );
        }
        assert!(matches!(
            PositionSpec::parse(Technique::Split, "5:1:1+z"),
            Err(ParseError::UnknownFlag { flag: 'z', .. })
        ));
    }

    #[test]
    fn test_conflicts() {
        assert!(matches!(
            PositionSpec::parse(Technique::Split, "s+h"),
            Err(ParseError::Conflict { .. })
        ));
        assert!(matches!(
            PositionSpec::parse(Technique::Split, "1+sh"),
            Err(ParseError::Conflict { .. })
        ));
        assert!(matches!(
            PositionSpec::parse(Technique::Split, "1+em"),
            Err(ParseError::Conflict { .. })
        ));
    }

    #[test]
    fn test_deterministic() {
        let a = PositionSpec::parse(Technique::Fake, "3:2:4+hn").unwrap();
        let b = PositionSpec::parse(Technique::Fake, "3:2:4+hn").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_display_roundtrip() {
        for text in [
            "split=1",
            "disorder=1+s",
            "oob=-1:4:2+he",
            "disoob=0+m",
            "fake=s",
            "tlsrec=3+sn",
            "2:2:5",
        ] {
            let spec: PositionSpec = text.parse().unwrap();
            let again: PositionSpec = spec.to_string().parse().unwrap();
            assert_eq!(spec, again, "{text}");
        }
    }

    #[test]
    fn test_technique_names() {
        for t in Technique::ALL {
            assert_eq!(t.name().parse::<Technique>().unwrap(), t);
        }
        assert!("nope".parse::<Technique>().is_err());
    }
}
