//! Движок трансформации исходящего буфера
//!
//! По списку позиций и подсказкам протокола строит упорядоченную
//! последовательность операций записи ([`WireOp`]). Сокетный слой исполняет
//! их как есть: обычные записи, запись с байтом OOB, отложенные записи и
//! подложные пакеты с малым TTL.
//!
//! Порядок работы:
//! 1. модификации заголовка HTTP Host (`mod_http`);
//! 2. разрезы TLS записи (`tlsrec`) как перезапись буфера;
//! 3. остальные техники по бегущему курсору.
//!
//! Движок не хранит состояния между вызовами.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::AnchorError;
use crate::position::{Anchor, PosFlags, PositionSpec, Technique};
use crate::proto::{self, HttpMod, ProtoHints, ProtoKind, TLS_RECORD_HEADER};

/// TTL подложных пакетов по умолчанию
pub const DEFAULT_FAKE_TTL: u8 = 8;

/// Байт OOB по умолчанию
pub const DEFAULT_OOB_BYTE: u8 = b'a';

/// Размер подложной UDP датаграммы без заданной приманки
const UDP_FAKE_SIZE: usize = 64;

/// Готовая приманка от генератора подложных пакетов
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoy {
    /// Байты приманки (уже со смещением fake_offset)
    pub payload: Bytes,
    /// TTL, с которым приманка уходит в сеть
    pub ttl: u8,
    /// Добавить TCP опцию MD5 signature
    pub md5sig: bool,
}

/// Одна операция записи в сокет
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireOp {
    /// Обычная запись фрагмента
    Write {
        /// Смещение фрагмента в потоке
        offset: usize,
        /// Данные
        data: Bytes,
    },
    /// Запись фрагмента с завершающим байтом out-of-band
    WriteOob {
        /// Смещение фрагмента в потоке
        offset: usize,
        /// Данные
        data: Bytes,
        /// Байт, уходящий как urgent data
        urgent: u8,
    },
    /// Фрагмент, отправленный после следующего за ним
    WriteReordered {
        /// Смещение фрагмента в потоке
        offset: usize,
        /// Данные
        data: Bytes,
        /// Байт OOB для disoob
        urgent: Option<u8>,
    },
    /// Подложный пакет, который не должен дойти до получателя
    InjectFake {
        /// Данные приманки
        data: Bytes,
        /// TTL
        ttl: u8,
        /// TCP опция MD5 signature
        md5sig: bool,
    },
}

impl WireOp {
    /// Реальный фрагмент потока (смещение и данные), если это не приманка
    pub fn real(&self) -> Option<(usize, &Bytes)> {
        match self {
            WireOp::Write { offset, data }
            | WireOp::WriteOob { offset, data, .. }
            | WireOp::WriteReordered { offset, data, .. } => Some((*offset, data)),
            WireOp::InjectFake { .. } => None,
        }
    }

    /// Короткое имя операции для логов
    pub fn kind(&self) -> &'static str {
        match self {
            WireOp::Write { .. } => "write",
            WireOp::WriteOob { .. } => "oob",
            WireOp::WriteReordered { .. } => "reordered",
            WireOp::InjectFake { .. } => "fake",
        }
    }
}

/// Результат трансформации одного буфера
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Операции в порядке отправки
    pub ops: Vec<WireOp>,
    /// Позиции, пропущенные из-за отсутствия якоря
    pub skipped: Vec<(PositionSpec, AnchorError)>,
}

impl Plan {
    /// Буфер без изменений одной записью
    pub fn passthrough(buf: &[u8]) -> Self {
        Self {
            ops: vec![WireOp::Write {
                offset: 0,
                data: Bytes::copy_from_slice(buf),
            }],
            skipped: Vec::new(),
        }
    }

    /// Собрать реальный поток из фрагментов в исходном порядке
    pub fn reassemble(&self) -> Vec<u8> {
        let mut parts: Vec<(usize, &Bytes)> = self.ops.iter().filter_map(WireOp::real).collect();
        parts.sort_by_key(|(offset, _)| *offset);
        let mut out = Vec::with_capacity(parts.iter().map(|(_, d)| d.len()).sum());
        for (_, data) in parts {
            out.extend_from_slice(data);
        }
        out
    }

    /// Отличается ли план от простой пересылки
    pub fn is_modified(&self) -> bool {
        !matches!(self.ops.as_slice(), [WireOp::Write { offset: 0, .. }])
    }
}

/// Параметры движка, общие для всех позиций профиля
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Байт, отправляемый как OOB
    pub oob_byte: u8,
    /// Модификации заголовка Host
    pub http_mod: HttpMod,
    /// Количество подложных UDP датаграмм
    pub udp_fakes: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            oob_byte: DEFAULT_OOB_BYTE,
            http_mod: HttpMod::empty(),
            udp_fakes: 0,
        }
    }
}

/// Движок desync
#[derive(Debug, Clone, Default)]
pub struct DesyncEngine {
    options: EngineOptions,
}

/// Состояние построения плана по бегущему курсору
struct Emitter<'a> {
    data: Bytes,
    decoy: Option<&'a Decoy>,
    ops: Vec<WireOp>,
    held: Vec<WireOp>,
}

impl Emitter<'_> {
    fn push(&mut self, op: WireOp) {
        self.ops.push(op);
        while let Some(held) = self.held.pop() {
            self.ops.push(held);
        }
    }

    fn hold(&mut self, op: WireOp) {
        self.held.push(op);
    }

    fn null_decoy(&mut self) {
        let (ttl, md5sig) = self
            .decoy
            .map_or((DEFAULT_FAKE_TTL, false), |d| (d.ttl, d.md5sig));
        self.ops.push(WireOp::InjectFake {
            data: Bytes::from_static(&[0]),
            ttl,
            md5sig,
        });
    }

    fn finish(mut self) -> Vec<WireOp> {
        while let Some(held) = self.held.pop() {
            self.ops.push(held);
        }
        self.ops
    }
}

impl DesyncEngine {
    /// Создать движок
    pub fn new(options: EngineOptions) -> Self {
        Self { options }
    }

    /// Параметры движка
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Вычислить абсолютную позицию разреза (для первого повтора)
    pub fn resolve(spec: &PositionSpec, len: usize, hints: &ProtoHints) -> Result<i64, AnchorError> {
        let field = match spec.anchor {
            Anchor::Absolute => None,
            Anchor::Sni => Some(hints.sni().ok_or(AnchorError::SniNotFound)?),
            Anchor::Host => Some(hints.http_host().ok_or(AnchorError::HostNotFound)?),
        };

        // Насыщающая арифметика: выход за буфер дальше обрезается или отменяется
        let pos = match field {
            Some(field) => {
                let mut pos = spec.offset.saturating_add(field.pos as i64);
                if spec.flags.contains(PosFlags::END) {
                    pos = pos.saturating_add(field.len as i64);
                } else if spec.flags.contains(PosFlags::MID) {
                    pos = pos.saturating_add(field.len as i64 / 2);
                }
                pos
            }
            None => {
                let n = len as i64;
                if spec.flags.contains(PosFlags::MID) {
                    spec.offset.saturating_add(n / 2)
                } else if spec.flags.contains(PosFlags::END) || spec.offset < 0 {
                    spec.offset.saturating_add(n)
                } else {
                    spec.offset
                }
            }
        };
        Ok(pos)
    }

    /// Применить одну позицию
    pub fn apply_one(
        &self,
        spec: &PositionSpec,
        buffer: &[u8],
        hints: &ProtoHints,
        decoy: Option<&Decoy>,
    ) -> Plan {
        self.apply(std::slice::from_ref(spec), buffer, hints, decoy)
    }

    /// Применить позиции профиля к TCP буферу
    pub fn apply(
        &self,
        parts: &[PositionSpec],
        buffer: &[u8],
        hints: &ProtoHints,
        decoy: Option<&Decoy>,
    ) -> Plan {
        let mut buf = BytesMut::from(buffer);
        let mut hints = *hints;
        let mut skipped = Vec::new();

        match hints.host_name(&buf) {
            Some(name) => debug!(
                "host: {} ({})",
                name,
                hints.host.map_or(0, |field| field.pos)
            ),
            None if hints.kind == ProtoKind::Unknown => {
                let prefix = &buf[..buf.len().min(16)];
                debug!("bytes: {} ({})", hex::encode(prefix), buf.len());
            }
            None => {}
        }

        if !self.options.http_mod.is_empty()
            && hints.kind == ProtoKind::Http
            && proto::mod_http(&mut buf, self.options.http_mod)
        {
            trace!("mod_http: {:?}", self.options.http_mod);
            hints = ProtoHints::scan(&buf);
        }

        if parts.iter().any(|p| p.technique == Technique::TlsRec) {
            Self::split_records(parts, &mut buf, &mut hints, &mut skipped);
        }

        let n = buf.len();
        let mut out = Emitter {
            data: buf.freeze(),
            decoy,
            ops: Vec::new(),
            held: Vec::new(),
        };
        let mut lp = 0usize;

        'parts: for spec in parts.iter().filter(|p| p.technique != Technique::TlsRec) {
            let base = match Self::resolve(spec, n, &hints) {
                Ok(pos) => pos,
                Err(err) => {
                    debug!("skip {}: {}", spec, err);
                    skipped.push((*spec, err));
                    continue;
                }
            };

            for k in 0..spec.count() as i64 {
                let pos = base.saturating_add(k.saturating_mul(spec.skip));
                if pos < lp as i64 {
                    debug!("split cancel: pos={}-{}, n={}", lp, pos, n);
                    break 'parts;
                }
                let pos = if pos as u64 > n as u64 {
                    debug!("pos reduced: {} -> {}", pos, n);
                    n
                } else {
                    pos as usize
                };
                if pos > lp {
                    debug!("split: pos={}-{}, m={}", lp, pos, spec.technique);
                    self.emit(&mut out, spec, k, lp, pos);
                    lp = pos;
                }
                // Дальнейшие повторы дали бы ту же точку
                if pos >= n || spec.skip == 0 {
                    break;
                }
            }
        }

        if lp < n {
            let tail = out.data.slice(lp..);
            out.push(WireOp::Write {
                offset: lp,
                data: tail,
            });
        }

        Plan {
            ops: out.finish(),
            skipped,
        }
    }

    /// Отправить фрагмент `lp..pos`; `rep` - номер повтора позиции
    fn emit(&self, out: &mut Emitter<'_>, spec: &PositionSpec, rep: i64, lp: usize, pos: usize) {
        let data = out.data.slice(lp..pos);
        if spec.flags.contains(PosFlags::NULL) {
            out.null_decoy();
        }

        let urgent = self.options.oob_byte;
        match spec.technique {
            Technique::Split | Technique::TlsRec => out.push(WireOp::Write { offset: lp, data }),
            Technique::Oob => out.push(WireOp::WriteOob {
                offset: lp,
                data,
                urgent,
            }),
            // Задерживаются только чётные повторы, нечётные уходят сразу
            Technique::Disorder if rep % 2 == 1 => out.push(WireOp::Write { offset: lp, data }),
            Technique::Disoob if rep % 2 == 1 => out.push(WireOp::WriteOob {
                offset: lp,
                data,
                urgent,
            }),
            Technique::Disorder => out.hold(WireOp::WriteReordered {
                offset: lp,
                data,
                urgent: None,
            }),
            Technique::Disoob => out.hold(WireOp::WriteReordered {
                offset: lp,
                data,
                urgent: Some(urgent),
            }),
            Technique::Fake => {
                match out.decoy {
                    Some(decoy) if !decoy.payload.is_empty() => {
                        let len = data.len().min(decoy.payload.len());
                        out.ops.push(WireOp::InjectFake {
                            data: decoy.payload.slice(..len),
                            ttl: decoy.ttl,
                            md5sig: decoy.md5sig,
                        });
                    }
                    _ => debug!("fake: no decoy, plain split"),
                }
                out.push(WireOp::Write { offset: lp, data });
            }
        }
    }

    /// Разрезать первую TLS запись по позициям `tlsrec`
    fn split_records(
        parts: &[PositionSpec],
        buf: &mut BytesMut,
        hints: &mut ProtoHints,
        skipped: &mut Vec<(PositionSpec, AnchorError)>,
    ) {
        if !proto::is_tls_record(buf) {
            debug!("tlsrec: not a tls record");
            return;
        }
        let body_len = proto::read_u16(buf, 3).unwrap_or(0) as usize;
        let body_end = (TLS_RECORD_HEADER + body_len).min(buf.len());

        let mut cuts = Vec::new();
        let mut lp = TLS_RECORD_HEADER;

        'parts: for spec in parts.iter().filter(|p| p.technique == Technique::TlsRec) {
            let base = match Self::resolve(spec, buf.len(), hints) {
                Ok(pos) => pos,
                Err(err) => {
                    debug!("skip {}: {}", spec, err);
                    skipped.push((*spec, err));
                    continue;
                }
            };
            for k in 0..spec.count() as i64 {
                let pos = base.saturating_add(k.saturating_mul(spec.skip));
                if pos < lp as i64 {
                    debug!("tlsrec cancel: pos={}-{}", lp, pos);
                    break 'parts;
                }
                if pos as u64 >= body_end as u64 {
                    debug!("tlsrec: pos {} outside record body", pos);
                    break 'parts;
                }
                let pos = pos as usize;
                if pos > lp {
                    cuts.push(pos);
                    lp = pos;
                }
                if spec.skip == 0 {
                    break;
                }
            }
        }

        if cuts.is_empty() {
            return;
        }
        if let Some(rewritten) = proto::split_tls_record(buf, &cuts) {
            debug!("tlsrec: cuts={:?}", cuts);
            *hints = hints.shifted(&cuts);
            *buf = rewritten;
        }
    }

    /// Применить desync к UDP датаграмме: приманки перед реальной датаграммой
    pub fn apply_udp(&self, datagram: &[u8], decoy: Option<&Decoy>) -> Plan {
        let mut ops = Vec::with_capacity(self.options.udp_fakes as usize + 1);
        for _ in 0..self.options.udp_fakes {
            let op = match decoy {
                Some(d) => WireOp::InjectFake {
                    data: d.payload.clone(),
                    ttl: d.ttl,
                    md5sig: false,
                },
                None => WireOp::InjectFake {
                    data: Bytes::from_static(&[0; UDP_FAKE_SIZE]),
                    ttl: DEFAULT_FAKE_TTL,
                    md5sig: false,
                },
            };
            ops.push(op);
        }
        if !ops.is_empty() {
            debug!("udp: {} fake datagrams", ops.len());
        }
        ops.push(WireOp::Write {
            offset: 0,
            data: Bytes::copy_from_slice(datagram),
        });
        Plan {
            ops,
            skipped: Vec::new(),
        }
    }
}
