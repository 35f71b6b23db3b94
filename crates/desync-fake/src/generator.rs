//! Генератор приманок
//!
//! Основа приманки выбирается так:
//! 1. пользовательский payload, если задан;
//! 2. настоящий Client Hello соединения при `tls_mod = orig`;
//! 3. встроенный HTTP запрос для HTTP соединений;
//! 4. встроенный Client Hello во всех остальных случаях.
//!
//! Затем к Client Hello применяются подмена SNI и `tls_mod = rand`, к HTTP
//! запросу подмена Host. TTL и MD5 signature добавляются в [`Decoy`] и
//! используются движком при отправке.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use desync_core::engine::Decoy;
use desync_core::proto::{self, ProtoHints, ProtoKind};
use desync_core::DesyncEngine;

use crate::error::Result;
use crate::spec::{FakePacketSpec, TlsMod};
use crate::tls::{self, TEMPLATE_HOST, TLS_TEMPLATE};

/// Генератор приманок по неизменяемой спецификации
#[derive(Debug, Clone)]
pub struct FakeGenerator {
    spec: FakePacketSpec,
}

impl FakeGenerator {
    /// Создать генератор
    pub fn new(spec: FakePacketSpec) -> Self {
        Self { spec }
    }

    /// Спецификация генератора
    pub fn spec(&self) -> &FakePacketSpec {
        &self.spec
    }

    /// Построить приманку; при заданном `seed` результат детерминирован
    pub fn build(&self, real: &[u8], hints: &ProtoHints) -> Result<Bytes> {
        match self.spec.seed {
            Some(seed) => self.build_with_rng(real, hints, &mut StdRng::seed_from_u64(seed)),
            None => self.build_with_rng(real, hints, &mut rand::thread_rng()),
        }
    }

    /// Построить приманку с заданным источником случайности
    pub fn build_with_rng<R: Rng + ?Sized>(
        &self,
        real: &[u8],
        hints: &ProtoHints,
        rng: &mut R,
    ) -> Result<Bytes> {
        let base: Vec<u8> = if let Some(payload) = &self.spec.payload {
            payload.bytes().to_vec()
        } else if self.spec.tls_mod.contains(TlsMod::ORIG) && proto::is_tls_client_hello(real) {
            real.to_vec()
        } else if hints.kind == ProtoKind::Http {
            tls::http_request(TEMPLATE_HOST)
        } else {
            TLS_TEMPLATE.to_vec()
        };

        let mut fake = base;
        if proto::is_tls_client_hello(&fake) {
            if let Some(template) = &self.spec.sni {
                let host = template.render(rng);
                debug!("fake sni: {}", host);
                fake = tls::change_sni(&fake, &host)?;
            }
            if self.spec.tls_mod.contains(TlsMod::RAND) {
                tls::randomize(&mut fake, rng);
            }
        } else if proto::is_http_request(&fake) && self.spec.payload.is_none() {
            if let Some(template) = &self.spec.sni {
                fake = tls::http_request(&template.render(rng));
            }
        }
        Ok(Bytes::from(fake))
    }

    /// Построить приманку и отрезать начало по `offset`
    pub fn decoy(&self, real: &[u8], hints: &ProtoHints) -> Result<Decoy> {
        let fake = self.build(real, hints)?;
        let start = self.start_offset(&fake);
        Ok(Decoy {
            payload: fake.slice(start..),
            ttl: self.spec.ttl,
            md5sig: self.spec.md5sig,
        })
    }

    fn start_offset(&self, fake: &[u8]) -> usize {
        let Some(spec) = &self.spec.offset else {
            return 0;
        };
        match DesyncEngine::resolve(spec, fake.len(), &ProtoHints::scan(fake)) {
            Ok(pos) => pos.clamp(0, fake.len() as i64) as usize,
            Err(err) => {
                warn!("fake offset {}: {}", spec.pos_text(), err);
                0
            }
        }
    }
}
