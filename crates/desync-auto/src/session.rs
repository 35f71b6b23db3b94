//! Оркестрация desync для одного соединения
//!
//! `Desyncer` разделяется между всеми соединениями: профили и фильтры только
//! читаются, кэш защищён `RwLock`. Состояние подбора живёт в `Connection` и
//! принадлежит задаче, обслуживающей соединение.
//!
//! Сетевой ввод-вывод остаётся у вызывающей стороны: она отправляет операции
//! из `Plan`, передаёт ответы в `incoming` и сообщает о сбросе через `report`.
//! При `Verdict::Retry` соединение нужно открыть заново и повторить запрос.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use desync_core::{Address, ConnInfo, Plan, ProtoHints, Transport, Whitelist};

use crate::cache::{CacheHandle, CacheKey};
use crate::detect::{classify_response, FailureSignal};
use crate::error::{AutoError, Result};
use crate::profile::{recognized, AutoConfig, DesyncProfile, DetectSet};
use crate::trial::{Trial, TrialState, TrialStep};

/// Решение после события соединения
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Продолжать как есть
    Pass,
    /// Переподключиться и повторить запрос со следующим профилем
    Retry,
}

/// Исход ожидания ответа сервера
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Пришли данные
    Response(Bytes),
    /// Соединение сброшено
    Reset,
    /// Соединение закрыто без ответа
    Closed,
}

/// Состояние одного соединения
#[derive(Debug)]
pub struct Connection {
    dst: Address,
    transport: Transport,
    key: CacheKey,
    trial: Trial,
    round: u32,
    awaiting_request: bool,
    request: Option<Bytes>,
    host: Option<String>,
    eligible: Option<bool>,
    responded: bool,
}

impl Connection {
    /// Адрес назначения
    pub fn dst(&self) -> Address {
        self.dst
    }

    /// Транспорт
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Номер текущего запроса (с единицы, 0 до первого запроса)
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Имя хоста из первого буфера
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Результат проверки фильтров; `None` до первого буфера
    pub fn eligible(&self) -> Option<bool> {
        self.eligible
    }

    /// Профиль, применяемый сейчас
    pub fn profile(&self) -> Option<usize> {
        self.trial.current()
    }

    /// Состояние подбора
    pub fn state(&self) -> TrialState {
        self.trial.state()
    }

    /// Подбор профиля
    pub fn trial(&self) -> &Trial {
        &self.trial
    }

    fn active(&self) -> bool {
        self.eligible == Some(true) && self.trial.current().is_some()
    }
}

/// Разделяемый обработчик desync
#[derive(Debug, Clone)]
pub struct Desyncer {
    profiles: Arc<Vec<DesyncProfile>>,
    whitelist: Arc<Whitelist>,
    cache: CacheHandle,
    config: AutoConfig,
    recognized: DetectSet,
}

impl Desyncer {
    /// Создать обработчик; каждый профиль проверяется
    pub fn new(
        profiles: Vec<DesyncProfile>,
        whitelist: Whitelist,
        cache: CacheHandle,
        config: AutoConfig,
    ) -> Result<Self> {
        if profiles.is_empty() {
            return Err(AutoError::NoProfiles);
        }
        for profile in &profiles {
            profile.validate()?;
        }
        let recognized = recognized(&profiles);
        info!(
            "Desyncer: {} профилей, детекторы: {}",
            profiles.len(),
            recognized
        );

        Ok(Self {
            profiles: Arc::new(profiles),
            whitelist: Arc::new(whitelist),
            cache,
            config,
            recognized,
        })
    }

    /// Профили
    pub fn profiles(&self) -> &[DesyncProfile] {
        &self.profiles
    }

    /// Кэш параметров
    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    /// Параметры автоподбора
    pub fn config(&self) -> &AutoConfig {
        &self.config
    }

    /// Начать обработку соединения
    pub async fn open(&self, dst: Address, transport: Transport, now: u64) -> Connection {
        let key = CacheKey::new(dst, self.config.cache_by_port);
        let trial = {
            let cache = self.cache.read().await;
            Trial::start(
                key,
                self.profiles.len(),
                &cache,
                now,
                self.recognized,
                self.config.mode,
            )
        };
        trace!("open: {} {:?}, {:?}", dst, transport, trial.state());

        Connection {
            dst,
            transport,
            key,
            trial,
            round: 0,
            awaiting_request: true,
            request: None,
            host: None,
            eligible: None,
            responded: false,
        }
    }

    /// Построить план отправки исходящего буфера
    pub async fn outgoing(&self, conn: &mut Connection, buf: &[u8], _now: u64) -> Plan {
        if conn.awaiting_request {
            conn.round += 1;
            conn.awaiting_request = false;
        }
        if !self.whitelist.round_allows(conn.round) {
            trace!("{}: round {} outside range", conn.dst, conn.round);
            return Plan::passthrough(buf);
        }

        let hints = ProtoHints::scan(buf);
        if conn.eligible.is_none() {
            conn.host = hints.host_name(buf).map(str::to_string);
            let info = ConnInfo {
                dst: conn.dst,
                transport: conn.transport,
                kind: hints.kind,
                host: conn.host.as_deref(),
            };
            let eligible = self.whitelist.eligible(&info);
            if !eligible {
                debug!("{}: not in whitelist", conn.dst);
            }
            conn.eligible = Some(eligible);
        }
        if conn.request.is_none() {
            conn.request = Some(Bytes::copy_from_slice(buf));
        }

        if !conn.active() {
            return Plan::passthrough(buf);
        }
        let Some(profile) = conn.trial.current().and_then(|p| self.profiles.get(p)) else {
            return Plan::passthrough(buf);
        };

        let decoy = profile.decoy(buf, &hints);
        let engine = profile.engine();
        match conn.transport {
            Transport::Tcp => engine.apply(&profile.parts, buf, &hints, decoy.as_ref()),
            Transport::Udp => engine.apply_udp(buf, decoy.as_ref()),
        }
    }

    /// Обработать входящий буфер
    ///
    /// Первый ответ без признаков блокировки закрепляет профиль.
    pub async fn incoming(&self, conn: &mut Connection, buf: &[u8], now: u64) -> Verdict {
        conn.awaiting_request = true;
        if !conn.active() || conn.responded {
            return Verdict::Pass;
        }
        let request = conn.request.clone().unwrap_or_default();
        match classify_response(&request, buf) {
            Some(signal) => self.fail(conn, signal, false, now).await,
            None => {
                conn.responded = true;
                let mut cache = self.cache.write().await;
                conn.trial.on_success(&mut cache, conn.host.as_deref(), now);
                Verdict::Pass
            }
        }
    }

    /// Сообщить о сбросе соединения или таймауте
    pub async fn report(&self, conn: &mut Connection, signal: FailureSignal, now: u64) -> Verdict {
        if !conn.active() {
            return Verdict::Pass;
        }
        let after_response = conn.responded;
        self.fail(conn, signal, after_response, now).await
    }

    /// Дождаться исхода соединения с учётом настроенного таймаута
    pub async fn observe<F>(&self, conn: &mut Connection, outcome: F, now: u64) -> Verdict
    where
        F: Future<Output = Outcome>,
    {
        let outcome = match self.config.timeout {
            Some(limit) => match timeout(limit, outcome).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!("{}: no response in {:?}", conn.dst, limit);
                    return self.report(conn, FailureSignal::Timeout, now).await;
                }
            },
            None => outcome.await,
        };

        match outcome {
            Outcome::Response(data) => self.incoming(conn, &data, now).await,
            Outcome::Reset => self.report(conn, FailureSignal::Reset, now).await,
            Outcome::Closed => Verdict::Pass,
        }
    }

    async fn fail(
        &self,
        conn: &mut Connection,
        signal: FailureSignal,
        after_response: bool,
        now: u64,
    ) -> Verdict {
        let step = {
            let mut cache = self.cache.write().await;
            conn.trial.on_failure(signal, after_response, &mut cache, now)
        };
        match step {
            TrialStep::Retry(next) => {
                debug!("{}: retry with profile {}", conn.dst, next);
                conn.round = 0;
                conn.awaiting_request = true;
                conn.responded = false;
                Verdict::Retry
            }
            TrialStep::Bound(_) | TrialStep::Exhausted | TrialStep::Ignored => Verdict::Pass,
        }
    }
}
