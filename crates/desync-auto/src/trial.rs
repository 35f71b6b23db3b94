//! Автоматный подбор профиля для одного соединения
//!
//! ```text
//! Trying(p0) --неудача--> Trying(p1) --неудача--> ... --> Exhausted
//!     |                       |
//!     +-------успех-----------+------------------------> Bound(p)
//! ```
//!
//! Кандидаты перебираются строго по очереди при любом распознанном сигнале.
//! Свежая запись кэша даёт стартовый профиль без перебора. Неудача профиля из
//! кэша увеличивает счётчик записи; после порога запись удаляется и перебор
//! начинается с первого кандидата.
//!
//! Все изменения кэша выполняются через `&mut ParamCache`, то есть под
//! блокировкой записи вызывающей стороны.

use tracing::{debug, info};

use crate::cache::{CacheKey, FailureOutcome, ParamCache};
use crate::detect::FailureSignal;
use crate::profile::{AutoMode, DetectSet};

/// Состояние подбора
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrialState {
    /// Пробуется профиль
    Trying(usize),
    /// Профиль сработал
    Bound(usize),
    /// Кандидаты закончились, desync выключен
    Exhausted,
}

/// Результат обработки события
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialStep {
    /// Повторить соединение с другим профилем
    Retry(usize),
    /// Профиль закреплён
    Bound(usize),
    /// Перебор окончен без результата
    Exhausted,
    /// Сигнал не учитывается
    Ignored,
}

/// Подбор профиля для одного адреса назначения
#[derive(Debug, Clone)]
pub struct Trial {
    key: CacheKey,
    order: Vec<usize>,
    tried: Vec<usize>,
    state: TrialState,
    from_cache: bool,
    recognized: DetectSet,
    mode: AutoMode,
    history: Vec<TrialState>,
}

impl Trial {
    /// Начать подбор: свежая запись кэша или первый кандидат
    ///
    /// `profiles`: число профилей; при `AutoMode::SORT` кандидаты
    /// упорядочиваются по доле успехов (при равенстве по номеру).
    pub fn start(
        key: CacheKey,
        profiles: usize,
        cache: &ParamCache,
        now: u64,
        recognized: DetectSet,
        mode: AutoMode,
    ) -> Self {
        let mut order: Vec<usize> = (0..profiles).collect();
        if mode.contains(AutoMode::SORT) {
            order.sort_by(|a, b| cache.stats(*b).rate().total_cmp(&cache.stats(*a).rate()));
        }

        let cached = cache
            .get(&key, now)
            .map(|e| e.profile)
            .filter(|p| *p < profiles);
        let state = match (cached, order.first()) {
            (Some(p), _) => TrialState::Trying(p),
            (None, Some(&p)) => TrialState::Trying(p),
            (None, None) => TrialState::Exhausted,
        };
        if let Some(p) = cached {
            debug!("cache hit: {} -> profile {}", key, p);
        }

        Self {
            key,
            order,
            tried: Vec::new(),
            state,
            from_cache: cached.is_some(),
            recognized,
            mode,
            history: vec![state],
        }
    }

    /// Текущее состояние
    pub fn state(&self) -> TrialState {
        self.state
    }

    /// Профиль, который нужно применять сейчас
    pub fn current(&self) -> Option<usize> {
        match self.state {
            TrialState::Trying(p) | TrialState::Bound(p) => Some(p),
            TrialState::Exhausted => None,
        }
    }

    /// Выбран ли стартовый профиль из кэша
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// Последовательность пройденных состояний
    pub fn history(&self) -> &[TrialState] {
        &self.history
    }

    /// Порядок кандидатов
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    fn enter(&mut self, state: TrialState) {
        self.state = state;
        self.history.push(state);
    }

    /// Успех: закрепить профиль и записать его в кэш
    pub fn on_success(&mut self, cache: &mut ParamCache, host: Option<&str>, now: u64) -> TrialStep {
        let TrialState::Trying(p) = self.state else {
            return TrialStep::Ignored;
        };
        if self.from_cache && self.tried.is_empty() && cache.refresh(&self.key, p, now) {
            debug!("cache refresh: {} -> profile {}", self.key, p);
        } else {
            cache.bind(self.key, p, host.map(str::to_string), now);
        }
        self.enter(TrialState::Bound(p));
        TrialStep::Bound(p)
    }

    /// Неудача: перейти к следующему кандидату
    ///
    /// `after_response`: сигнал пришёл после первого ответа сервера; такие
    /// сигналы учитываются только в режиме `POST_RESP`.
    pub fn on_failure(
        &mut self,
        signal: FailureSignal,
        after_response: bool,
        cache: &mut ParamCache,
        now: u64,
    ) -> TrialStep {
        let Some(p) = self.current() else {
            return TrialStep::Ignored;
        };
        if !self.recognized.intersects(signal.detect_bit()) {
            debug!("{}: signal {} not recognized", self.key, signal);
            return TrialStep::Ignored;
        }
        if after_response && !self.mode.contains(AutoMode::POST_RESP) {
            debug!("{}: {} after response ignored", self.key, signal);
            return TrialStep::Ignored;
        }

        info!("trigger: {} on {}, profile {}", signal, self.key, p);
        self.tried.push(p);

        // Позиция, с которой ищется следующий кандидат
        let mut from = self.order.iter().position(|&c| c == p).map_or(0, |i| i + 1);
        let cached_profile = self.from_cache && self.tried.len() == 1;
        if cached_profile || matches!(self.state, TrialState::Bound(_)) {
            match cache.record_failure(&self.key, p, now) {
                FailureOutcome::Evicted => {
                    debug!("{}: cache entry evicted, restart", self.key);
                    from = 0;
                }
                FailureOutcome::Counted(n) => debug!("{}: cache failures {}", self.key, n),
                FailureOutcome::Missing => cache.note_failure(p),
            }
        } else {
            cache.note_failure(p);
        }

        let next = self.order[from.min(self.order.len())..]
            .iter()
            .chain(self.order[..from.min(self.order.len())].iter())
            .copied()
            .find(|c| !self.tried.contains(c));

        match next {
            Some(n) => {
                self.enter(TrialState::Trying(n));
                TrialStep::Retry(n)
            }
            None => {
                info!("unreach ip: {}", self.key);
                self.enter(TrialState::Exhausted);
                TrialStep::Exhausted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use desync_core::Address;
    use std::net::Ipv4Addr;

    fn key() -> CacheKey {
        CacheKey::new(Address::V4(Ipv4Addr::new(93, 184, 216, 34), Some(443)), false)
    }

    fn all() -> DetectSet {
        DetectSet::all()
    }

    #[test]
    fn test_scenario_bound_to_third() {
        // [torst, redirect, ssl_err, none]
        let recognized = DetectSet::TORST | DetectSet::REDIRECT | DetectSet::SSL_ERR;
        let mut cache = ParamCache::new(60, 3);
        let mut trial = Trial::start(key(), 4, &cache, 1000, recognized, AutoMode::empty());

        assert_eq!(
            trial.on_failure(FailureSignal::Reset, false, &mut cache, 1000),
            TrialStep::Retry(1)
        );
        assert_eq!(
            trial.on_failure(FailureSignal::Reset, false, &mut cache, 1001),
            TrialStep::Retry(2)
        );
        assert_eq!(trial.on_success(&mut cache, Some("example.com"), 1002), TrialStep::Bound(2));

        assert_eq!(
            trial.history(),
            &[
                TrialState::Trying(0),
                TrialState::Trying(1),
                TrialState::Trying(2),
                TrialState::Bound(2)
            ]
        );
        let entry = cache.get(&key(), 1002).unwrap();
        assert_eq!(entry.profile, 2);
        assert_eq!(entry.host.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_exhausted() {
        let mut cache = ParamCache::new(60, 3);
        let mut trial = Trial::start(key(), 2, &cache, 0, all(), AutoMode::empty());
        assert_eq!(trial.on_failure(FailureSignal::Timeout, false, &mut cache, 0), TrialStep::Retry(1));
        assert_eq!(trial.on_failure(FailureSignal::Reset, false, &mut cache, 0), TrialStep::Exhausted);
        assert_eq!(trial.current(), None);
        assert!(cache.is_empty());
        assert_eq!(trial.on_failure(FailureSignal::Reset, false, &mut cache, 0), TrialStep::Ignored);
    }

    #[test]
    fn test_cached_profile_used_directly() {
        let mut cache = ParamCache::new(60, 3);
        cache.bind(key(), 2, None, 1000);
        let mut trial = Trial::start(key(), 4, &cache, 1030, all(), AutoMode::empty());
        assert!(trial.from_cache());
        assert_eq!(trial.state(), TrialState::Trying(2));
        assert_eq!(trial.on_success(&mut cache, None, 1030), TrialStep::Bound(2));
        assert_eq!(cache.get(&key(), 1030).unwrap().timestamp, 1030);

        // Устаревшая запись не используется
        let trial = Trial::start(key(), 4, &cache, 2000, all(), AutoMode::empty());
        assert!(!trial.from_cache());
        assert_eq!(trial.state(), TrialState::Trying(0));
    }

    #[test]
    fn test_cached_failure_after_rebind() {
        let mut cache = ParamCache::new(60, 1);
        cache.bind(key(), 1, None, 1000);
        let mut trial = Trial::start(key(), 4, &cache, 1001, all(), AutoMode::empty());
        assert_eq!(trial.state(), TrialState::Trying(1));

        // Другое соединение успело привязать профиль 3
        cache.bind(key(), 3, None, 1002);
        assert_eq!(trial.on_failure(FailureSignal::Reset, false, &mut cache, 1003), TrialStep::Retry(2));

        let entry = cache.get(&key(), 1003).unwrap();
        assert_eq!(entry.profile, 3);
        assert_eq!(entry.failures, 0);
        assert_eq!(cache.stats(3).failures, 0);
        assert_eq!(cache.stats(1).failures, 1);
    }

    #[test]
    fn test_cached_failure_below_threshold() {
        let mut cache = ParamCache::new(60, 3);
        cache.bind(key(), 1, None, 1000);
        let mut trial = Trial::start(key(), 4, &cache, 1001, all(), AutoMode::empty());
        assert_eq!(trial.on_failure(FailureSignal::Reset, false, &mut cache, 1001), TrialStep::Retry(2));
        assert_eq!(cache.get(&key(), 1001).unwrap().failures, 1);
    }

    #[test]
    fn test_cached_failure_threshold_restarts() {
        let mut cache = ParamCache::new(60, 1);
        cache.bind(key(), 2, None, 1000);
        let mut trial = Trial::start(key(), 4, &cache, 1001, all(), AutoMode::empty());
        assert_eq!(trial.on_failure(FailureSignal::Reset, false, &mut cache, 1001), TrialStep::Retry(0));
        assert!(cache.get(&key(), 1001).is_none());
    }

    #[test]
    fn test_unrecognized_signal() {
        let mut cache = ParamCache::new(60, 3);
        let mut trial = Trial::start(key(), 3, &cache, 0, DetectSet::TORST, AutoMode::empty());
        assert_eq!(trial.on_failure(FailureSignal::Redirect, false, &mut cache, 0), TrialStep::Ignored);
        assert_eq!(trial.state(), TrialState::Trying(0));
    }

    #[test]
    fn test_post_resp() {
        let mut cache = ParamCache::new(60, 3);
        let mut trial = Trial::start(key(), 3, &cache, 0, all(), AutoMode::empty());
        trial.on_success(&mut cache, None, 0);
        assert_eq!(trial.on_failure(FailureSignal::Reset, true, &mut cache, 1), TrialStep::Ignored);

        let mut trial = Trial::start(key(), 3, &cache, 1, all(), AutoMode::POST_RESP);
        assert_eq!(trial.on_success(&mut cache, None, 1), TrialStep::Bound(0));
        assert_eq!(trial.on_failure(FailureSignal::Reset, true, &mut cache, 2), TrialStep::Retry(1));
        assert_eq!(cache.get(&key(), 2).unwrap().failures, 1);
    }

    #[test]
    fn test_sort_by_success_rate() {
        let mut cache = ParamCache::new(60, 3);
        let other = CacheKey::new(Address::V4(Ipv4Addr::new(1, 1, 1, 1), None), false);
        cache.bind(other, 2, None, 0);
        cache.bind(other, 2, None, 0);
        cache.note_failure(0);

        let trial = Trial::start(key(), 3, &cache, 0, all(), AutoMode::SORT);
        assert_eq!(trial.order(), &[2, 1, 0]);
        assert_eq!(trial.state(), TrialState::Trying(2));

        let trial = Trial::start(key(), 3, &cache, 0, all(), AutoMode::empty());
        assert_eq!(trial.order(), &[0, 1, 2]);
    }

    #[test]
    fn test_no_profiles() {
        let cache = ParamCache::new(60, 3);
        let trial = Trial::start(key(), 0, &cache, 0, all(), AutoMode::empty());
        assert_eq!(trial.state(), TrialState::Exhausted);
    }
}
