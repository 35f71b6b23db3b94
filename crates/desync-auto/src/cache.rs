//! Кэш удачных параметров по адресу назначения
//!
//! Запись создаётся при первом успехе, обновляется при каждом использовании и
//! считается устаревшей, когда `now - timestamp > ttl`. Рядом с записями
//! хранится статистика успехов профилей для режима сортировки.
//!
//! Формат дампа, одна запись в строке:
//! ```text
//! 0 <ip> <port> <profile-id> <timestamp> <failures> [host]
//! ```
//! Порт `0` означает ключ без порта.

use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use desync_core::Address;

use crate::error::{AutoError, Result};

/// Текущее время в секундах unix
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Ключ кэша: IP назначения и, при `cache_by_port`, порт
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// IP адрес (IPv4-mapped приводится к IPv4)
    pub ip: IpAddr,
    /// Порт
    pub port: Option<u16>,
}

impl CacheKey {
    /// Ключ для адреса назначения
    pub fn new(dst: Address, by_port: bool) -> Self {
        let dst = dst.canonical();
        Self {
            ip: dst.ip(),
            port: if by_port { dst.port() } else { None },
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Address::from(self.ip).with_port(self.port), f)
    }
}

/// Запись кэша
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Номер удачного профиля
    pub profile: usize,
    /// Время последнего использования
    pub timestamp: u64,
    /// Неудачи подряд
    pub failures: u32,
    /// Имя хоста, с которым был успех
    pub host: Option<String>,
}

/// Статистика профиля
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileStats {
    /// Успехи
    pub successes: u64,
    /// Неудачи
    pub failures: u64,
}

impl ProfileStats {
    /// Доля успехов со сглаживанием: у непроверенного профиля 0.5
    pub fn rate(&self) -> f64 {
        (self.successes as f64 + 1.0) / ((self.successes + self.failures) as f64 + 2.0)
    }
}

/// Результат учёта неудачи
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Записи нет, она устарела или в ней другой профиль
    Missing,
    /// Счётчик увеличен
    Counted(u32),
    /// Порог достигнут, запись удалена
    Evicted,
}

/// Кэш параметров
#[derive(Debug, Clone)]
pub struct ParamCache {
    entries: HashMap<CacheKey, CacheEntry>,
    stats: HashMap<usize, ProfileStats>,
    ttl: u64,
    fail_threshold: u32,
}

impl ParamCache {
    /// Создать пустой кэш
    pub fn new(ttl: u64, fail_threshold: u32) -> Self {
        Self {
            entries: HashMap::new(),
            stats: HashMap::new(),
            ttl,
            fail_threshold: fail_threshold.max(1),
        }
    }

    /// Время жизни записи
    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    fn is_fresh(&self, entry: &CacheEntry, now: u64) -> bool {
        now.saturating_sub(entry.timestamp) <= self.ttl
    }

    /// Свежая запись для ключа
    pub fn get(&self, key: &CacheKey, now: u64) -> Option<&CacheEntry> {
        self.entries.get(key).filter(|e| self.is_fresh(e, now))
    }

    /// Записать удачный профиль (счётчик неудач сбрасывается)
    pub fn bind(&mut self, key: CacheKey, profile: usize, host: Option<String>, now: u64) {
        let entry = CacheEntry {
            profile,
            timestamp: now,
            failures: 0,
            host,
        };
        self.entries.insert(key, entry);
        self.stats.entry(profile).or_default().successes += 1;
        info!("save: ip={}, id={}", key, profile);
    }

    /// Обновить время записи после успешного использования `profile`
    ///
    /// Устаревшая запись или запись с другим профилем не трогается.
    pub fn refresh(&mut self, key: &CacheKey, profile: usize, now: u64) -> bool {
        let ttl = self.ttl;
        let Some(entry) = self
            .entries
            .get_mut(key)
            .filter(|e| e.profile == profile && now.saturating_sub(e.timestamp) <= ttl)
        else {
            return false;
        };
        entry.timestamp = now;
        entry.failures = 0;
        let profile = entry.profile;
        self.stats.entry(profile).or_default().successes += 1;
        true
    }

    /// Учесть неудачу `profile`, взятого из записи
    ///
    /// Если запись тем временем перезаписана другим профилем, она не
    /// меняется.
    pub fn record_failure(&mut self, key: &CacheKey, profile: usize, now: u64) -> FailureOutcome {
        let ttl = self.ttl;
        let Some(entry) = self
            .entries
            .get_mut(key)
            .filter(|e| e.profile == profile && now.saturating_sub(e.timestamp) <= ttl)
        else {
            return FailureOutcome::Missing;
        };
        entry.failures += 1;
        let (profile, failures) = (entry.profile, entry.failures);
        self.stats.entry(profile).or_default().failures += 1;

        if failures >= self.fail_threshold {
            self.entries.remove(key);
            debug!("cache evict: {} after {} failures", key, failures);
            FailureOutcome::Evicted
        } else {
            FailureOutcome::Counted(failures)
        }
    }

    /// Учесть неудачу профиля вне записи кэша (для статистики сортировки)
    pub fn note_failure(&mut self, profile: usize) {
        self.stats.entry(profile).or_default().failures += 1;
    }

    /// Статистика профиля
    pub fn stats(&self, profile: usize) -> ProfileStats {
        self.stats.get(&profile).copied().unwrap_or_default()
    }

    /// Удалить запись
    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    /// Удалить устаревшие записи
    pub fn purge_expired(&mut self, now: u64) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_sub(e.timestamp) <= ttl);
        before - self.entries.len()
    }

    /// Количество записей
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Пуст ли кэш
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Все записи (порядок не определён)
    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, &CacheEntry)> {
        self.entries.iter()
    }

    /// Записать дамп
    pub fn dump<W: Write>(&self, mut out: W) -> std::io::Result<usize> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by_key(|(_, e)| e.timestamp);
        for (key, entry) in &entries {
            write!(
                out,
                "0 {} {} {} {} {}",
                key.ip,
                key.port.unwrap_or(0),
                entry.profile,
                entry.timestamp,
                entry.failures
            )?;
            if let Some(host) = &entry.host {
                write!(out, " {}", host)?;
            }
            writeln!(out)?;
        }
        Ok(entries.len())
    }

    /// Загрузить дамп; плохие строки пропускаются, устаревшие записи и
    /// неизвестные профили отбрасываются. Возвращает число загруженных записей
    pub fn load<R: BufRead>(&mut self, input: R, now: u64, profiles: usize) -> usize {
        let mut loaded = 0;
        for (n, line) in input.lines().enumerate() {
            let Ok(line) = line else {
                warn!("cache dump: read error at line {}", n + 1);
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            let Some((key, entry)) = parse_line(&line) else {
                warn!("cache dump: bad line {}: {:?}", n + 1, line);
                continue;
            };
            if entry.profile >= profiles || !self.is_fresh(&entry, now) {
                debug!("cache dump: drop {} (profile {})", key, entry.profile);
                continue;
            }
            self.entries.insert(key, entry);
            loaded += 1;
        }
        loaded
    }

    /// Записать дамп в файл
    pub fn dump_to_file(&self, path: &Path) -> Result<usize> {
        let io_err = |source| AutoError::CacheIo {
            path: path.display().to_string(),
            source,
        };
        let mut file = std::fs::File::create(path).map_err(io_err)?;
        let count = self.dump(&mut file).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        Ok(count)
    }

    /// Загрузить дамп из файла
    pub fn load_file(&mut self, path: &Path, now: u64, profiles: usize) -> Result<usize> {
        let file = std::fs::File::open(path).map_err(|source| AutoError::CacheIo {
            path: path.display().to_string(),
            source,
        })?;
        Ok(self.load(BufReader::new(file), now, profiles))
    }
}

fn parse_line(line: &str) -> Option<(CacheKey, CacheEntry)> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "0" {
        return None;
    }
    let ip: IpAddr = fields.next()?.parse().ok()?;
    let port: u16 = fields.next()?.parse().ok()?;
    let profile: usize = fields.next()?.parse().ok()?;
    let timestamp: u64 = fields.next()?.parse().ok()?;
    let failures: u32 = fields.next()?.parse().ok()?;
    let host = fields.next().map(str::to_string);
    if fields.next().is_some() {
        return None;
    }

    let key = CacheKey::new(
        Address::from(ip).with_port((port != 0).then_some(port)),
        true,
    );
    Some((
        key,
        CacheEntry {
            profile,
            timestamp,
            failures,
            host,
        },
    ))
}

/// Разделяемый между соединениями кэш
///
/// Каждое изменение записи выполняется целиком под блокировкой записи.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    inner: Arc<RwLock<ParamCache>>,
}

impl CacheHandle {
    /// Обернуть кэш
    pub fn new(cache: ParamCache) -> Self {
        Self {
            inner: Arc::new(RwLock::new(cache)),
        }
    }

    /// Блокировка на чтение
    pub async fn read(&self) -> RwLockReadGuard<'_, ParamCache> {
        self.inner.read().await
    }

    /// Блокировка на запись
    pub async fn write(&self) -> RwLockWriteGuard<'_, ParamCache> {
        self.inner.write().await
    }

    /// Копия свежей записи
    pub async fn lookup(&self, key: &CacheKey, now: u64) -> Option<CacheEntry> {
        self.inner.read().await.get(key, now).cloned()
    }

    /// Удалить устаревшие записи
    pub async fn purge_expired(&self, now: u64) -> usize {
        self.inner.write().await.purge_expired(now)
    }

    /// Количество записей
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Записать дамп в файл
    pub async fn dump_to_file(&self, path: &Path) -> Result<usize> {
        self.inner.read().await.dump_to_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key(last: u8) -> CacheKey {
        CacheKey::new(
            Address::V4(Ipv4Addr::new(10, 0, 0, last), Some(443)),
            false,
        )
    }

    #[test]
    fn test_ttl() {
        let mut cache = ParamCache::new(60, 3);
        cache.bind(key(1), 2, None, 1000);
        assert_eq!(cache.get(&key(1), 1059).map(|e| e.profile), Some(2));
        assert_eq!(cache.get(&key(1), 1060).map(|e| e.profile), Some(2));
        assert!(cache.get(&key(1), 1061).is_none());

        assert_eq!(cache.purge_expired(1061), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_refresh() {
        let mut cache = ParamCache::new(60, 3);
        cache.bind(key(1), 0, None, 1000);
        assert!(cache.refresh(&key(1), 0, 1050));
        assert!(cache.get(&key(1), 1100).is_some());
        assert!(!cache.refresh(&key(2), 0, 1050));
    }

    #[test]
    fn test_refresh_expired_or_rebound() {
        let mut cache = ParamCache::new(60, 3);
        cache.bind(key(1), 0, None, 1000);
        assert!(!cache.refresh(&key(1), 0, 1061));
        assert!(cache.get(&key(1), 1061).is_none());

        cache.bind(key(1), 2, None, 1100);
        assert!(!cache.refresh(&key(1), 0, 1101));
        assert_eq!(cache.stats(0).successes, 1);
    }

    #[test]
    fn test_failure_of_replaced_profile() {
        let mut cache = ParamCache::new(60, 1);
        cache.bind(key(1), 3, None, 1000);
        assert_eq!(cache.record_failure(&key(1), 1, 1001), FailureOutcome::Missing);
        assert_eq!(cache.get(&key(1), 1002).unwrap().profile, 3);
        assert_eq!(cache.get(&key(1), 1002).unwrap().failures, 0);
        assert_eq!(cache.stats(3).failures, 0);
    }

    #[test]
    fn test_failure_threshold() {
        let mut cache = ParamCache::new(60, 3);
        cache.bind(key(1), 1, None, 1000);
        assert_eq!(cache.record_failure(&key(1), 1, 1001), FailureOutcome::Counted(1));
        assert_eq!(cache.record_failure(&key(1), 1, 1002), FailureOutcome::Counted(2));
        assert_eq!(cache.record_failure(&key(1), 1, 1003), FailureOutcome::Evicted);
        assert!(cache.get(&key(1), 1004).is_none());
        assert_eq!(cache.record_failure(&key(1), 1, 1004), FailureOutcome::Missing);
        assert_eq!(cache.stats(1).failures, 3);
    }

    #[test]
    fn test_success_resets_failures() {
        let mut cache = ParamCache::new(60, 2);
        cache.bind(key(1), 1, None, 1000);
        cache.record_failure(&key(1), 1, 1001);
        cache.refresh(&key(1), 1, 1002);
        assert_eq!(cache.record_failure(&key(1), 1, 1003), FailureOutcome::Counted(1));
    }

    #[test]
    fn test_key_by_port() {
        let a = Address::V4(Ipv4Addr::new(1, 2, 3, 4), Some(80));
        let b = Address::V4(Ipv4Addr::new(1, 2, 3, 4), Some(443));
        assert_eq!(CacheKey::new(a, false), CacheKey::new(b, false));
        assert_ne!(CacheKey::new(a, true), CacheKey::new(b, true));

        let mapped: Address = "[::ffff:1.2.3.4]:80".parse().unwrap();
        assert_eq!(CacheKey::new(mapped, true), CacheKey::new(a, true));
        assert_eq!(CacheKey::new(a, true).to_string(), "1.2.3.4:80");
    }

    #[test]
    fn test_dump_load() {
        let mut cache = ParamCache::new(100, 3);
        cache.bind(key(1), 0, Some("example.com".into()), 1000);
        let by_port = CacheKey::new("[2001:db8::1]:8443".parse().unwrap(), true);
        cache.bind(by_port, 2, None, 1010);

        let mut out = Vec::new();
        assert_eq!(cache.dump(&mut out).unwrap(), 2);
        let text = String::from_utf8(out.clone()).unwrap();
        assert_eq!(
            text,
            "0 10.0.0.1 0 0 1000 0 example.com\n0 2001:db8::1 8443 2 1010 0\n"
        );

        let mut restored = ParamCache::new(100, 3);
        assert_eq!(restored.load(&out[..], 1050, 3), 2);
        assert_eq!(
            restored.get(&key(1), 1050).unwrap().host.as_deref(),
            Some("example.com")
        );
        assert_eq!(restored.get(&by_port, 1050).unwrap().profile, 2);

        // Устаревшие записи и неизвестные профили отбрасываются
        let mut restored = ParamCache::new(100, 3);
        assert_eq!(restored.load(&out[..], 1105, 3), 1);
        let mut restored = ParamCache::new(100, 3);
        assert_eq!(restored.load(&out[..], 1050, 1), 1);
    }

    #[test]
    fn test_corrupt_dump() {
        let mut cache = ParamCache::new(100, 3);
        let garbage = b"hello world\n1 1.1.1.1 0 0 0 0\n0 not-an-ip 0 0 0 0\n0 1.1.1.1 0 x 0 0\n\xff\xfe";
        assert_eq!(cache.load(&garbage[..], 0, 5), 0);
        assert!(cache.is_empty());

        let missing = Path::new("/nonexistent/desync.cache");
        assert!(matches!(
            cache.load_file(missing, 0, 5),
            Err(AutoError::CacheIo { .. })
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_dump_file_roundtrip() {
        let path = std::env::temp_dir().join("desync-auto-cache-test.txt");
        let mut cache = ParamCache::new(100, 3);
        cache.bind(key(7), 1, None, 500);
        assert_eq!(cache.dump_to_file(&path).unwrap(), 1);

        let mut restored = ParamCache::new(100, 3);
        assert_eq!(restored.load_file(&path, 550, 2).unwrap(), 1);
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_handle_concurrent_updates() {
        let handle = CacheHandle::new(ParamCache::new(60, 100));
        handle.write().await.bind(key(1), 0, None, 1000);

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let h = handle.clone();
            tasks.push(tokio::spawn(async move {
                h.write().await.record_failure(&key(1), 0, 1001);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(handle.lookup(&key(1), 1002).await.unwrap().failures, 20);
        assert_eq!(handle.len().await, 1);
        assert_eq!(handle.purge_expired(2000).await, 1);
    }
}
