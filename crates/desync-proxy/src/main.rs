//! Desync Proxy
//!
//! Загрузка и проверка профилей desync, просмотр плана отправки для
//! сохранённого запроса, обслуживание кэша удачных параметров.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{ProxyConfig, Runtime};
use desync_auto::{unix_now, CacheHandle, Desyncer, ParamCache};
use desync_core::{ProtoHints, WireOp};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Аргументы командной строки
#[derive(Parser, Debug)]
#[command(name = "desync-proxy")]
#[command(about = "Desync proxy: stream fragmentation against DPI", long_about = None)]
struct Args {
    /// Путь к конфигурационному файлу
    #[arg(short, long, default_value = "desync.toml")]
    config: PathBuf,

    /// Генерация примера конфигурации
    #[arg(long)]
    generate_config: Option<PathBuf>,

    /// Уровень логирования (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Проверить конфигурацию и вывести профили
    Check,

    /// Построить план отправки для сохранённого буфера
    Plan {
        /// Номер профиля
        #[arg(short, long, default_value_t = 0)]
        profile: usize,

        /// Файл с исходящим буфером
        #[arg(short, long)]
        input: PathBuf,

        /// Буфер является UDP датаграммой
        #[arg(long)]
        udp: bool,

        /// Вывод в JSON
        #[arg(long)]
        json: bool,
    },

    /// Показать кэш параметров
    Cache {
        /// Удалить устаревшие записи
        #[arg(long)]
        purge: bool,

        /// Вывести строки дампа без форматирования
        #[arg(long)]
        raw: bool,
    },

    /// Держать кэш: очистка по таймеру и дамп при остановке
    Run,
}

/// Операция плана для вывода
#[derive(Debug, Serialize)]
struct OpView {
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<usize>,
    len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    urgent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<u8>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    md5sig: bool,
    data: String,
}

impl From<&WireOp> for OpView {
    fn from(op: &WireOp) -> Self {
        let (offset, data, urgent, ttl, md5sig) = match op {
            WireOp::Write { offset, data } => (Some(*offset), data, None, None, false),
            WireOp::WriteOob {
                offset,
                data,
                urgent,
            } => (Some(*offset), data, Some(*urgent), None, false),
            WireOp::WriteReordered {
                offset,
                data,
                urgent,
            } => (Some(*offset), data, *urgent, None, false),
            WireOp::InjectFake { data, ttl, md5sig } => (None, data, None, Some(*ttl), *md5sig),
        };
        Self {
            kind: op.kind(),
            offset,
            len: data.len(),
            urgent,
            ttl,
            md5sig,
            data: hex::encode(data),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Генерация конфигурации, если запрошено
    if let Some(path) = args.generate_config {
        if let Err(e) = ProxyConfig::default().to_file(&path) {
            eprintln!("Ошибка генерации конфигурации: {}", e);
            std::process::exit(1);
        }
        println!("Конфигурация сохранена в: {}", path.display());
        return;
    }

    // Загрузка конфигурации
    let config = match ProxyConfig::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Ошибка загрузки конфигурации: {:#}", e);
            eprintln!("Проверьте файл: {}", args.config.display());
            if !args.config.exists() {
                eprintln!("Пример: desync-proxy --generate-config {}", args.config.display());
            }
            std::process::exit(1);
        }
    };

    // Инициализация логирования
    let log_level = match &args.log_level {
        Some(level) => level.parse().unwrap_or(tracing::Level::INFO),
        None => config.log_level().unwrap_or(tracing::Level::INFO),
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Не удалось установить global subscriber");

    let runtime = match config.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Ошибка конфигурации: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = match args.command.unwrap_or(Command::Check) {
        Command::Check => {
            check(&runtime);
            Ok(())
        }
        Command::Plan {
            profile,
            input,
            udp,
            json,
        } => plan(&runtime, profile, &input, udp, json),
        Command::Cache { purge, raw } => show_cache(&config, &runtime, purge, raw),
        Command::Run => run(&config, runtime).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Вывод профилей в канонической форме
fn check(runtime: &Runtime) {
    println!("Профили:");
    for profile in &runtime.profiles {
        println!("  {}: {} [detect: {}]", profile.id, profile.describe(), profile.detect);
        if !profile.options.http_mod.is_empty() {
            println!("     http_mod: {:?}", profile.options.http_mod);
        }
        if profile.options.udp_fakes > 0 {
            println!("     udp_fakes: {}", profile.options.udp_fakes);
        }
        if let Some(fake) = &profile.fake {
            let spec = fake.spec();
            let sni = spec.sni.as_ref().map(ToString::to_string).unwrap_or_default();
            println!("     fake: ttl={} sni={} tls_mod={:?}", spec.ttl, sni, spec.tls_mod);
        }
    }

    let auto = &runtime.auto;
    println!(
        "Автоподбор: mode={:?}, ttl={}s, порог={}, таймаут={:?}",
        auto.mode, auto.cache_ttl, auto.fail_threshold, auto.timeout
    );
    println!("Раунды: {}-{}", runtime.whitelist.rounds.lo, runtime.whitelist.rounds.hi);
}

/// План отправки для буфера из файла
fn plan(runtime: &Runtime, id: usize, input: &Path, udp: bool, json: bool) -> anyhow::Result<()> {
    let profile = runtime
        .profiles
        .get(id)
        .with_context(|| format!("Нет профиля {}", id))?;
    let buffer =
        std::fs::read(input).with_context(|| format!("Не удалось прочитать {}", input.display()))?;

    let hints = ProtoHints::scan(&buffer);
    let decoy = profile.decoy(&buffer, &hints);
    let engine = profile.engine();
    let plan = if udp {
        engine.apply_udp(&buffer, decoy.as_ref())
    } else {
        engine.apply(&profile.parts, &buffer, &hints, decoy.as_ref())
    };

    let ops: Vec<OpView> = plan.ops.iter().map(OpView::from).collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&ops)?);
        return Ok(());
    }

    println!("Протокол: {:?}", hints.kind);
    if let Some(host) = hints.host_name(&buffer) {
        println!("Хост: {}", host);
    }
    for op in &ops {
        match (op.offset, op.ttl) {
            (Some(offset), _) => println!("  {:<10} @{:<5} {} байт", op.kind, offset, op.len),
            (None, Some(ttl)) => println!("  {:<10} ttl={:<3} {} байт", op.kind, ttl, op.len),
            (None, None) => println!("  {:<10} {} байт", op.kind, op.len),
        }
    }
    for (spec, reason) in &plan.skipped {
        println!("  пропущено {}: {}", spec, reason);
    }
    Ok(())
}

/// Загрузить кэш из дампа; ошибка чтения не фатальна
fn load_cache(config: &ProxyConfig, runtime: &Runtime, now: u64) -> ParamCache {
    let mut cache = ParamCache::new(runtime.auto.cache_ttl, runtime.auto.fail_threshold);
    if let Some(path) = config.cache_dump() {
        match cache.load_file(&path, now, runtime.profiles.len()) {
            Ok(count) => info!("Загружено {} записей кэша из {}", count, path.display()),
            Err(e) => warn!("{}, кэш пуст", e),
        }
    }
    cache
}

/// Вывод кэша
fn show_cache(config: &ProxyConfig, runtime: &Runtime, purge: bool, raw: bool) -> anyhow::Result<()> {
    let path = config
        .cache_dump()
        .context("В конфигурации не задан auto.cache_dump")?;
    let now = unix_now();
    let mut cache = load_cache(config, runtime, now);

    if purge {
        let removed = cache.purge_expired(now);
        info!("Удалено {} устаревших записей", removed);
    }

    if raw {
        cache.dump(std::io::stdout().lock())?;
    } else {
        let mut entries: Vec<_> = cache.iter().collect();
        entries.sort_by_key(|(_, e)| std::cmp::Reverse(e.timestamp));
        for (key, entry) in entries {
            let time = chrono::DateTime::from_timestamp(entry.timestamp as i64, 0)
                .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| entry.timestamp.to_string());
            println!(
                "{:<24} profile={:<3} failures={} {} {}",
                key.to_string(),
                entry.profile,
                entry.failures,
                time,
                entry.host.as_deref().unwrap_or("-")
            );
        }
        println!("Записей: {}", cache.len());
    }

    if let Err(e) = cache.dump_to_file(&path) {
        warn!("{}", e);
    }
    Ok(())
}

/// Долгоживущий режим: кэш общий для всех соединений
async fn run(config: &ProxyConfig, runtime: Runtime) -> anyhow::Result<()> {
    info!("Desync Proxy v{}", env!("CARGO_PKG_VERSION"));

    let cache = CacheHandle::new(load_cache(config, &runtime, unix_now()));
    let desyncer = Desyncer::new(runtime.profiles, runtime.whitelist, cache.clone(), runtime.auto)?;
    info!("  • Профилей: {}", desyncer.profiles().len());
    info!("  • TTL кэша: {}s", desyncer.config().cache_ttl);

    // Фоновая очистка устаревших записей
    let cleanup = cache.clone();
    let interval = config.purge_interval();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let removed = cleanup.purge_expired(unix_now()).await;
            if removed > 0 {
                info!("Очищено {} устаревших записей кэша", removed);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Получен сигнал Ctrl+C, остановка...");

    if let Some(path) = config.cache_dump() {
        match cache.dump_to_file(&path).await {
            Ok(count) => info!("Сохранено {} записей кэша в {}", count, path.display()),
            Err(e) => warn!("{}", e),
        }
    }

    info!("Остановлено");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use desync_auto::CacheKey;
    use desync_core::Address;

    fn op(offset: usize, data: &[u8], urgent: Option<u8>) -> WireOp {
        let data = data.to_vec().into();
        match urgent {
            Some(urgent) => WireOp::WriteOob {
                offset,
                data,
                urgent,
            },
            None => WireOp::Write { offset, data },
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("desync-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_op_view() {
        let view = OpView::from(&op(3, b"abc", Some(b'a')));
        assert_eq!(view.kind, "oob");
        assert_eq!(view.offset, Some(3));
        assert_eq!(view.urgent, Some(b'a'));
        assert_eq!(view.data, "616263");

        let json = serde_json::to_string(&OpView::from(&op(0, b"\x01", None))).unwrap();
        assert_eq!(json, r#"{"kind":"write","offset":0,"len":1,"data":"01"}"#);
    }

    #[test]
    fn test_args() {
        let args = Args::parse_from([
            "desync-proxy",
            "-c",
            "x.toml",
            "plan",
            "--input",
            "req.bin",
            "--json",
        ]);
        assert_eq!(args.config, PathBuf::from("x.toml"));
        assert!(matches!(
            args.command,
            Some(Command::Plan {
                profile: 0,
                json: true,
                udp: false,
                ..
            })
        ));
        assert!(Args::parse_from(["desync-proxy"]).command.is_none());
    }

    #[test]
    fn test_plan_from_file() {
        let dir = temp_dir("plan");
        let input = dir.join("req.bin");
        std::fs::write(&input, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();

        let runtime = ProxyConfig::default().build().unwrap();
        assert!(plan(&runtime, 0, &input, false, true).is_ok());
        assert!(plan(&runtime, 1, &input, true, false).is_ok());
        assert!(plan(&runtime, 9, &input, false, false).is_err());
        assert!(plan(&runtime, 0, &dir.join("missing.bin"), false, false).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_cache_dump() {
        let dir = temp_dir("cache");
        let mut config = ProxyConfig::default();
        config.auto.cache_dump = dir.join("cache.txt").display().to_string();
        let runtime = config.build().unwrap();
        let now = unix_now();

        // Нет файла: пустой кэш
        assert!(load_cache(&config, &runtime, now).is_empty());

        let mut cache = ParamCache::new(runtime.auto.cache_ttl, runtime.auto.fail_threshold);
        let key = CacheKey::new(Address::parse("1.2.3.4:443").unwrap(), false);
        cache.bind(key, 1, Some("example.com".to_string()), now);
        cache.dump_to_file(&dir.join("cache.txt")).unwrap();

        let handle = CacheHandle::new(load_cache(&config, &runtime, now));
        tokio_test::block_on(async {
            assert_eq!(handle.len().await, 1);
            assert_eq!(handle.lookup(&key, now).await.unwrap().profile, 1);
        });

        assert!(show_cache(&config, &runtime, true, false).is_ok());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
