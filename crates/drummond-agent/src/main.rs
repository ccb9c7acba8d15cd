use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

mod csv_source;

use bar_store::BarStore;
use calc_cache::CalcCache;
use csv_source::CsvBarSource;
use drummond_core::DrummondConfig;
use notification_router::{ChatSink, ConsoleSink, NotificationRouter, RateLimit, WebhookSink};
use persistence::SqliteStore;
use scheduler::{
    CycleDeps, CycleRunner, OutcomeEvaluator, PerformanceTracker, Scheduler, WeekdayCalendar,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting Drummond Geometry analysis agent");

    // 2. Load and validate configuration
    let config = Arc::new(DrummondConfig::from_env()?);
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Symbols: {}", config.symbols.join(", "));
    tracing::info!(
        "  Timeframes: trading {} / HTF {} / LTF {}",
        config.intervals.trading,
        config.intervals.htf,
        config.intervals.ltf
    );
    tracing::info!("  Cron: {} ({})", config.scheduler.cron, config.scheduler.timezone);
    tracing::info!(
        "  Confidence floors: notify {:.2}, act {:.2}",
        config.signal.min_confidence_notify,
        config.signal.min_confidence_act
    );
    tracing::info!(
        "  Cache: {} entries, {}s TTL",
        config.cache.max_size,
        config.cache.ttl_s
    );
    if config.symbols.is_empty() {
        tracing::warn!("DRUMMOND_SYMBOLS is empty; cycles will process nothing");
    }

    // 3. Core state: bar store + calculation cache
    let store = Arc::new(BarStore::new());
    let cache = Arc::new(CalcCache::new(&config.cache));

    // 4. Persistence (SQLite)
    let database_url = std::env::var("DRUMMOND_DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://drummond.db?mode=rwc".to_string());
    let persistence = Arc::new(SqliteStore::connect(&database_url).await?);
    tracing::info!("Persistence ready ({database_url})");

    // 5. Market data: CSV replay source
    let data_dir =
        std::env::var("DRUMMOND_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let market_data = Arc::new(CsvBarSource::new(&data_dir));
    tracing::info!("Market data source: {data_dir}");

    // 6. Notification router
    let mut router = NotificationRouter::new().with_sink(Box::new(ConsoleSink), None);
    if let Ok(url) = std::env::var("DRUMMOND_CHAT_WEBHOOK_URL") {
        if !url.is_empty() {
            router = router.with_sink(
                Box::new(ChatSink::new(url, config.signal.min_confidence_notify)),
                Some(RateLimit::chat_default()),
            );
            tracing::info!("Chat sink enabled");
        }
    }
    if let Ok(url) = std::env::var("DRUMMOND_WEBHOOK_URL") {
        if !url.is_empty() {
            router = router.with_sink(
                Box::new(WebhookSink::new(url, config.signal.min_confidence_notify)),
                None,
            );
            tracing::info!("Webhook sink enabled");
        }
    }
    let router = Arc::new(router);
    tracing::info!("Notification router ready ({} sinks)", router.sink_count());

    // 7. Cycle runner + scheduler
    let runner = Arc::new(CycleRunner::new(
        Arc::clone(&config),
        Arc::clone(&cache),
        CycleDeps {
            store: Arc::clone(&store),
            market_data,
            persistence: Arc::clone(&persistence) as Arc<dyn drummond_core::PersistencePort>,
            calendar: Arc::new(WeekdayCalendar::us_equities()),
            router,
        },
    ));
    let tracker = PerformanceTracker::new(
        Arc::clone(&persistence) as Arc<dyn drummond_core::PersistencePort>,
        config.scheduler.clone(),
    );
    let evaluator = OutcomeEvaluator::new(
        Arc::clone(&persistence) as Arc<dyn drummond_core::PersistencePort>,
        config.scheduler.evaluation_window_bars,
    );
    let agent_scheduler = Scheduler::new(Arc::clone(&config), runner, tracker, evaluator)?;

    // 8. Graceful shutdown on SIGINT/SIGTERM; the in-flight cycle finishes.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        }
        let _ = shutdown_tx.send(true);
    });

    agent_scheduler.run(shutdown_rx).await;
    tracing::info!("Agent stopped");
    Ok(())
}
