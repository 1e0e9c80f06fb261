use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use playtally::{
    cache::SessionCache,
    config::Config,
    database::Database,
    intervalizer::Intervalizer,
    models::ServerKind,
    poller::Poller,
    push::PushStreamClient,
    scheduler::Scheduler,
    sources::SourceManager,
    stats::StatsService,
    sync::SyncService,
    utils::time::now_ts,
    web::{AppState, WebServer},
};

#[derive(Parser)]
#[command(name = "playtally")]
#[command(version)]
#[command(about = "Self-hosted playback analytics for Emby, Plex and Jellyfin")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| cli.log_level.clone());
    let log_filter = if log_level == "trace" {
        format!("playtally={log_level},tower_http=trace")
    } else {
        format!("playtally={log_level}")
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting playtally v{}", env!("CARGO_PKG_VERSION"));

    std::env::set_var("CONFIG_FILE", &cli.config);
    let mut config = Config::load()?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }

    config.validate()?;
    config.ensure_admin_token()?;

    info!("Using database: {}", config.database.url);
    let db = Database::new(&config.database).await?;
    db.migrate().await?;
    info!("Database connection established and migrations applied");

    // Sessions left active by a previous run are closed at their last
    // persisted interval end before any new observations arrive.
    db.sweep_orphaned_sessions(now_ts()).await?;

    let manager = Arc::new(SourceManager::from_config(&config.servers)?);
    if manager.is_empty() {
        warn!("no media servers configured; only historical stats will be served");
    } else {
        info!(servers = manager.clients().len(), "media server adapters ready");
    }

    let cache = SessionCache::new(Duration::from_secs(
        config.poll.effective_cache_ttl_seconds(),
    ));
    let intervalizer = Intervalizer::new(db.clone(), config.intervalizer.clone());
    let stats = StatsService::new(
        db.clone(),
        intervalizer.clone(),
        manager.clone(),
        config.stats.clone(),
    );
    let sync = SyncService::new(
        db.clone(),
        manager.clone(),
        config.sync.clone(),
        config.stats.clone(),
    );

    // One synchronous pass before the loops start, so the first snapshots
    // already have user names and item metadata.
    sync.initial_sync().await;

    let poller = Poller::new(
        manager.clone(),
        cache.clone(),
        intervalizer.clone(),
        db.clone(),
        config.stats.clone(),
        Duration::from_secs(config.poll.effective_poll_seconds()),
    );

    let mut scheduler = Scheduler::new();
    scheduler.cancel_on_ctrl_c();

    scheduler.spawn("poller", poller.clone().run(scheduler.token()));
    for server in config.enabled_servers() {
        if server.kind == ServerKind::Emby {
            let push = Arc::new(PushStreamClient::new(
                server,
                config.poll.keepalive_seconds,
                intervalizer.clone(),
                cache.clone(),
            ));
            scheduler.spawn("push-stream", push.run(scheduler.token()));
        }
    }
    scheduler.spawn("sweeper", intervalizer.clone().run_sweeper(scheduler.token()));
    scheduler.spawn("sync", sync.clone().run(scheduler.token()));

    let state = AppState {
        config: config.clone(),
        db,
        cache,
        manager,
        intervalizer,
        poller,
        stats,
    };
    let server = WebServer::new(state)?;
    info!("Starting web server on {}:{}", server.host(), server.port());

    let serve_result = server.serve(scheduler.token()).await;
    scheduler.shutdown(Duration::from_secs(5)).await;
    serve_result
}
