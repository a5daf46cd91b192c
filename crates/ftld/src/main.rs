//! ftld: the FTL control plane daemon.
//!
//! Single binary that assembles every controller subsystem:
//! - State store (redb) and the replayed cluster view
//! - Routing table and verb dispatcher
//! - Controller, admin and timeline services
//! - Pub/sub progression, async executor and cron
//! - API server and HTTP ingress
//!
//! # Usage
//!
//! ```text
//! ftld serve --config /etc/ftl/ftl.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ftl_admin::AdminService;
use ftl_api::ApiState;
use ftl_controller::ControllerService;
use ftl_core::{Clock, ControllerConfig, StoreLocation, SystemClock};
use ftl_cron::CronService;
use ftl_dispatch::{ClientCache, Dispatcher};
use ftl_ingress::IngressService;
use ftl_pubsub::{AsyncExecutor, PubSubService};
use ftl_routing::RouteTable;
use ftl_scheduler::{Scheduler, SchedulerOptions, StoreLeaser};
use ftl_state::{ClusterState, StateStore};
use ftl_timeline::{InMemoryTimeline, TimelineClient};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Crates whose debug output drowns ours.
const QUIET: &[&str] = &["hyper=warn", "hyper_util=warn", "h2=warn"];

#[derive(Parser)]
#[command(name = "ftld", about = "FTL control plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a controller: the API, ingress and every background job.
    Serve {
        /// TOML config file. `FTL_*` environment variables override it.
        #[arg(long, env = "FTL_CONFIG")]
        config: Option<PathBuf>,

        /// Log as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_json } => {
            let config = ControllerConfig::load(config.as_deref(), std::env::vars())
                .context("loading config")?;
            init_tracing(&config.log_level, log_json)?;
            run(Arc::new(config)).await
        }
    }
}

/// The filter used when `RUST_LOG` is unset.
fn default_directives(level: &str) -> String {
    let level = level.trim();
    let level = if level.is_empty() { "info" } else { level };
    if level.contains('=') {
        return level.to_string();
    }
    std::iter::once(level)
        .chain(QUIET.iter().copied())
        .collect::<Vec<_>>()
        .join(",")
}

fn init_tracing(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directives(level))
            .with_context(|| format!("invalid log level {level:?}"))?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn open_store(location: StoreLocation) -> anyhow::Result<StateStore> {
    match location {
        StoreLocation::Memory => {
            warn!("using an in-memory state store, nothing survives a restart");
            Ok(StateStore::open_in_memory()?)
        }
        StoreLocation::File(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
            let store = StateStore::open(&path)?;
            info!(path = %path.display(), "state store opened");
            Ok(store)
        }
    }
}

async fn bind(addr: std::net::SocketAddr, what: &str) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {what} to {addr}"))
}

async fn run(config: Arc<ControllerConfig>) -> anyhow::Result<()> {
    info!(
        bind = %config.bind,
        ingress = %config.ingress_bind,
        dev_mode = config.dev_mode,
        "FTL controller starting"
    );

    // ── Initialize subsystems ──────────────────────────────────

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store = open_store(config.store_location())?;
    let state = ClusterState::open(store.clone())?;

    let sink = Arc::new(InMemoryTimeline::new());
    let (timeline, timeline_task) = TimelineClient::spawn(sink.clone(), shutdown_rx.clone());

    let routes = RouteTable::new(state.clone());
    let admin = AdminService::new(store.clone());
    let controller = ControllerService::new(
        config.clone(),
        state.clone(),
        routes.clone(),
        timeline.clone(),
        admin.clone(),
        clock.clone(),
    )?;
    info!(controller = %controller.key(), "controller initialized");

    let cache = Arc::new(ClientCache::http(config.client_cache_ttl, config.call_timeout));
    let dispatcher = Dispatcher::new(routes.clone(), cache.clone(), timeline.clone(), clock.clone());

    let pubsub = PubSubService::new(
        state.clone(),
        timeline.clone(),
        clock.clone(),
        config.event_consumption_delay,
    );
    let cron = CronService::new(state.clone(), timeline.clone(), clock.clone());
    let executor = AsyncExecutor::new(dispatcher.clone(), pubsub.clone(), timeline.clone(), clock.clone())
        .with_cron(Arc::new(cron.clone()));

    // ── Start background tasks ─────────────────────────────────

    let watchers = vec![
        routes.spawn_watcher(shutdown_rx.clone()),
        dispatcher.spawn_route_watcher(shutdown_rx.clone()),
        cache.spawn_sweeper(shutdown_rx.clone()),
        pubsub.spawn_deployment_watcher(shutdown_rx.clone()),
        cron.spawn_deployment_watcher(shutdown_rx.clone()),
    ];

    let leaser = Arc::new(StoreLeaser::new(store, controller.key().to_string(), clock.clone()));
    let scheduler = Scheduler::new(
        leaser,
        SchedulerOptions {
            dev_mode: config.dev_mode,
            ..SchedulerOptions::default()
        },
        shutdown_rx.clone(),
    );
    controller.schedule_reaper(&scheduler);
    pubsub.schedule(&scheduler);
    executor.schedule(&scheduler);
    cron.schedule(&scheduler);
    info!("background jobs scheduled");

    // ── Start servers ──────────────────────────────────────────

    let api_listener = bind(config.bind_addr()?, "API").await?;
    let ingress_listener = bind(config.ingress_addr()?, "ingress").await?;

    let mut api = tokio::spawn(ftl_api::serve(
        api_listener,
        ApiState {
            controller,
            admin,
            dispatcher: dispatcher.clone(),
            pubsub,
            timeline: sink,
            clock: clock.clone(),
        },
        shutdown_rx.clone(),
    ));
    let mut ingress = tokio::spawn(ftl_ingress::serve(
        ingress_listener,
        IngressService::new(dispatcher, timeline, clock),
        shutdown_rx,
    ));

    // ── Wait for shutdown ──────────────────────────────────────

    let mut api_done = None;
    let mut ingress_done = None;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            info!("shutdown signal received");
        }
        result = &mut api => api_done = Some(result),
        result = &mut ingress => ingress_done = Some(result),
    }
    let _ = shutdown_tx.send(true);

    let api_result = match api_done {
        Some(result) => result,
        None => api.await,
    };
    let ingress_result = match ingress_done {
        Some(result) => result,
        None => ingress.await,
    };

    scheduler.join().await;
    for watcher in watchers {
        let _ = watcher.await;
    }
    let _ = timeline_task.await;

    api_result.context("API server panicked")?.context("API server failed")?;
    ingress_result
        .context("ingress panicked")?
        .context("ingress failed")?;

    info!("FTL controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_levels_quiet_the_http_stack() {
        assert_eq!(
            default_directives("debug"),
            "debug,hyper=warn,hyper_util=warn,h2=warn"
        );
        assert_eq!(
            default_directives(""),
            "info,hyper=warn,hyper_util=warn,h2=warn"
        );
    }

    #[test]
    fn explicit_directives_are_kept() {
        assert_eq!(default_directives("ftl_pubsub=trace"), "ftl_pubsub=trace");
        assert!(EnvFilter::try_new(default_directives("warn")).is_ok());
    }

    #[test]
    fn serve_reads_its_flags() {
        let cli = Cli::try_parse_from(["ftld", "serve", "--config", "ftl.toml", "--log-json"]).unwrap();
        let Command::Serve { config, log_json } = cli.command;
        assert_eq!(config, Some(PathBuf::from("ftl.toml")));
        assert!(log_json);
    }

    #[tokio::test]
    async fn in_memory_stores_open() {
        let store = open_store(StoreLocation::Memory).unwrap();
        assert!(ClusterState::open(store).is_ok());
    }

    #[tokio::test]
    async fn file_stores_create_their_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.redb");
        let store = open_store(StoreLocation::File(path.clone())).unwrap();
        drop(store);
        assert!(path.exists());
    }
}
