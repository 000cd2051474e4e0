//! llm-gateway - main entry point.
//!
//! Wires the replicas, stores, and pipeline components, runs the proxy
//! listener, and owns the shutdown protocol: stop accepting, drain the
//! event consumers with a bounded deadline, stop each replica refresher,
//! close out with a five-second grace period.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_gateway::api::{build_router, Authenticator, Dispatcher, ProxyState};
use llm_gateway::core::logging::PrivacyMode;
use llm_gateway::core::redis_store::{
    AccessCache, RedisByteCache, RedisCounterStore,
};
use llm_gateway::core::replica::ReplicaSet;
use llm_gateway::core::{init_metrics, telemetry, AppConfig, Store};
use llm_gateway::services::event_bus::{
    EventBus, EventConsumer, RecordingHandler, EVENT_TOPIC,
};
use llm_gateway::services::response_cache::ResponseCache;
use llm_gateway::services::route_planner::RoutePlanner;
use llm_gateway::services::validator::Validator;

/// Redis database indices, one per logical store.
const REDIS_DB_RATE_LIMIT: u8 = 0;
const REDIS_DB_COST_LIMIT: u8 = 1;
const REDIS_DB_COST_LEDGER: u8 = 2;
const REDIS_DB_RESPONSE_CACHE: u8 = 3;
const REDIS_DB_ACCESS_CACHE: u8 = 4;

const EVENT_BUS_BUFFER: usize = 2048;
const EVENT_CONSUMER_WORKERS: usize = 4;
const CONSUMER_DRAIN_DEADLINE: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "llm-gateway", about = "Reverse proxy for LLM provider APIs")]
struct Cli {
    /// Run mode, controls log verbosity.
    #[arg(short = 'm', default_value = "dev", value_parser = ["dev", "prod"])]
    mode: String,

    /// Privacy mode, controls whether request/response bodies may be logged.
    #[arg(short = 'p', default_value = "strict", value_parser = ["strict", "relaxed"])]
    privacy: String,
}

fn init_tracing(mode: &str) {
    let base_filter = match mode {
        "prod" => "info",
        _ => "info,llm_gateway=debug",
    };
    // Suppress noisy HTTP library logs regardless of RUST_LOG.
    let filter_str = std::env::var("RUST_LOG")
        .map(|custom| format!("{},hyper=warn,h2=warn,reqwest=warn", custom))
        .unwrap_or_else(|_| format!("{},hyper=warn,h2=warn,reqwest=warn", base_filter));

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter_str))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn create_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .context("failed to build HTTP client")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.mode);
    init_metrics();

    let privacy: PrivacyMode = cli
        .privacy
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let config = AppConfig::from_env().context("cannot parse environment variables")?;
    telemetry::init(&config.stats_provider);

    // Relational store: fatal if unreachable.
    let store = Store::connect(&config.postgres)
        .await
        .context("cannot connect to postgresql")?;

    // Replicas: one full refresh up front so the proxy never serves from an
    // empty snapshot, then periodic refresh in the background.
    let replicas = ReplicaSet::new(
        store.clone(),
        Duration::from_secs(config.in_memory_db_update_interval_secs),
    );
    replicas
        .warm_up()
        .await
        .context("cannot warm up in-memory replicas")?;
    replicas.listen();

    // Redis-family stores, one logical DB each: fatal if any is
    // unreachable at startup.
    let read_timeout = Duration::from_secs(config.redis.read_timeout_secs.max(1));
    let write_timeout = Duration::from_secs(config.redis.write_timeout_secs.max(1));

    let rate_limit_store = Arc::new(RedisCounterStore::new(
        redis::Client::open(config.redis.connection_url(REDIS_DB_RATE_LIMIT))
            .context("invalid rate limit redis url")?,
        read_timeout,
        write_timeout,
    ));
    rate_limit_store
        .ping()
        .await
        .context("cannot connect to rate limit redis store")?;

    let cost_limit_store = Arc::new(RedisCounterStore::new(
        redis::Client::open(config.redis.connection_url(REDIS_DB_COST_LIMIT))
            .context("invalid cost limit redis url")?,
        read_timeout,
        write_timeout,
    ));
    cost_limit_store
        .ping()
        .await
        .context("cannot connect to cost limit redis store")?;

    let cost_ledger_store = Arc::new(RedisCounterStore::new(
        redis::Client::open(config.redis.connection_url(REDIS_DB_COST_LEDGER))
            .context("invalid cost ledger redis url")?,
        read_timeout,
        write_timeout,
    ));
    cost_ledger_store
        .ping()
        .await
        .context("cannot connect to cost ledger redis store")?;

    let response_cache_store = RedisByteCache::new(
        redis::Client::open(config.redis.connection_url(REDIS_DB_RESPONSE_CACHE))
            .context("invalid response cache redis url")?,
        read_timeout,
        write_timeout,
    );
    response_cache_store
        .ping()
        .await
        .context("cannot connect to response cache redis store")?;

    let access_cache_store = RedisByteCache::new(
        redis::Client::open(config.redis.connection_url(REDIS_DB_ACCESS_CACHE))
            .context("invalid access cache redis url")?,
        read_timeout,
        write_timeout,
    );
    access_cache_store
        .ping()
        .await
        .context("cannot connect to access cache redis store")?;

    // Pipeline components.
    let http_client = create_http_client()?;
    let dispatcher = Dispatcher::new(http_client);
    let planner = Arc::new(RoutePlanner::new(
        dispatcher.clone(),
        config.max_route_body_bytes,
    ));
    let validator = Arc::new(Validator::new(
        rate_limit_store.clone(),
        cost_limit_store.clone(),
        config.limit_fail_open,
    ));
    let authenticator = Arc::new(Authenticator::new(
        replicas.keys.clone(),
        replicas.settings.clone(),
        replicas.routes.clone(),
        Arc::new(AccessCache::new(
            Box::new(access_cache_store),
            Duration::from_secs(config.access_cache_ttl_secs),
        )),
    ));
    let response_cache = Arc::new(ResponseCache::new(Arc::new(response_cache_store)));

    // Event bus and the async recording consumers.
    let event_bus = Arc::new(EventBus::new(EVENT_BUS_BUFFER));
    let event_receiver = event_bus.subscribe(EVENT_TOPIC);
    let handler = Arc::new(
        RecordingHandler::new(
            cost_limit_store.clone(),
            rate_limit_store.clone(),
            Arc::new(store.clone()),
        )
        .with_ledger(cost_ledger_store.clone()),
    );
    let event_consumer = EventConsumer::new(event_receiver, handler, EVENT_CONSUMER_WORKERS);
    event_consumer.start();

    let state = Arc::new(ProxyState {
        privacy,
        authenticator,
        validator,
        planner,
        dispatcher,
        response_cache,
        event_bus,
        custom_providers: replicas.custom_providers.clone(),
        proxy_timeout: Duration::from_secs(config.proxy_timeout_secs),
    });
    let router = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind proxy listener on {}", addr))?;
    tracing::info!(mode = %cli.mode, privacy = %cli.privacy, addr = %addr, "proxy listening");

    // Shutdown protocol: the signal stops the listener; in-flight requests
    // get a bounded grace period to finish.
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let server = axum::serve(listener, router).with_graceful_shutdown({
        let mut rx = shutdown_rx.clone();
        async move {
            let _ = rx.changed().await;
        }
    });
    let serve_task = tokio::spawn(async move { server.await });

    let _ = shutdown_rx.changed().await;
    tracing::info!("shutting down server...");

    match tokio::time::timeout(SHUTDOWN_GRACE, serve_task).await {
        Ok(joined) => {
            joined
                .context("proxy server task panicked")?
                .context("proxy server error")?;
        }
        Err(_) => {
            tracing::warn!("grace period elapsed with requests still in flight");
        }
    }

    event_consumer.stop(CONSUMER_DRAIN_DEADLINE).await;
    replicas.stop().await;
    telemetry::close();

    tracing::info!("server exited");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
