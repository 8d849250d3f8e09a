use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::info;

mod admission;
mod api;
mod backpressure;
mod bucket;
mod clock;
mod config;
mod error;
mod fairness;
mod headers;
mod upstream;

pub use config::Config;
pub use error::AppError;

use admission::CoreContext;
use backpressure::Backpressure;
use clock::{Clock, SystemClock};
use fairness::Registry;
use upstream::UpstreamClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fairgate=info,tower_http=warn".into()),
        )
        .init();

    let config = Config::load().context("failed to load configuration")?;
    info!(
        upstream = %config.upstream_base_url,
        limit_per_minute = config.limit_per_minute,
        bind_addr = %config.bind_addr,
        "fairgate starting"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let now = clock.now();

    let registry = Arc::new(Registry::new(
        config.limit_per_minute,
        config.global_cap,
        config.burst_window_secs,
        config.active_window_secs,
        config.idle_evict_threshold_secs,
        now,
    ));
    let backpressure = Arc::new(Backpressure::new());
    let upstream = Arc::new(UpstreamClient::new(
        config.upstream_base_url.clone(),
        config.outbound_max_connections,
        config.outbound_max_keepalive,
    )?);
    let config = Arc::new(config);

    let ctx = Arc::new(CoreContext::new(
        clock,
        Arc::clone(&registry),
        backpressure,
        upstream,
        Arc::clone(&config),
    ));

    // Periodic rebalance keeps idle connections quenched/evicted even
    // between requests, not just when a new request happens to touch the
    // registry.
    tokio::spawn(rebalance_loop(Arc::clone(&ctx)));

    let bind_addr: SocketAddr = config.bind_addr.parse().context("invalid BIND_ADDR")?;
    info!(%bind_addr, "listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let status_and_health = axum::Router::new()
        .route("/__status", axum::routing::get(api::status::status))
        .with_state(Arc::clone(&ctx));

    let app = api::proxy::router(Arc::clone(&ctx))
        .merge(status_and_health)
        .route("/healthz", axum::routing::get(api::health::healthz))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer)
        .layer(tower_http::catch_panic::CatchPanicLayer::custom(error::handle_panic));

    tokio::select! {
        result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

/// Rebalances the fairness registry every second, independent of request
/// traffic, so idle connections get quenched/evicted promptly.
async fn rebalance_loop(ctx: Arc<CoreContext>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        interval.tick().await;
        ctx.registry.rebalance(ctx.clock.now());
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// `fairgate --healthcheck`: hit `/healthz` and exit 0/1. Invoked from a
/// Docker HEALTHCHECK without needing curl/wget in the image.
async fn healthcheck() -> anyhow::Result<()> {
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let port = bind_addr.rsplit(':').next().unwrap_or("8080");
    let url = format!("http://127.0.0.1:{port}/healthz");
    let response = reqwest::get(&url).await?;

    if response.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}
