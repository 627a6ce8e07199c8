//! tokenwatch — periodic token discovery and evaluation engine.
//!
//! Wires the rate limiter, source clients, pipeline, aggregator, health
//! monitor and pub/sub hub together and serves a minimal WebSocket
//! endpoint. No REST surface beyond `/healthz` is in scope.

use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokenwatch_backend::aggregator::{Aggregator, AggregatorConfig};
use tokenwatch_backend::config::AppConfig;
use tokenwatch_backend::health::HealthMonitor;
use tokenwatch_backend::hub::{ClientMessage, Hub};
use tokenwatch_backend::persistence::SqlitePersistence;
use tokenwatch_backend::pipeline::Pipeline;
use tokenwatch_backend::ratelimit::RateLimiter;
use tokenwatch_backend::sources::{
    chain::ChainApiClient, market::MarketApiClient, router::RouterApiClient,
    security::SecurityApiClient,
};

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load();
    info!("tokenwatch starting up");

    let rate_limiter = RateLimiter::new(config.default_rate_limit());

    let market = Arc::new(MarketApiClient::new(
        config.market_api_url.clone(),
        rate_limiter.clone(),
    ));
    let security = Arc::new(SecurityApiClient::new(
        config.security_api_url.clone(),
        rate_limiter.clone(),
    ));
    let router = Arc::new(RouterApiClient::new(
        config.router_api_url.clone(),
        rate_limiter.clone(),
    ));
    let chain = Arc::new(ChainApiClient::new(
        config.chain_api_url.clone(),
        rate_limiter.clone(),
    ));

    let persistence = Arc::new(
        SqlitePersistence::open(&config.database_path)
            .context("failed to open persistence database")?,
    );
    info!(path = %config.database_path, "persistence database ready");

    let pipeline = Arc::new(Pipeline::new(
        market.clone(),
        security.clone(),
        router.clone(),
        chain.clone(),
        config.cache_results,
        config.timeout(),
        config.batch_size,
        config.max_concurrent,
    ));

    let health = HealthMonitor::new(
        market.clone(),
        security.clone(),
        router.clone(),
        chain.clone(),
        rate_limiter.clone(),
        config.health_interval(),
        config.health_cache_ttl(),
    );
    health.start();

    let hub = Hub::new(
        config.hub_client_buffer,
        config.heartbeat_interval(),
        config.connection_timeout(),
    );
    let hub_weak: Weak<Hub> = Arc::downgrade(&hub);
    let hub = hub.with_ping_hook(Arc::new(move |client_id: &str| {
        if let Some(hub) = hub_weak.upgrade() {
            hub.send_ping(client_id);
        }
    }));
    hub.start();

    let aggregator = Aggregator::new(
        market,
        pipeline,
        persistence,
        hub.clone(),
        health,
        AggregatorConfig {
            tick_interval: config.tick_interval(),
            max_tokens_per_run: config.max_tokens_per_run,
            criteria: config.default_filter_criteria(),
        },
    );
    aggregator.start();
    info!(interval_secs = config.tick_interval_secs, "aggregator started");

    let state = AppState { hub };

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<Hub>) {
    let (client_id, mut outbound) = hub.on_connect();

    loop {
        tokio::select! {
            Some(message) = outbound.recv() => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize server message");
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        hub.touch(&client_id);
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Subscribe { channels, .. }) => {
                                hub.subscribe(&client_id, channels);
                            }
                            Ok(ClientMessage::Unsubscribe { channels }) => {
                                hub.unsubscribe(&client_id, channels);
                            }
                            Ok(ClientMessage::Ping) => {
                                hub.ping(&client_id);
                            }
                            Err(e) => {
                                warn!(error = %e, "unparseable client message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(&client_id);
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenwatch_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
