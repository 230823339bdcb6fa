use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use mingle_matching::config::{AppConfig, StoreBackend};
use mingle_matching::events::{publisher, EventBus};
use mingle_matching::models::{Profile, Record};
use mingle_matching::notify::{GatewayPush, NoopPush, PushDispatch, SystemClock};
use mingle_matching::presence::LocalSession;
use mingle_matching::profiles::StoreProfileDirectory;
use mingle_matching::routes::{health, session, sse};
use mingle_matching::session::{MatchingSession, SessionDeps};
use mingle_matching::store::{InMemoryStore, PgStore, RemoteStore};
use mingle_matching::AppState;
use mingle_shared::clients::db::create_pool;
use mingle_shared::clients::push::PushClient;
use mingle_shared::clients::rabbitmq::RabbitMQClient;
use mingle_shared::middleware::{init_metrics, init_tracing, metrics_middleware};

/// Local development store with the configured profile already joined.
async fn seeded_memory_store(config: &AppConfig) -> anyhow::Result<Arc<dyn RemoteStore>> {
    let store = InMemoryStore::new();
    store
        .create(Record::Profile(Profile {
            id: Uuid::now_v7(),
            event_id: config.event_id.clone(),
            session_id: config.session_id.clone(),
            first_name: config.display_name.clone(),
            age: 18,
            gender_identity: String::new(),
            interested_in: String::new(),
            is_visible: true,
        }))
        .await?;
    tracing::info!(session_id = %config.session_id, "memory store seeded with local profile");
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("mingle-matching");

    let config = AppConfig::load()?;
    let port = config.port;
    let metrics_handle = init_metrics()?;

    // Store
    let store: Arc<dyn RemoteStore> = match config.store_backend {
        StoreBackend::Memory => seeded_memory_store(&config).await?,
        StoreBackend::Postgres => {
            let pool = create_pool(&config.database_url)?;
            Arc::new(PgStore::new(pool, config.poll_interval()))
        }
    };

    // Push
    let push: Arc<dyn PushDispatch> = if config.push_enabled {
        let client = PushClient::new(&config.push_gateway_url, config.push_access_token.as_deref())?;
        Arc::new(GatewayPush::new(client))
    } else {
        Arc::new(NoopPush)
    };

    // Outward events
    let bus = EventBus::new();
    let rabbitmq = if config.publish_events {
        let client = RabbitMQClient::connect(&config.rabbitmq_url).await?;
        publisher::spawn_forwarder(&bus, client.clone(), config.session_id.clone());
        Some(client)
    } else {
        None
    };

    let retry = config.retry_policy();
    let matching = MatchingSession::new(
        config.event_id.clone(),
        config.session_id.clone(),
        SessionDeps {
            store: store.clone(),
            profiles: Arc::new(StoreProfileDirectory::new(store.clone(), retry.clone())),
            push,
            presence: Arc::new(LocalSession::new()),
            bus: bus.clone(),
            clock: Arc::new(SystemClock),
            cooldown: config.cooldown(),
            retry,
            recheck_interval: config.recheck_interval(),
        },
    );
    matching.start().await?;

    let state = Arc::new(AppState {
        config,
        session: matching.clone(),
        bus,
        store,
        rabbitmq,
        metrics_handle,
    });

    let app = Router::new()
        // Health
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::metrics))
        // Session
        .route("/session", get(session::get_session).post(session::start_session))
        .route("/likes", post(session::create_like).get(session::get_liked))
        .route("/peers", get(session::get_peers))
        .route("/alerts/:pair_id/dismiss", post(session::dismiss_alert))
        .route("/presence", put(session::set_presence))
        .route("/listeners/:topic/retry", post(session::retry_listener))
        .route("/recheck", post(session::recheck))
        .route("/logout", post(session::logout))
        // Events
        .route("/events", get(sse::sse_events))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "mingle-matching starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    matching.logout();
    tracing::info!("mingle-matching stopped");
    Ok(())
}
