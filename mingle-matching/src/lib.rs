pub mod config;
pub mod events;
pub mod matching;
pub mod models;
pub mod notify;
pub mod presence;
pub mod profiles;
pub mod reconciler;
pub mod registry;
pub mod retry;
pub mod routes;
pub mod schema;
pub mod session;
pub mod store;

use std::sync::Arc;

use mingle_shared::clients::rabbitmq::RabbitMQClient;

pub struct AppState {
    pub config: config::AppConfig,
    pub session: Arc<session::MatchingSession>,
    pub bus: events::EventBus,
    pub store: Arc<dyn store::RemoteStore>,
    pub rabbitmq: Option<RabbitMQClient>,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}
