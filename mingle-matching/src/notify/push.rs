use async_trait::async_trait;

use mingle_shared::clients::push::PushClient;

/// Outbound push delivery. Fire-and-forget: failures are logged and reported
/// as `false`, never raised.
#[async_trait]
pub trait PushDispatch: Send + Sync + 'static {
    async fn send(&self, target_session: &str, title: &str, body: &str, data: serde_json::Value) -> bool;
}

pub struct GatewayPush {
    client: PushClient,
}

impl GatewayPush {
    pub fn new(client: PushClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PushDispatch for GatewayPush {
    async fn send(&self, target_session: &str, title: &str, body: &str, data: serde_json::Value) -> bool {
        match self.client.send(target_session, title, body, &data).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(target_session = %target_session, error = %e, "push dispatch failed");
                false
            }
        }
    }
}

/// Used when no gateway is configured.
pub struct NoopPush;

#[async_trait]
impl PushDispatch for NoopPush {
    async fn send(&self, target_session: &str, title: &str, _body: &str, _data: serde_json::Value) -> bool {
        tracing::debug!(target_session = %target_session, title = %title, "push disabled, dropping notification");
        true
    }
}
