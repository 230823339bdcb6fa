use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

/// HTTP client for the push-notification gateway.
///
/// The gateway resolves a session id to the device token registered for it, so
/// callers only ever address sessions.
#[derive(Clone)]
pub struct PushClient {
    client: Client,
    endpoint: String,
    access_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PushMessage<'a> {
    pub to: &'a str,
    pub title: &'a str,
    pub body: &'a str,
    pub data: &'a serde_json::Value,
    pub sound: &'static str,
    pub priority: &'static str,
}

impl PushClient {
    pub fn new(endpoint: &str, access_token: Option<&str>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            access_token: access_token.map(str::to_string),
        })
    }

    pub async fn send(
        &self,
        to: &str,
        title: &str,
        body: &str,
        data: &serde_json::Value,
    ) -> Result<(), String> {
        let message = PushMessage {
            to,
            title,
            body,
            data,
            sound: "default",
            priority: "high",
        };

        let mut request = self.client.post(&self.endpoint).json(&message);
        if let Some(token) = &self.access_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("push send failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("push gateway error ({status}): {body}"));
        }

        tracing::debug!(to = %to, title = %title, "push notification sent");
        Ok(())
    }
}
