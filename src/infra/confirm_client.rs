//! 重启确认客户端
//!
//! 被部署的服务重启完成后调用，向部署服务 POST /message 上报自己已就绪

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

const CONFIRM_ATTEMPTS: u32 = 3;
const CONFIRM_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RestartMessage<'a> {
    message_type: &'a str,
    entity_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessageReply {
    accepted: bool,
}

/// 确认通道客户端
#[derive(Clone)]
pub struct ConfirmationClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl ConfirmationClient {
    /// `base_url` 为部署服务地址，如 `http://deploy.internal:9876`
    pub fn new(base_url: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/message", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    /// 上报重启完成，返回部署服务是否把它算作一次待确认的重启
    ///
    /// 连接失败和 5xx 会重试；4xx（如 API Key 错误）直接返回错误。
    pub async fn confirm_restart(&self, entity_name: &str) -> anyhow::Result<bool> {
        let body = RestartMessage {
            message_type: "restart",
            entity_name,
        };
        let mut last_error = None;

        for attempt in 1..=CONFIRM_ATTEMPTS {
            let mut request = self.client.post(&self.endpoint).json(&body);
            if let Some(ref key) = self.api_key {
                request = request.header("x-api-key", key);
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let reply: MessageReply = resp.json().await?;
                    info!(entity = %entity_name, accepted = reply.accepted, "Restart confirmation sent");
                    return Ok(reply.accepted);
                }
                Ok(resp) if resp.status().is_client_error() => {
                    anyhow::bail!("deployment server rejected confirmation: {}", resp.status());
                }
                Ok(resp) => {
                    warn!(entity = %entity_name, status = %resp.status(), attempt = attempt, "Confirmation failed");
                    last_error = Some(anyhow::anyhow!("deployment server returned {}", resp.status()));
                }
                Err(e) => {
                    warn!(entity = %entity_name, error = %e, attempt = attempt, "Confirmation failed, will retry");
                    last_error = Some(e.into());
                }
            }

            if attempt < CONFIRM_ATTEMPTS {
                tokio::time::sleep(CONFIRM_RETRY_DELAY).await;
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("confirmation failed with {}", StatusCode::SERVICE_UNAVAILABLE)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    async fn record(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        let key = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let accepted = body["entityName"] == "api";
        seen.lock().unwrap().push((key, body));
        Json(serde_json::json!({"accepted": accepted, "message": "ok"}))
    }

    async fn serve(seen: Seen) -> String {
        let app = Router::new().route("/message", post(record)).with_state(seen);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_confirm_restart_posts_message() {
        let seen: Seen = Arc::default();
        let base = serve(seen.clone()).await;
        let client = ConfirmationClient::new(&base, Some("secret".to_string())).unwrap();

        assert!(client.confirm_restart("api").await.unwrap());
        assert!(!client.confirm_restart("worker").await.unwrap());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0.as_deref(), Some("secret"));
        assert_eq!(
            seen[0].1,
            serde_json::json!({"messageType": "restart", "entityName": "api"})
        );
    }

    #[tokio::test]
    async fn test_wrong_key_is_not_retried() {
        let state = Arc::new(crate::testing::app_state(Some("secret")));
        let app = crate::api::router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client =
            ConfirmationClient::new(&format!("http://{}", addr), Some("wrong".to_string())).unwrap();
        let started = std::time::Instant::now();
        let err = client.confirm_restart("worker").await.unwrap_err();

        assert!(err.to_string().contains("401"));
        assert!(started.elapsed() < CONFIRM_RETRY_DELAY);
    }
}
