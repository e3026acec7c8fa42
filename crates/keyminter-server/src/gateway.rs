use std::time::Duration;

use async_trait::async_trait;
use keyminter_contracts::{
    DeleteWebhookRequest, GetUpdatesRequest, GetUpdatesResponse, OutboundMessage,
    SendMessageRequest, SetWebhookRequest,
};
use reqwest::{Client, Response};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("telegram transport error: {0}")]
    Transport(String),
    #[error("telegram returned HTTP {0}")]
    Status(u16),
    #[error("telegram response could not be decoded: {0}")]
    Decode(String),
}

/// Outbound path for chat replies.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    async fn send(&self, msg: &OutboundMessage) -> Result<(), GatewayError>;
}

/// Telegram Bot API client (`{api_base}/bot{token}/{method}`).
pub struct TelegramGateway {
    client: Client,
    api_base: String,
    bot_token: String,
    timeout: Duration,
}

impl TelegramGateway {
    pub fn new(api_base: &str, bot_token: &str, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
            timeout,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        method: &str,
        body: &T,
        timeout: Duration,
    ) -> Result<Response, GatewayError> {
        let response = self
            .client
            .post(self.method_url(method))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            // the request URL carries the bot token
            .map_err(|e| GatewayError::Transport(e.without_url().to_string()))?;
        if !response.status().is_success() {
            return Err(GatewayError::Status(response.status().as_u16()));
        }
        Ok(response)
    }

    async fn call<T: Serialize + ?Sized>(&self, method: &str, body: &T) -> Result<(), GatewayError> {
        self.post(method, body, self.timeout).await.map(|_| ())
    }

    /// Long-polls for message updates. Telegram holds the request open for up
    /// to `wait_s` seconds, so the request deadline is stretched by that much.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        wait_s: u64,
    ) -> Result<Vec<Value>, GatewayError> {
        let request = GetUpdatesRequest {
            offset,
            timeout: wait_s,
            allowed_updates: vec!["message".to_string()],
        };
        let response = self
            .post(
                "getUpdates",
                &request,
                self.timeout + Duration::from_secs(wait_s),
            )
            .await?;
        let body: GetUpdatesResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.without_url().to_string()))?;
        Ok(body.result)
    }

    /// Points Telegram at `{public_url}/webhook`, dropping updates queued
    /// while no webhook was registered.
    pub async fn set_webhook(
        &self,
        public_url: &str,
        secret_token: Option<&str>,
    ) -> Result<(), GatewayError> {
        let request = SetWebhookRequest {
            url: format!("{}/webhook", public_url.trim_end_matches('/')),
            secret_token: secret_token.map(|v| v.to_string()),
            drop_pending_updates: true,
        };
        self.call("setWebhook", &request).await
    }

    pub async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<(), GatewayError> {
        self.call(
            "deleteWebhook",
            &DeleteWebhookRequest {
                drop_pending_updates,
            },
        )
        .await
    }
}

#[async_trait]
impl MessageGateway for TelegramGateway {
    async fn send(&self, msg: &OutboundMessage) -> Result<(), GatewayError> {
        self.call("sendMessage", &SendMessageRequest::from(msg)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_url_includes_token_and_method() {
        let gw = TelegramGateway::new(
            "https://api.telegram.org/",
            "123:abc",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            gw.method_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[tokio::test]
    async fn unreachable_api_is_transport_error_without_token() {
        let gw = TelegramGateway::new("http://127.0.0.1:1", "123:secret", Duration::from_secs(2))
            .unwrap();
        let err = gw
            .send(&OutboundMessage {
                chat_id: 1,
                text: "hi".to_string(),
            })
            .await
            .expect_err("nothing listens on port 1");
        assert!(matches!(err, GatewayError::Transport(_)));
        assert!(!err.to_string().contains("123:secret"));
    }
}
