use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("chat api request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chat api responded with status {0}")]
    Status(StatusCode),
}

/// A single delivery attempt to the chat service. Retries live in the notifier.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(&self, text: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct TelegramClient {
    client: Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramClient {
    pub fn new(config: &Config) -> Result<Self, DeliveryError> {
        Self::with_endpoint(
            format!(
                "{}/bot{}/sendMessage",
                config.telegram_api_base, config.telegram_bot_token
            ),
            config.telegram_chat_id.clone(),
        )
    }

    pub fn with_endpoint(endpoint: String, chat_id: String) -> Result<Self, DeliveryError> {
        let user_agent = format!("hookrelay/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(user_agent)
            .build()?;
        Ok(Self {
            client,
            endpoint,
            chat_id,
        })
    }
}

#[async_trait]
impl ChatApi for TelegramClient {
    async fn send_message(&self, text: &str) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[("chat_id", self.chat_id.as_str()), ("text", text)])
            .send()
            .await
            // the endpoint carries the bot token; keep it out of logs
            .map_err(|e| DeliveryError::Transport(e.without_url()))?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(DeliveryError::Status(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode as AxumStatus, routing::post, Form, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Captured = Arc<Mutex<Vec<HashMap<String, String>>>>;

    async fn spawn_chat_server(status: AxumStatus) -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/bottoken/sendMessage",
                post(
                    move |State(captured): State<Captured>,
                          Form(form): Form<HashMap<String, String>>| async move {
                        captured.lock().unwrap().push(form);
                        status
                    },
                ),
            )
            .with_state(captured.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/bottoken/sendMessage", addr), captured)
    }

    #[tokio::test]
    async fn posts_chat_id_and_text_as_form() {
        let (endpoint, captured) = spawn_chat_server(AxumStatus::OK).await;
        let client = TelegramClient::with_endpoint(endpoint, "-100123".to_string()).unwrap();

        client.send_message("📢 billing: ok & done").await.unwrap();

        let forms = captured.lock().unwrap();
        assert_eq!(forms.len(), 1);
        assert_eq!(forms[0]["chat_id"], "-100123");
        assert_eq!(forms[0]["text"], "📢 billing: ok & done");
    }

    #[tokio::test]
    async fn non_200_status_is_a_delivery_error() {
        let (endpoint, _captured) = spawn_chat_server(AxumStatus::TOO_MANY_REQUESTS).await;
        let client = TelegramClient::with_endpoint(endpoint, "1".to_string()).unwrap();

        let err = client.send_message("hi").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Status(s) if s == StatusCode::TOO_MANY_REQUESTS));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client =
            TelegramClient::with_endpoint(format!("http://{}/x", addr), "1".to_string()).unwrap();

        let err = client.send_message("hi").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transport(_)));
    }
}
