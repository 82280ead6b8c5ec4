//! The forum chatbot API the widget talks to.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    config::Config, error::WidgetError, greeting::DEFAULT_GREETING_DELAY, suggestions::BotReply, types::lenient,
};

pub const DEFAULT_GREETING_MESSAGE: &str = "Hi there! Need help with the forum?";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawSettings")]
pub struct WidgetSettings {
    /// Milliseconds between greeting bubble transitions.
    pub greeting_delay: u64,
    pub auto_open: bool,
    pub greeting_message: String,
}

impl Default for WidgetSettings {
    fn default() -> Self {
        Self {
            greeting_delay: DEFAULT_GREETING_DELAY.as_millis() as u64,
            auto_open: false,
            greeting_message: DEFAULT_GREETING_MESSAGE.to_string(),
        }
    }
}

/// Settings as sent by the chatbot API. Each field falls back to its default
/// on its own when missing, `null` or mistyped.
#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawSettings {
    #[serde(deserialize_with = "lenient")]
    greeting_delay: Option<u64>,
    #[serde(deserialize_with = "lenient")]
    auto_open: Option<bool>,
    #[serde(deserialize_with = "lenient")]
    greeting_message: Option<String>,
}

impl From<RawSettings> for WidgetSettings {
    fn from(raw: RawSettings) -> Self {
        let defaults = Self::default();
        Self {
            greeting_delay: raw.greeting_delay.unwrap_or(defaults.greeting_delay),
            auto_open: raw.auto_open.unwrap_or(defaults.auto_open),
            greeting_message: raw.greeting_message.unwrap_or(defaults.greeting_message),
        }
    }
}

impl WidgetSettings {
    pub fn greeting_delay(&self) -> Duration {
        Duration::from_millis(self.greeting_delay)
    }
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn send_message(&self, session_id: &str, text: &str) -> Result<BotReply, WidgetError>;

    async fn widget_settings(&self) -> Result<WidgetSettings, WidgetError>;
}

/// Fetches widget settings, falling back to defaults when the call fails.
pub async fn load_settings(backend: &dyn ChatBackend) -> WidgetSettings {
    match backend.widget_settings().await {
        Ok(settings) => settings,
        Err(err) => {
            warn!("widget settings unavailable, using defaults: {err}");
            WidgetSettings::default()
        }
    }
}

pub struct HttpChatBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChatBackend {
    pub fn new(config: &Config) -> Result<Self, WidgetError> {
        let client = reqwest::Client::builder()
            .timeout(config.chatbot_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.chatbot_api_url.clone(),
        })
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, WidgetError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(WidgetError::Status { status, body })
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn send_message(&self, session_id: &str, text: &str) -> Result<BotReply, WidgetError> {
        debug!(session_id, "forwarding message to chatbot");
        let response = self
            .client
            .post(format!("{}/api/chatbot/message", self.base_url))
            .json(&json!({ "message": text, "sessionId": session_id }))
            .send()
            .await?;

        Ok(Self::checked(response).await?.json::<BotReply>().await?)
    }

    async fn widget_settings(&self) -> Result<WidgetSettings, WidgetError> {
        let response = self
            .client
            .get(format!("{}/api/chatbot/settings", self.base_url))
            .send()
            .await?;

        Ok(Self::checked(response).await?.json::<WidgetSettings>().await?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use tokio::sync::Notify;

    use super::*;

    /// Backend returning queued replies. An empty queue answers with a
    /// `502` status error.
    #[derive(Default)]
    pub struct FakeBackend {
        pub replies: Mutex<VecDeque<BotReply>>,
        pub sent: Mutex<Vec<(String, String)>>,
        pub settings: Option<WidgetSettings>,
        /// When set, `send_message` waits for a notification before answering.
        pub gate: Option<Arc<Notify>>,
    }

    impl FakeBackend {
        pub fn with_replies(replies: impl IntoIterator<Item = BotReply>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().collect()),
                ..Self::default()
            }
        }

        pub fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().expect("sent lock").clone()
        }
    }

    #[async_trait]
    impl ChatBackend for FakeBackend {
        async fn send_message(&self, session_id: &str, text: &str) -> Result<BotReply, WidgetError> {
            self.sent
                .lock()
                .expect("sent lock")
                .push((session_id.to_string(), text.to_string()));
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let reply = self.replies.lock().expect("replies lock").pop_front();
            reply.ok_or_else(|| WidgetError::Status {
                status: reqwest::StatusCode::BAD_GATEWAY,
                body: "no reply queued".to_string(),
            })
        }

        async fn widget_settings(&self) -> Result<WidgetSettings, WidgetError> {
            self.settings.clone().ok_or_else(|| WidgetError::Status {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                body: "settings offline".to_string(),
            })
        }
    }
}
