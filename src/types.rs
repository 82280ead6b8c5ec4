use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{greeting::GreetingPhase, suggestions::SuggestionChip};

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Field decoder for upstream payloads: `null` or a value of the wrong shape
/// decodes to `T::default()` instead of failing the whole document.
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

/// Like [`lenient`] for lists, additionally skipping elements that do not decode.
pub(crate) fn lenient_seq<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| T::deserialize(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender: Sender,
    pub text: String,
    pub created_at: String,
}

impl ChatMessage {
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
            text: text.into(),
            created_at: now_iso(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSnapshot {
    pub widget_id: String,
    pub session_id: String,
    pub is_open: bool,
    pub greeting_visible: bool,
    pub greeting_phase: GreetingPhase,
    pub greeting_message: String,
    pub messages: Vec<ChatMessage>,
    pub suggestions: Vec<SuggestionChip>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ChipClickBody {
    pub index: usize,
}
