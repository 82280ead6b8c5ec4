//! Headless chat widget: conversation state, suggestions and greeting bubble.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{ChatBackend, WidgetSettings},
    error::WidgetError,
    greeting::{GreetingInputs, GreetingScheduler},
    realtime::{ChannelSlot, RealtimeChannel},
    suggestions::{suggestions_from_reply, BotReply, SuggestionChip},
    types::{ChatMessage, Sender, WidgetSnapshot},
};

pub const FALLBACK_REPLY: &str = "Sorry, something went wrong. Please try again later.";
pub const EMPTY_REPLY: &str = "Sorry, I didn't quite get that. Could you rephrase?";

/// A user message accepted by [`ChatWidget::begin_send`], waiting for the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub session_id: String,
    pub text: String,
}

pub struct ChatWidget {
    id: String,
    session_id: String,
    messages: Vec<ChatMessage>,
    suggestions: Vec<SuggestionChip>,
    is_open: bool,
    settings: WidgetSettings,
    greeting: GreetingScheduler,
    channel: ChannelSlot,
}

impl ChatWidget {
    /// Mounts a widget. Must be called within a tokio runtime.
    pub fn new(settings: WidgetSettings) -> Self {
        let greeting = GreetingScheduler::new();
        let channel = ChannelSlot::default();
        spawn_greeting_forwarder(&greeting, channel.clone(), settings.greeting_message.clone());

        let widget = Self {
            id: Uuid::new_v4().to_string(),
            session_id: Uuid::new_v4().to_string(),
            messages: vec![],
            suggestions: vec![],
            is_open: settings.auto_open,
            settings,
            greeting,
            channel,
        };
        widget.sync_greeting();
        widget
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn suggestions(&self) -> &[SuggestionChip] {
        &self.suggestions
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn settings(&self) -> &WidgetSettings {
        &self.settings
    }

    pub fn greeting(&self) -> &GreetingScheduler {
        &self.greeting
    }

    pub fn attach_channel(&self, channel: Arc<dyn RealtimeChannel>) {
        self.channel.attach(channel);
        self.emit_state();
        self.channel
            .emit("greeting", self.greeting_payload(self.greeting.is_visible()));
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_attached()
    }

    pub fn detach_channel(&self) {
        self.channel.detach();
    }

    /// Detaches `channel` unless a newer connection has already replaced it.
    pub fn release_channel(&self, channel: &Arc<dyn RealtimeChannel>) -> bool {
        self.channel.detach_if_current(channel)
    }

    pub fn open(&mut self) {
        self.set_open(true);
    }

    pub fn close(&mut self) {
        self.set_open(false);
    }

    pub fn toggle(&mut self) {
        self.set_open(!self.is_open);
    }

    fn set_open(&mut self, open: bool) {
        if open {
            self.greeting.interrupt();
        }
        self.is_open = open;
        self.sync_greeting();
        self.emit_state();
    }

    /// Records a user message and returns what to forward to the chatbot.
    /// Blank text is ignored.
    pub fn begin_send(&mut self, text: &str) -> Option<PendingSend> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }

        self.greeting.interrupt();
        self.push_message(ChatMessage::new(Sender::User, trimmed));
        self.set_suggestions(vec![]);

        Some(PendingSend {
            session_id: self.session_id.clone(),
            text: trimmed.to_string(),
        })
    }

    /// Applies a chatbot reply, whichever conversation it belongs to.
    pub fn apply_reply(&mut self, reply: &BotReply) {
        let suggestions = suggestions_from_reply(reply);
        let text = reply
            .fulfillment_text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty());

        match text {
            Some(text) => self.push_message(ChatMessage::new(Sender::Bot, text)),
            None if suggestions.is_empty() => self.push_message(ChatMessage::new(Sender::Bot, EMPTY_REPLY)),
            None => {}
        }
        self.set_suggestions(suggestions);
    }

    pub fn apply_failure(&mut self, err: &WidgetError) {
        warn!(widget_id = %self.id, "chatbot reply failed: {err}");
        self.push_message(ChatMessage::new(Sender::Bot, FALLBACK_REPLY));
        self.set_suggestions(vec![]);
    }

    /// Message text for a click on the suggestion at `index`.
    pub fn chip_postback(&self, index: usize) -> Result<String, WidgetError> {
        self.suggestions
            .get(index)
            .map(|chip| chip.postback.clone().unwrap_or_default())
            .ok_or(WidgetError::UnknownChip(index))
    }

    /// Starts a fresh conversation under a new session id.
    pub fn end_conversation(&mut self) {
        let previous = std::mem::replace(&mut self.session_id, Uuid::new_v4().to_string());
        info!(widget_id = %self.id, previous_session = %previous, session_id = %self.session_id, "conversation ended");

        self.messages.clear();
        self.set_suggestions(vec![]);
        self.sync_greeting();
        self.emit_state();
    }

    pub fn snapshot(&self) -> WidgetSnapshot {
        WidgetSnapshot {
            widget_id: self.id.clone(),
            session_id: self.session_id.clone(),
            is_open: self.is_open,
            greeting_visible: self.greeting.is_visible(),
            greeting_phase: self.greeting.phase(),
            greeting_message: self.settings.greeting_message.clone(),
            messages: self.messages.clone(),
            suggestions: self.suggestions.clone(),
        }
    }

    fn greeting_inputs(&self) -> GreetingInputs {
        GreetingInputs {
            is_open: self.is_open,
            message_count: self.messages.len(),
            greeting_delay: Some(self.settings.greeting_delay()),
        }
    }

    fn sync_greeting(&self) {
        self.greeting.update(self.greeting_inputs());
    }

    fn push_message(&mut self, message: ChatMessage) {
        self.channel.emit("message:new", json!(message));
        self.messages.push(message);
        self.sync_greeting();
    }

    fn set_suggestions(&mut self, suggestions: Vec<SuggestionChip>) {
        self.channel.emit("suggestions", json!(suggestions));
        self.suggestions = suggestions;
    }

    fn emit_state(&self) {
        self.channel.emit(
            "widget:state",
            json!({
                "widgetId": self.id,
                "sessionId": self.session_id,
                "isOpen": self.is_open,
            }),
        );
    }

    fn greeting_payload(&self, visible: bool) -> serde_json::Value {
        json!({ "visible": visible, "message": self.settings.greeting_message })
    }
}

/// Pushes greeting bubble changes to whichever channel is attached. Ends when
/// the scheduler is dropped.
fn spawn_greeting_forwarder(greeting: &GreetingScheduler, channel: ChannelSlot, message: String) {
    let mut state = greeting.subscribe();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let visible = state.borrow_and_update().visible;
            debug!(visible, "greeting bubble changed");
            channel.emit("greeting", json!({ "visible": visible, "message": message }));
        }
    });
}

/// Sends `text` through the widget's send pipeline.
///
/// The widget lock is released while the chatbot is being asked, so the reply
/// lands on whatever state the widget is in by then.
pub async fn deliver(
    widget: &Mutex<ChatWidget>,
    backend: &dyn ChatBackend,
    text: &str,
) -> Result<(), WidgetError> {
    let pending = widget
        .lock()
        .await
        .begin_send(text)
        .ok_or(WidgetError::EmptyMessage)?;

    let result = backend.send_message(&pending.session_id, &pending.text).await;

    let mut widget = widget.lock().await;
    match result {
        Ok(reply) => widget.apply_reply(&reply),
        Err(err) => widget.apply_failure(&err),
    }
    Ok(())
}
