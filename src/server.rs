use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::{JoinHandle, JoinSet},
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
    backend::{load_settings, ChatBackend},
    error::WidgetError,
    realtime::{RealtimeChannel, SocketChannel},
    types::{now_iso, ChipClickBody, SendMessageBody, WidgetSnapshot},
    widget::{deliver, ChatWidget},
};

struct MountedWidget {
    widget: Arc<Mutex<ChatWidget>>,
    last_seen: StdMutex<Instant>,
}

impl MountedWidget {
    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap_or_else(PoisonError::into_inner).elapsed()
    }
}

pub struct AppState {
    pub backend: Arc<dyn ChatBackend>,
    widgets: RwLock<HashMap<String, MountedWidget>>,
}

impl AppState {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            widgets: RwLock::new(HashMap::new()),
        })
    }

    async fn mount(&self, widget: ChatWidget) -> WidgetSnapshot {
        let snapshot = widget.snapshot();
        self.widgets.write().await.insert(
            snapshot.widget_id.clone(),
            MountedWidget {
                widget: Arc::new(Mutex::new(widget)),
                last_seen: StdMutex::new(Instant::now()),
            },
        );
        info!(widget_id = %snapshot.widget_id, "widget mounted");
        snapshot
    }

    /// Looks a widget up and marks it as seen.
    async fn widget(&self, widget_id: &str) -> Result<Arc<Mutex<ChatWidget>>, WidgetError> {
        let widgets = self.widgets.read().await;
        let mounted = widgets
            .get(widget_id)
            .ok_or_else(|| WidgetError::WidgetNotFound(widget_id.to_string()))?;
        mounted.touch();
        Ok(mounted.widget.clone())
    }

    async fn touch(&self, widget_id: &str) {
        if let Some(mounted) = self.widgets.read().await.get(widget_id) {
            mounted.touch();
        }
    }

    async fn unmount(&self, widget_id: &str) -> Result<(), WidgetError> {
        let mounted = self
            .widgets
            .write()
            .await
            .remove(widget_id)
            .ok_or_else(|| WidgetError::WidgetNotFound(widget_id.to_string()))?;
        retire(&mounted.widget).await;
        info!(%widget_id, "widget unmounted");
        Ok(())
    }

    /// Unmounts widgets that have no realtime client and have not been used
    /// for `ttl`. Returns how many were removed.
    pub async fn reap_idle(&self, ttl: Duration) -> usize {
        let candidates: Vec<(String, Arc<Mutex<ChatWidget>>)> = self
            .widgets
            .read()
            .await
            .iter()
            .filter(|(_, mounted)| mounted.idle_for() >= ttl)
            .map(|(widget_id, mounted)| (widget_id.clone(), mounted.widget.clone()))
            .collect();

        let mut reaped = 0;
        for (widget_id, widget) in candidates {
            if widget.lock().await.has_channel() {
                continue;
            }
            let removed = {
                let mut widgets = self.widgets.write().await;
                let still_idle = widgets
                    .get(&widget_id)
                    .is_some_and(|mounted| mounted.idle_for() >= ttl);
                still_idle && widgets.remove(&widget_id).is_some()
            };
            if removed {
                retire(&widget).await;
                debug!(%widget_id, "idle widget unmounted");
                reaped += 1;
            }
        }
        reaped
    }
}

/// Stops a widget's greeting cycle and drops its realtime client.
async fn retire(widget: &Mutex<ChatWidget>) {
    let widget = widget.lock().await;
    widget.greeting().interrupt();
    widget.detach_channel();
}

/// Periodically unmounts widgets left idle for longer than `ttl`.
pub fn spawn_idle_sweep(state: Arc<AppState>, ttl: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(ttl);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = state.reap_idle(ttl).await;
            if reaped > 0 {
                info!(reaped, "idle widgets unmounted");
            }
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    widget_id: String,
}

/// Widget actions arriving over the realtime channel, applied in order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WidgetCommand {
    Open,
    Close,
    Toggle,
    Send(String),
    Chip(usize),
    End,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/widget", post(create_widget))
        .route("/api/widget/{widget_id}", get(get_widget).delete(delete_widget))
        .route("/api/widget/{widget_id}/open", post(open_widget))
        .route("/api/widget/{widget_id}/close", post(close_widget))
        .route("/api/widget/{widget_id}/end", post(end_conversation))
        .route("/api/widget/{widget_id}/message", post(post_message))
        .route("/api/widget/{widget_id}/chip", post(click_chip))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn create_widget(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let settings = load_settings(state.backend.as_ref()).await;
    let snapshot = state.mount(ChatWidget::new(settings)).await;
    (StatusCode::CREATED, Json(snapshot))
}

async fn get_widget(
    Path(widget_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<WidgetSnapshot>, WidgetError> {
    let widget = state.widget(&widget_id).await?;
    let snapshot = widget.lock().await.snapshot();
    Ok(Json(snapshot))
}

async fn delete_widget(
    Path(widget_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<StatusCode, WidgetError> {
    state.unmount(&widget_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn apply_and_snapshot(
    state: &AppState,
    widget_id: &str,
    command: WidgetCommand,
) -> Result<Json<WidgetSnapshot>, WidgetError> {
    let widget = state.widget(widget_id).await?;
    apply_command(&widget, state.backend.as_ref(), command).await?;
    let snapshot = widget.lock().await.snapshot();
    Ok(Json(snapshot))
}

async fn open_widget(
    Path(widget_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<WidgetSnapshot>, WidgetError> {
    apply_and_snapshot(&state, &widget_id, WidgetCommand::Open).await
}

async fn close_widget(
    Path(widget_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<WidgetSnapshot>, WidgetError> {
    apply_and_snapshot(&state, &widget_id, WidgetCommand::Close).await
}

async fn end_conversation(
    Path(widget_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<WidgetSnapshot>, WidgetError> {
    apply_and_snapshot(&state, &widget_id, WidgetCommand::End).await
}

async fn post_message(
    Path(widget_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<WidgetSnapshot>, WidgetError> {
    apply_and_snapshot(&state, &widget_id, WidgetCommand::Send(body.text)).await
}

async fn click_chip(
    Path(widget_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChipClickBody>,
) -> Result<Json<WidgetSnapshot>, WidgetError> {
    apply_and_snapshot(&state, &widget_id, WidgetCommand::Chip(body.index)).await
}

async fn apply_command(
    widget: &Mutex<ChatWidget>,
    backend: &dyn ChatBackend,
    command: WidgetCommand,
) -> Result<(), WidgetError> {
    match command {
        WidgetCommand::Open => widget.lock().await.open(),
        WidgetCommand::Close => widget.lock().await.close(),
        WidgetCommand::Toggle => widget.lock().await.toggle(),
        WidgetCommand::End => widget.lock().await.end_conversation(),
        WidgetCommand::Send(text) => deliver(widget, backend, &text).await?,
        WidgetCommand::Chip(index) => {
            let postback = widget.lock().await.chip_postback(index)?;
            deliver(widget, backend, &postback).await?;
        }
    }
    Ok(())
}

fn command_from_event(event: &str, data: &Value) -> Option<WidgetCommand> {
    match event {
        "widget:open" => Some(WidgetCommand::Open),
        "widget:close" => Some(WidgetCommand::Close),
        "widget:toggle" => Some(WidgetCommand::Toggle),
        "widget:end" => Some(WidgetCommand::End),
        "widget:message" => data
            .get("text")
            .and_then(Value::as_str)
            .map(|text| WidgetCommand::Send(text.to_string())),
        "widget:chip" => data
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|index| usize::try_from(index).ok())
            .map(WidgetCommand::Chip),
        _ => None,
    }
}

const INBOUND_EVENTS: [&str; 6] = [
    "widget:open",
    "widget:close",
    "widget:toggle",
    "widget:end",
    "widget:message",
    "widget:chip",
];

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, WidgetError> {
    let widget = state.widget(&query.widget_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, query.widget_id, widget, state)))
}

/// Registers the inbound widget events on `channel`, attaches it to the widget
/// and returns the queue those events land in. The queue closes once the
/// channel drops its handlers on disconnect.
async fn connect_channel(
    widget: &Mutex<ChatWidget>,
    channel: Arc<dyn RealtimeChannel>,
) -> mpsc::UnboundedReceiver<WidgetCommand> {
    let (commands_tx, commands) = mpsc::unbounded_channel();
    for event in INBOUND_EVENTS {
        let tx = commands_tx.clone();
        channel.on(
            event,
            Arc::new(move |data: Value| {
                if let Some(command) = command_from_event(event, &data) {
                    let _ = tx.send(command);
                }
            }),
        );
    }
    widget.lock().await.attach_channel(channel);
    commands
}

/// Applies queued commands in arrival order until the queue closes.
///
/// Sends and chip clicks run alongside the queue so open/close stay responsive
/// while the chatbot is thinking. Sends still in flight are awaited before
/// returning.
async fn run_commands(
    widget: Arc<Mutex<ChatWidget>>,
    backend: Arc<dyn ChatBackend>,
    mut commands: mpsc::UnboundedReceiver<WidgetCommand>,
) {
    let mut sends = JoinSet::new();
    while let Some(command) = commands.recv().await {
        while sends.try_join_next().is_some() {}
        match command {
            WidgetCommand::Send(_) | WidgetCommand::Chip(_) => {
                let widget = widget.clone();
                let backend = backend.clone();
                sends.spawn(async move {
                    if let Err(err) = apply_command(&widget, backend.as_ref(), command).await {
                        debug!("realtime command rejected: {err}");
                    }
                });
            }
            command => {
                if let Err(err) = apply_command(&widget, backend.as_ref(), command).await {
                    debug!("realtime command rejected: {err}");
                }
            }
        }
    }
    while sends.join_next().await.is_some() {}
}

async fn handle_socket(
    socket: WebSocket,
    widget_id: String,
    widget: Arc<Mutex<ChatWidget>>,
    state: Arc<AppState>,
) {
    let (channel, mut outbound) = SocketChannel::new();
    let channel_dyn: Arc<dyn RealtimeChannel> = channel.clone();
    let commands = connect_channel(&widget, channel_dyn.clone()).await;
    info!(%widget_id, "realtime client attached");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let command_task = tokio::spawn(run_commands(widget.clone(), state.backend.clone(), commands));

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        channel.dispatch(&text);
    }

    if widget.lock().await.release_channel(&channel_dyn) {
        info!(%widget_id, "realtime client detached");
    }
    channel.disconnect();
    state.touch(&widget_id).await;
    send_task.abort();
    let _ = command_task.await;
}
