use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use shared::{
    domain::StopwatchId,
    error::{ApiError, ApiException},
    protocol::{
        ActivityEntry, ClientMessage, ConnectedClient, LapSummary, ServerEvent, StopwatchCommand,
        StopwatchSnapshot,
    },
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

pub mod clock;

use clock::DisplayClock;
pub use clock::{format_elapsed, lap_segments};

/// Granularity of the local display tick. Each tick re-derives the shown
/// value from the snapshot anchor, so the interval affects smoothness only,
/// never accuracy.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error("server rejected request: {0}")]
    Api(#[from] ApiException),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A fresh authoritative snapshot replaced the local state.
    SnapshotApplied(StopwatchSnapshot),
    /// Local display tick while the stopwatch is running.
    Tick { elapsed_ms: i64 },
    ClientListUpdated(Vec<ConnectedClient>),
    Error(String),
}

struct ClientState {
    server_url: Option<String>,
    stopwatch_id: Option<StopwatchId>,
    clock: Option<DisplayClock>,
    laps: Vec<LapSummary>,
    local_lap_seq: u64,
    tick_task: Option<JoinHandle<()>>,
    ws_reader_task: Option<JoinHandle<()>>,
    ws_writer_task: Option<JoinHandle<()>>,
    ws_tx: Option<mpsc::UnboundedSender<Message>>,
}

/// Client-side reconciler: turns point-in-time snapshots into a continuously
/// updating display and pushes user commands back over the live channel.
///
/// User actions update the local clock optimistically; the next broadcast
/// snapshot is authoritative and overwrites whatever the optimistic path
/// guessed.
pub struct StopwatchClient {
    http: Client,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

impl StopwatchClient {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: Client::new(),
            inner: Mutex::new(ClientState {
                server_url: None,
                stopwatch_id: None,
                clock: None,
                laps: Vec::new(),
                local_lap_seq: 0,
                tick_task: None,
                ws_reader_task: None,
                ws_writer_task: None,
                ws_tx: None,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Connects to a server and starts reconciling one stopwatch. The
    /// snapshot is fetched over plain HTTP before the live channel is
    /// established so the display is never blank while the ws handshake
    /// completes.
    pub async fn connect(
        self: &Arc<Self>,
        server_url: &str,
        stopwatch_id: StopwatchId,
    ) -> Result<(), ClientError> {
        let server_url = server_url.trim_end_matches('/').to_string();

        let snapshot = self.fetch_snapshot(&server_url, &stopwatch_id).await?;
        {
            let mut guard = self.inner.lock().await;
            guard.server_url = Some(server_url.clone());
            guard.stopwatch_id = Some(stopwatch_id.clone());
        }
        self.apply_snapshot(snapshot).await;

        self.spawn_ws_events(&server_url, &stopwatch_id).await?;
        info!(stopwatch_id = %stopwatch_id, "connected");
        Ok(())
    }

    /// Displayed elapsed milliseconds right now, derived from the last
    /// applied snapshot plus the local clock.
    pub async fn current_elapsed_ms(&self) -> Option<i64> {
        let guard = self.inner.lock().await;
        guard.clock.map(|clock| clock.elapsed_ms(Utc::now()))
    }

    pub async fn is_running(&self) -> bool {
        let guard = self.inner.lock().await;
        guard.clock.map(|clock| clock.is_running()).unwrap_or(false)
    }

    /// Laps as currently displayed, newest first, including optimistic
    /// entries not yet confirmed by a broadcast.
    pub async fn laps(&self) -> Vec<LapSummary> {
        self.inner.lock().await.laps.clone()
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), ClientError> {
        {
            let mut guard = self.inner.lock().await;
            let elapsed = guard
                .clock
                .map(|clock| clock.elapsed_ms(Utc::now()))
                .unwrap_or(0);
            let clock = DisplayClock::running(Utc::now() - chrono::Duration::milliseconds(elapsed));
            self.install_clock(&mut guard, clock);
        }
        self.send_action(StopwatchCommand::Start).await
    }

    pub async fn pause(self: &Arc<Self>) -> Result<(), ClientError> {
        {
            let mut guard = self.inner.lock().await;
            let elapsed = guard
                .clock
                .map(|clock| clock.elapsed_ms(Utc::now()))
                .unwrap_or(0);
            self.install_clock(&mut guard, DisplayClock::paused(elapsed));
        }
        self.send_action(StopwatchCommand::Pause).await
    }

    /// Records a lap at the currently displayed elapsed time. The server
    /// trusts this value; every viewer derives it from the same synchronized
    /// anchor, so honest clients agree.
    pub async fn lap(self: &Arc<Self>) -> Result<(), ClientError> {
        let current_time = {
            let mut guard = self.inner.lock().await;
            let Some(clock) = guard.clock else {
                return Err(ClientError::NotConnected);
            };
            if !clock.is_running() {
                return Err(ClientError::Api(ApiException::new(
                    shared::error::ErrorCode::Validation,
                    "stopwatch is not running",
                )));
            }
            let current_time = clock.elapsed_ms(Utc::now());
            guard.local_lap_seq += 1;
            let local_id = format!("local-{}", guard.local_lap_seq);
            guard.laps.insert(
                0,
                LapSummary {
                    id: local_id,
                    time: current_time,
                },
            );
            current_time
        };
        self.send_action(StopwatchCommand::Lap { current_time }).await
    }

    pub async fn reset(self: &Arc<Self>) -> Result<(), ClientError> {
        {
            let mut guard = self.inner.lock().await;
            guard.laps.clear();
            self.install_clock(&mut guard, DisplayClock::paused(0));
        }
        self.send_action(StopwatchCommand::Reset).await
    }

    pub async fn fetch_activity(&self) -> Result<Vec<ActivityEntry>, ClientError> {
        let (server_url, stopwatch_id) = self.session().await?;
        let response = self
            .http
            .get(format!("{server_url}/stopwatch/{stopwatch_id}/activity"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(into_api_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// Cancels the local tick and releases the live channel. Safe to call
    /// more than once; remounting goes through `connect` again.
    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(task) = guard.tick_task.take() {
            task.abort();
        }
        if let Some(task) = guard.ws_reader_task.take() {
            task.abort();
        }
        if let Some(task) = guard.ws_writer_task.take() {
            task.abort();
        }
        guard.ws_tx = None;
        guard.clock = None;
    }

    async fn fetch_snapshot(
        &self,
        server_url: &str,
        stopwatch_id: &StopwatchId,
    ) -> Result<StopwatchSnapshot, ClientError> {
        let response = self
            .http
            .get(format!("{server_url}/stopwatch/{stopwatch_id}"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(into_api_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn apply_snapshot(self: &Arc<Self>, snapshot: StopwatchSnapshot) {
        {
            let mut guard = self.inner.lock().await;
            let clock = DisplayClock::from_snapshot(&snapshot);
            guard.laps = snapshot.laps.clone();
            self.install_clock(&mut guard, clock);
        }
        let _ = self.events.send(ClientEvent::SnapshotApplied(snapshot));
    }

    /// Swaps the display clock, cancelling the previous tick task and
    /// starting a fresh one when the new clock runs. The caller holds the
    /// state lock.
    fn install_clock(self: &Arc<Self>, guard: &mut ClientState, clock: DisplayClock) {
        if let Some(task) = guard.tick_task.take() {
            task.abort();
        }
        guard.clock = Some(clock);
        if clock.is_running() {
            guard.tick_task = Some(self.spawn_tick_task(clock));
        } else {
            let _ = self.events.send(ClientEvent::Tick {
                elapsed_ms: clock.elapsed_ms(Utc::now()),
            });
        }
    }

    fn spawn_tick_task(self: &Arc<Self>, clock: DisplayClock) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let _ = events.send(ClientEvent::Tick {
                    elapsed_ms: clock.elapsed_ms(Utc::now()),
                });
            }
        })
    }

    async fn send_action(&self, command: StopwatchCommand) -> Result<(), ClientError> {
        let guard = self.inner.lock().await;
        let ws_tx = guard.ws_tx.as_ref().ok_or(ClientError::NotConnected)?;
        let text = serde_json::to_string(&ClientMessage::Action(command))
            .context("failed to encode action envelope")?;
        ws_tx
            .send(Message::Text(text))
            .map_err(|_| ClientError::NotConnected)?;
        Ok(())
    }

    async fn is_subscribed(&self, stopwatch_id: &str) -> bool {
        let guard = self.inner.lock().await;
        guard
            .stopwatch_id
            .as_ref()
            .map(|id| id.as_str() == stopwatch_id)
            .unwrap_or(false)
    }

    async fn session(&self) -> Result<(String, StopwatchId), ClientError> {
        let guard = self.inner.lock().await;
        let server_url = guard.server_url.clone().ok_or(ClientError::NotConnected)?;
        let stopwatch_id = guard
            .stopwatch_id
            .clone()
            .ok_or(ClientError::NotConnected)?;
        Ok((server_url, stopwatch_id))
    }

    async fn spawn_ws_events(
        self: &Arc<Self>,
        server_url: &str,
        stopwatch_id: &StopwatchId,
    ) -> Result<(), ClientError> {
        let ws_url = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ClientError::Transport(anyhow!(
                "server_url must start with http:// or https://"
            )));
        };
        let ws_url = format!("{ws_url}/ws?stopwatch_id={stopwatch_id}");
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))
            .map_err(ClientError::Transport)?;
        let (mut ws_sink, mut ws_reader) = ws_stream.split();

        let (ws_tx, mut ws_rx) = mpsc::unbounded_channel::<Message>();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = ws_rx.recv().await {
                if ws_sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        let client = Arc::clone(self);
        let reader_task = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(ServerEvent::StateUpdate(snapshot)) => {
                            // Updates for other stopwatch keys never touch
                            // this display.
                            if client.is_subscribed(&snapshot.stopwatch_id).await {
                                client.apply_snapshot(snapshot).await;
                            }
                        }
                        Ok(ServerEvent::ClientListUpdate(roster)) => {
                            let _ = client.events.send(ClientEvent::ClientListUpdated(roster));
                        }
                        Ok(ServerEvent::Error(err)) => {
                            let rejection = ApiException::from(err);
                            warn!(%rejection, "server rejected a command");
                            let _ = client.events.send(ClientEvent::Error(rejection.to_string()));
                        }
                        Err(err) => {
                            let _ = client
                                .events
                                .send(ClientEvent::Error(format!("invalid server event: {err}")));
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = client.events.send(ClientEvent::Error(format!(
                            "websocket receive failed: {err}"
                        )));
                        break;
                    }
                }
            }
        });

        let mut guard = self.inner.lock().await;
        // Reconnecting replaces the live channel; the previous socket's tasks
        // must not keep feeding the display.
        if let Some(task) = guard.ws_reader_task.take() {
            task.abort();
        }
        if let Some(task) = guard.ws_writer_task.take() {
            task.abort();
        }
        guard.ws_tx = Some(ws_tx);
        guard.ws_reader_task = Some(reader_task);
        guard.ws_writer_task = Some(writer_task);
        Ok(())
    }
}

async fn into_api_error(response: reqwest::Response) -> ClientError {
    match response.json::<ApiError>().await {
        Ok(err) => ClientError::Api(ApiException::from(err)),
        Err(err) => ClientError::Http(err),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
