use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use server_api::{apply_command, current_snapshot, list_activity, ApiContext};
use shared::{
    domain::StopwatchId,
    error::{ApiError, ErrorCode},
    protocol::{
        ActivityEntry, ClientMessage, ConnectedClient, ServerEvent, StopwatchCommand,
        StopwatchSnapshot,
    },
};
use storage::Storage;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

mod config;

use config::{load_settings, prepare_database_url};

struct AppState {
    api: ApiContext,
    events: broadcast::Sender<ServerEvent>,
    clients: Mutex<HashMap<String, ConnectedClient>>,
    default_stopwatch: StopwatchId,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    stopwatch_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext { storage };
    let (events, _) = broadcast::channel(256);

    let state = AppState {
        api,
        events,
        clients: Mutex::new(HashMap::new()),
        default_stopwatch: StopwatchId::new(settings.default_stopwatch_id),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stopwatch/:stopwatch_id", get(http_snapshot))
        .route("/stopwatch/:stopwatch_id/action", post(http_action))
        .route("/stopwatch/:stopwatch_id/activity", get(http_activity))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Idempotent snapshot fetch; first contact with an unknown key creates the
/// paused default state.
async fn http_snapshot(
    State(state): State<Arc<AppState>>,
    Path(stopwatch_id): Path<String>,
) -> Result<Json<StopwatchSnapshot>, (StatusCode, Json<ApiError>)> {
    let snapshot = current_snapshot(&state.api, &StopwatchId::new(stopwatch_id))
        .await
        .map_err(reject)?;
    Ok(Json(snapshot))
}

/// Command submission over HTTP. The body is decoded by hand so an
/// unrecognized action is a validation failure rather than a framework
/// rejection, with no state change and no log entry.
async fn http_action(
    State(state): State<Arc<AppState>>,
    Path(stopwatch_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let command: StopwatchCommand = serde_json::from_value(body).map_err(|err| {
        reject(ApiError::new(
            ErrorCode::Validation,
            format!("invalid action: {err}"),
        ))
    })?;

    let stopwatch_id = StopwatchId::new(stopwatch_id);
    let snapshot = apply_command(&state.api, &stopwatch_id, command)
        .await
        .map_err(reject)?;
    let _ = state.events.send(ServerEvent::StateUpdate(snapshot));
    Ok(StatusCode::NO_CONTENT)
}

async fn http_activity(
    State(state): State<Arc<AppState>>,
    Path(stopwatch_id): Path<String>,
) -> Result<Json<Vec<ActivityEntry>>, (StatusCode, Json<ApiError>)> {
    let entries = list_activity(&state.api, &StopwatchId::new(stopwatch_id))
        .await
        .map_err(reject)?;
    Ok(Json(entries))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    let stopwatch_id = q
        .stopwatch_id
        .map(StopwatchId::new)
        .unwrap_or_else(|| state.default_stopwatch.clone());
    ws.on_upgrade(move |socket| ws_connection(state, socket, stopwatch_id))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    stopwatch_id: StopwatchId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let connection_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before registering so this viewer sees its own arrival in the
    // client list broadcast.
    let mut events_rx = state.events.subscribe();
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<ServerEvent>();

    register_client(&state, &connection_id).await;
    info!(%connection_id, stopwatch_id = %stopwatch_id, "viewer connected");

    let subscribed = stopwatch_id.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                broadcasted = events_rx.recv() => match broadcasted {
                    Ok(event) => event,
                    // A slow viewer skips intermediate snapshots; each
                    // broadcast carries the full state, so nothing is lost.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                direct = direct_rx.recv() => match direct {
                    Some(event) => event,
                    None => break,
                },
            };
            // State updates are keyed; this connection only watches one
            // stopwatch.
            if let ServerEvent::StateUpdate(snapshot) = &event {
                if snapshot.stopwatch_id != subscribed.as_str() {
                    continue;
                }
            }
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Action(command)) => {
                match apply_command(&state.api, &stopwatch_id, command).await {
                    Ok(snapshot) => {
                        let _ = state.events.send(ServerEvent::StateUpdate(snapshot));
                    }
                    Err(err) => {
                        // Rejections go back to the issuing viewer only; the
                        // shared state did not change, so there is nothing to
                        // broadcast.
                        warn!(%connection_id, code = ?err.code, message = %err.message, "command rejected");
                        let _ = direct_tx.send(ServerEvent::Error(err));
                    }
                }
            }
            Err(err) => {
                let _ = direct_tx.send(ServerEvent::Error(ApiError::new(
                    ErrorCode::Validation,
                    format!("invalid client message: {err}"),
                )));
            }
        }
    }

    send_task.abort();
    unregister_client(&state, &connection_id).await;
    info!(%connection_id, "viewer disconnected");
}

async fn register_client(state: &Arc<AppState>, connection_id: &str) {
    let roster = {
        let mut clients = state.clients.lock().await;
        clients.insert(
            connection_id.to_string(),
            ConnectedClient {
                id: connection_id.to_string(),
                connected_at: Utc::now(),
            },
        );
        clients.values().cloned().collect::<Vec<_>>()
    };
    let _ = state.events.send(ServerEvent::ClientListUpdate(roster));
}

async fn unregister_client(state: &Arc<AppState>, connection_id: &str) {
    let roster = {
        let mut clients = state.clients.lock().await;
        clients.remove(connection_id);
        clients.values().cloned().collect::<Vec<_>>()
    };
    let _ = state.events.send(ServerEvent::ClientListUpdate(roster));
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

#[cfg(test)]
mod tests {
    use std::future::IntoFuture;

    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use futures::{SinkExt, StreamExt};
    use http_body_util::BodyExt;
    use tokio_tungstenite::{connect_async, tungstenite};
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let (events, _) = broadcast::channel(32);
        Arc::new(AppState {
            api: ApiContext { storage },
            events,
            clients: Mutex::new(HashMap::new()),
            default_stopwatch: StopwatchId::new("main"),
        })
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("req"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn snapshot_fetch_creates_default_state() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(
                Request::get("/stopwatch/main")
                    .body(Body::empty())
                    .expect("req"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let value = body_json(response.into_body()).await;
        assert_eq!(value["isRunning"], false);
        assert_eq!(value["elapsedTime"], "0");
        assert!(value["laps"].as_array().expect("laps").is_empty());
    }

    #[tokio::test]
    async fn start_action_returns_no_content_and_persists() {
        let app = build_router(test_state().await);
        let response = app
            .clone()
            .oneshot(
                Request::post("/stopwatch/main/action")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{ "action": "start" }"#))
                    .expect("req"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(
                Request::get("/stopwatch/main")
                    .body(Body::empty())
                    .expect("req"),
            )
            .await
            .expect("response");
        let value = body_json(response.into_body()).await;
        assert_eq!(value["isRunning"], true);
    }

    #[tokio::test]
    async fn lap_while_paused_is_bad_request() {
        let app = build_router(test_state().await);
        let response = app
            .clone()
            .oneshot(
                Request::post("/stopwatch/main/action")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{ "action": "lap", "currentTime": 1200 }"#))
                    .expect("req"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = body_json(response.into_body()).await;
        assert_eq!(value["code"], "validation");

        // No activity entry for the rejected command.
        let response = app
            .oneshot(
                Request::get("/stopwatch/main/activity")
                    .body(Body::empty())
                    .expect("req"),
            )
            .await
            .expect("response");
        let value = body_json(response.into_body()).await;
        assert!(value.as_array().expect("entries").is_empty());
    }

    #[tokio::test]
    async fn unknown_action_is_rejected_without_side_effects() {
        let app = build_router(test_state().await);
        let response = app
            .clone()
            .oneshot(
                Request::post("/stopwatch/main/action")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{ "action": "rewind" }"#))
                    .expect("req"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(
                Request::get("/stopwatch/main")
                    .body(Body::empty())
                    .expect("req"),
            )
            .await
            .expect("response");
        let value = body_json(response.into_body()).await;
        assert_eq!(value["isRunning"], false);
    }

    #[tokio::test]
    async fn activity_log_lists_actions_newest_first() {
        let app = build_router(test_state().await);
        for body in [r#"{ "action": "start" }"#, r#"{ "action": "pause" }"#] {
            let response = app
                .clone()
                .oneshot(
                    Request::post("/stopwatch/main/action")
                        .header("content-type", "application/json")
                        .body(Body::from(body))
                        .expect("req"),
                )
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }

        let response = app
            .oneshot(
                Request::get("/stopwatch/main/activity")
                    .body(Body::empty())
                    .expect("req"),
            )
            .await
            .expect("response");
        let value = body_json(response.into_body()).await;
        let entries = value.as_array().expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["action"], "PAUSE");
        assert_eq!(entries[1]["action"], "START");
    }

    async fn spawn_server() -> SocketAddr {
        let app = build_router(test_state().await);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(axum::serve(listener, app).into_future());
        addr
    }

    async fn next_event(
        ws: &mut (impl futures::Stream<Item = Result<tungstenite::Message, tungstenite::Error>>
                  + Unpin),
        want_state_update: bool,
    ) -> ServerEvent {
        loop {
            let msg = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
                .await
                .expect("event before timeout")
                .expect("stream open")
                .expect("frame");
            if let tungstenite::Message::Text(text) = msg {
                let event: ServerEvent = serde_json::from_str(&text).expect("server event");
                match (&event, want_state_update) {
                    (ServerEvent::StateUpdate(_), true) => return event,
                    (_, false) => return event,
                    _ => continue,
                }
            }
        }
    }

    #[tokio::test]
    async fn second_viewer_observes_first_viewers_start_without_polling() {
        let addr = spawn_server().await;

        let (mut viewer_a, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("viewer a");
        let (mut viewer_b, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("viewer b");

        // Both viewers see the two-entry roster once B has joined.
        let event = next_event(&mut viewer_b, false).await;
        match event {
            ServerEvent::ClientListUpdate(roster) => assert_eq!(roster.len(), 2),
            other => panic!("expected client_list_update, got {other:?}"),
        }

        viewer_a
            .send(tungstenite::Message::Text(
                r#"{ "type": "action", "payload": { "action": "start" } }"#.into(),
            ))
            .await
            .expect("send start");

        let a_update = match next_event(&mut viewer_a, true).await {
            ServerEvent::StateUpdate(snapshot) => snapshot,
            other => panic!("expected state_update, got {other:?}"),
        };
        let b_update = match next_event(&mut viewer_b, true).await {
            ServerEvent::StateUpdate(snapshot) => snapshot,
            other => panic!("expected state_update, got {other:?}"),
        };

        assert!(b_update.is_running);
        assert_eq!(a_update.start_time, b_update.start_time);
    }

    #[tokio::test]
    async fn state_updates_reach_only_viewers_of_the_same_stopwatch() {
        let addr = spawn_server().await;

        let (mut alpha, _) = connect_async(format!("ws://{addr}/ws?stopwatch_id=alpha"))
            .await
            .expect("alpha viewer");
        let (mut beta, _) = connect_async(format!("ws://{addr}/ws?stopwatch_id=beta"))
            .await
            .expect("beta viewer");

        beta.send(tungstenite::Message::Text(
            r#"{ "type": "action", "payload": { "action": "start" } }"#.into(),
        ))
        .await
        .expect("beta start");

        let beta_update = match next_event(&mut beta, true).await {
            ServerEvent::StateUpdate(snapshot) => snapshot,
            other => panic!("expected state_update, got {other:?}"),
        };
        assert_eq!(beta_update.stopwatch_id, "beta");

        // The broadcast channel preserves order, so if beta's update leaked
        // to the alpha viewer it would arrive before alpha's own.
        alpha
            .send(tungstenite::Message::Text(
                r#"{ "type": "action", "payload": { "action": "start" } }"#.into(),
            ))
            .await
            .expect("alpha start");

        let alpha_update = match next_event(&mut alpha, true).await {
            ServerEvent::StateUpdate(snapshot) => snapshot,
            other => panic!("expected state_update, got {other:?}"),
        };
        assert_eq!(alpha_update.stopwatch_id, "alpha");
    }

    #[tokio::test]
    async fn rejected_ws_command_reaches_only_the_issuer() {
        let addr = spawn_server().await;

        let (mut viewer, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("viewer");

        // Stopwatch is paused, so lap must come back as an error event.
        viewer
            .send(tungstenite::Message::Text(
                r#"{ "type": "action", "payload": { "action": "lap", "currentTime": 500 } }"#
                    .into(),
            ))
            .await
            .expect("send lap");

        loop {
            match next_event(&mut viewer, false).await {
                ServerEvent::Error(err) => {
                    assert!(matches!(err.code, ErrorCode::Validation));
                    break;
                }
                ServerEvent::ClientListUpdate(_) => continue,
                other => panic!("expected error event, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn disconnect_shrinks_the_broadcast_roster() {
        let addr = spawn_server().await;

        let (mut viewer_a, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("viewer a");
        let (viewer_b, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("viewer b");

        // A sees the roster grow to two.
        loop {
            if let ServerEvent::ClientListUpdate(roster) = next_event(&mut viewer_a, false).await {
                if roster.len() == 2 {
                    break;
                }
            }
        }

        drop(viewer_b);

        loop {
            if let ServerEvent::ClientListUpdate(roster) = next_event(&mut viewer_a, false).await {
                if roster.len() == 1 {
                    break;
                }
            }
        }
    }
}
