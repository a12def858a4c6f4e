//! Routes: health, status, manual session start, and the audio WebSocket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use companion_core::{Command, GatewayConfig, StartResult, Transition, TurnStateMachine};
use companion_voice::{IngressSender, OutputEvent};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    /// Set once the controller has loaded its models
    pub ready: Arc<AtomicBool>,
    pub turn: Arc<TurnStateMachine>,
    pub commands: mpsc::Sender<Command>,
    pub ingress: IngressSender,
    /// Synthesized audio and control events, fanned out to every socket
    pub output: broadcast::Sender<OutputEvent>,
}

impl AppState {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

pub fn build_app(state: AppState, gateway: &GatewayConfig) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/start-session", post(start_session))
        .route("/ws/audio", get(ws_audio))
        .layer(cors(gateway))
        .with_state(state)
}

fn cors(gateway: &GatewayConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = gateway
        .allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(target: "companion::gateway", "Ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();
    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let label = if state.is_ready() {
        state.turn.state().status_label()
    } else {
        "loading"
    };
    Json(json!({ "status": label }))
}

async fn start_session(State(state): State<AppState>) -> impl IntoResponse {
    if !state.is_ready() {
        return (StatusCode::OK, Json(json!({ "status": "loading_models" })));
    }
    let (tx, rx) = oneshot::channel();
    if state.commands.send(Command::StartSession(tx)).await.is_err() {
        warn!(target: "companion::gateway", "Controller is not running");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable" })),
        );
    }
    match rx.await {
        Ok(result) => {
            info!(target: "companion::gateway", "Manual session start: {:?}", result);
            let label = match result {
                StartResult::Started => "started",
                StartResult::AlreadyActive => "already_active",
            };
            (StatusCode::OK, Json(json!({ "status": label })))
        }
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable" })),
        ),
    }
}

async fn ws_audio(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn state_message(t: &Transition) -> Message {
    Message::Text(json!({ "type": "state", "state": t.to.status_label() }).to_string())
}

fn output_message(event: OutputEvent) -> Message {
    match event {
        OutputEvent::Audio(bytes) => Message::Binary(bytes),
        OutputEvent::Control(control) => Message::Text(json!({ "type": control.as_str() }).to_string()),
    }
}

/// Binary frames in go to the ingress queue; audio, control and state changes go out.
async fn handle_socket(socket: WebSocket, state: AppState) {
    info!(target: "companion::gateway", "🔌 Audio client connected");
    let (mut sender, mut receiver) = socket.split();
    let mut output = state.output.subscribe();
    let mut transitions = state.turn.transitions();

    let mut egress = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                event = output.recv() => match event {
                    Ok(e) => output_message(e),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "companion::gateway", "Client fell behind, skipped {} output events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                t = transitions.recv() => match t {
                    Ok(t) => state_message(&t),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let ingress = state.ingress.clone();
    let mut ingress_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Binary(bytes) => match ingress.try_send(bytes) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(target: "companion::gateway", "Ingress queue full, dropping audio chunk")
                    }
                    Err(TrySendError::Closed(_)) => break,
                },
                Message::Close(_) => break,
                other => debug!(target: "companion::gateway", "Ignoring message {:?}", other),
            }
        }
    });

    tokio::select! {
        _ = &mut egress => ingress_task.abort(),
        _ = &mut ingress_task => egress.abort(),
    }
    info!(target: "companion::gateway", "Audio client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use companion_voice::ingress_channel;
    use tower::ServiceExt;

    fn test_state(ready: bool) -> (AppState, mpsc::Receiver<Command>) {
        let (commands, commands_rx) = mpsc::channel(4);
        let (ingress, _ingress_rx) = ingress_channel(4);
        let (output, _) = broadcast::channel(4);
        let state = AppState {
            ready: Arc::new(AtomicBool::new(ready)),
            turn: Arc::new(TurnStateMachine::new()),
            commands,
            ingress,
            output,
        };
        (state, commands_rx)
    }

    async fn json_of(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _rx) = test_state(true);
        let (code, body) = json_of(build_app(state, &GatewayConfig::default()), "GET", "/health").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_tracks_readiness_and_turn_state() {
        let (state, _rx) = test_state(false);
        let app = build_app(state.clone(), &GatewayConfig::default());
        assert_eq!(json_of(app.clone(), "GET", "/status").await.1["status"], "loading");

        state.ready.store(true, Ordering::SeqCst);
        assert_eq!(json_of(app.clone(), "GET", "/status").await.1["status"], "idle");

        state.turn.wake_detected().unwrap();
        assert_eq!(json_of(app.clone(), "GET", "/status").await.1["status"], "listening");
        state.turn.start_thinking().unwrap();
        assert_eq!(json_of(app, "GET", "/status").await.1["status"], "thinking");
    }

    #[tokio::test]
    async fn test_start_session_before_ready() {
        let (state, _rx) = test_state(false);
        let (code, body) =
            json_of(build_app(state, &GatewayConfig::default()), "POST", "/start-session").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "loading_models");
    }

    #[tokio::test]
    async fn test_start_session_forwards_to_controller() {
        let (state, mut rx) = test_state(true);
        tokio::spawn(async move {
            let mut first = true;
            while let Some(cmd) = rx.recv().await {
                if let Command::StartSession(reply) = cmd {
                    let result = if first {
                        StartResult::Started
                    } else {
                        StartResult::AlreadyActive
                    };
                    first = false;
                    let _ = reply.send(result);
                }
            }
        });
        let app = build_app(state, &GatewayConfig::default());

        let (_, body) = json_of(app.clone(), "POST", "/start-session").await;
        assert_eq!(body["status"], "started");
        let (_, body) = json_of(app, "POST", "/start-session").await;
        assert_eq!(body["status"], "already_active");
    }

    #[test]
    fn test_output_messages() {
        assert_eq!(
            output_message(OutputEvent::Control(companion_voice::ControlEvent::Interrupt)),
            Message::Text(r#"{"type":"stop"}"#.to_string())
        );
        assert_eq!(
            output_message(OutputEvent::Audio(vec![1, 2])),
            Message::Binary(vec![1, 2])
        );
    }
}
