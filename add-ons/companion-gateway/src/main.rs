//! Companion gateway: serves the status API and the audio WebSocket, and runs
//! the session controller on a dedicated thread.
//!
//! Flags: `--local-audio` captures from the host microphone and plays through
//! the host speaker (needs the `local-audio` feature).

mod app;
mod controller_thread;

use anyhow::Context;
use app::{build_app, AppState};
use companion_core::{shared_sink, Command, CompanionConfig, TurnStateMachine};
use companion_voice::{ingress_channel, ChannelSink, OutputEvent};
use controller_thread::{startup_failure, ControllerThread};
use std::future::IntoFuture;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const OUTPUT_FANOUT: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[companion-gateway] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match CompanionConfig::load() {
        Ok(c) => c,
        Err(e) => {
            error!(target: "companion::gateway", "{}", e);
            return Err(e).context("invalid configuration");
        }
    };
    let local_audio = std::env::args().any(|a| a == "--local-audio");
    info!(
        target: "companion::gateway",
        "{} starting (debug: {}, models: {})",
        config.app_name,
        config.debug,
        config.llm.models.join(" → ")
    );

    let turn = Arc::new(TurnStateMachine::new());
    let ready = Arc::new(AtomicBool::new(false));
    let (ingress_tx, ingress_rx) = ingress_channel(config.audio.ingress_capacity);
    let (commands_tx, commands_rx) = mpsc::channel::<Command>(16);

    // controller → sink → every connected socket
    let (sink, mut sink_rx) = ChannelSink::channel(OUTPUT_FANOUT);
    let (output_tx, _) = broadcast::channel::<OutputEvent>(OUTPUT_FANOUT);
    let fanout = output_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = sink_rx.recv().await {
            // no connected clients is fine
            let _ = fanout.send(event);
        }
    });

    let (startup_tx, startup_rx) = oneshot::channel();
    let controller = ControllerThread {
        config: config.clone(),
        turn: Arc::clone(&turn),
        output: shared_sink(sink),
        ingress_tx: ingress_tx.clone(),
        ingress_rx,
        commands_rx,
        ready: Arc::clone(&ready),
        local_audio,
        startup: startup_tx,
    }
    .spawn()
    .context("spawning the controller thread")?;

    let state = AppState {
        ready,
        turn,
        commands: commands_tx.clone(),
        ingress: ingress_tx,
        output: output_tx,
    };
    let app = build_app(state, &config.gateway);

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(target: "companion::gateway", "🚀 Listening on {}", addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(target: "companion::gateway", "Ctrl+C handler failed: {}", e);
        }
        info!(target: "companion::gateway", "Shutdown requested");
    });

    // a controller that cannot start is fatal, even after the listener is up
    tokio::select! {
        served = server.into_future() => served.context("server error")?,
        e = startup_failure(startup_rx) => {
            error!(target: "companion::gateway", "Startup failed: {:#}", e);
            return Err(e.context("controller failed to start"));
        }
    }

    // end any open session so it is persisted and reflected on
    if commands_tx.send(Command::Shutdown).await.is_err() {
        warn!(target: "companion::gateway", "Controller already stopped");
    }
    match tokio::task::spawn_blocking(move || controller.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => error!(target: "companion::gateway", "Controller thread panicked"),
        Err(e) => error!(target: "companion::gateway", "Could not join controller thread: {}", e),
    }
    info!(target: "companion::gateway", "Goodbye");
    Ok(())
}
