//! Runs the session controller on its own thread with a current-thread runtime.
//!
//! Model loading (local transcription) happens on this thread too, so the HTTP
//! side stays responsive and reports `loading` until it is done. The outcome of
//! that load is reported back once; a failure is fatal for the process.

use anyhow::Context;
use companion_core::{Capabilities, Command, CompanionConfig, SessionController, SharedSink, TurnStateMachine};
use companion_voice::{IngressReceiver, IngressSender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

pub struct ControllerThread {
    pub config: CompanionConfig,
    pub turn: Arc<TurnStateMachine>,
    pub output: SharedSink,
    pub ingress_tx: IngressSender,
    pub ingress_rx: IngressReceiver,
    pub commands_rx: mpsc::Receiver<Command>,
    pub ready: Arc<AtomicBool>,
    /// Capture from and play back on the host audio devices
    pub local_audio: bool,
    /// Receives `Ok` once the controller is ready, or why it could not start
    pub startup: oneshot::Sender<anyhow::Result<()>>,
}

impl ControllerThread {
    pub fn spawn(self) -> std::io::Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name("companion-controller".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                error!(target: "companion::gateway", "Controller runtime failed: {}", e);
                let _ = self
                    .startup
                    .send(Err(e).context("building the controller runtime"));
                return;
            }
        };
        let Self {
            config,
            turn,
            output,
            ingress_tx,
            ingress_rx,
            commands_rx,
            ready,
            local_audio,
            startup,
        } = self;

        rt.block_on(async move {
            info!(target: "companion::gateway", "Loading models...");
            let capabilities = match Capabilities::from_config(&config) {
                Ok(c) => c,
                Err(e) => {
                    error!(target: "companion::gateway", "Could not start the controller: {}", e);
                    let _ = startup.send(Err(e).context("loading capabilities"));
                    return;
                }
            };

            let (output, _capture) = local_devices(&config, output, ingress_tx, local_audio);
            let controller = SessionController::new(&config, capabilities, output, turn);
            ready.store(true, Ordering::SeqCst);
            info!(target: "companion::gateway", "✅ Models loaded, controller ready");
            // main may already be gone
            let _ = startup.send(Ok(()));
            controller.run(ingress_rx, commands_rx).await;
        });
    }
}

/// Resolves only if the controller reported a failed start.
pub async fn startup_failure(startup: oneshot::Receiver<anyhow::Result<()>>) -> anyhow::Error {
    match startup.await {
        Ok(Err(e)) => e,
        Ok(Ok(())) => std::future::pending().await,
        Err(_) => anyhow::anyhow!("controller thread exited before reporting readiness"),
    }
}

/// Host microphone and speaker. The capture stream must outlive the controller.
#[cfg(feature = "local-audio")]
fn local_devices(
    config: &CompanionConfig,
    output: SharedSink,
    ingress: IngressSender,
    enabled: bool,
) -> (SharedSink, Option<companion_voice::CaptureStream>) {
    use companion_core::shared_sink;
    use companion_voice::{AudioCapture, LocalPlayback};
    use tracing::warn;

    if !enabled {
        return (output, None);
    }
    let format = config.audio.format();
    let capture = match AudioCapture::new(format).and_then(|c| c.start_capture(ingress)) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(target: "companion::gateway", "Microphone unavailable: {}", e);
            None
        }
    };
    let output = match LocalPlayback::new(format.sample_rate) {
        Ok(playback) => shared_sink(playback),
        Err(e) => {
            warn!(target: "companion::gateway", "Speaker unavailable, using socket output: {}", e);
            output
        }
    };
    (output, capture)
}

#[cfg(not(feature = "local-audio"))]
fn local_devices(
    _config: &CompanionConfig,
    output: SharedSink,
    _ingress: IngressSender,
    enabled: bool,
) -> (SharedSink, Option<()>) {
    if enabled {
        tracing::warn!(
            target: "companion::gateway",
            "Built without the local-audio feature, ignoring --local-audio"
        );
    }
    (output, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn failed_start_is_reported() {
        let (tx, rx) = oneshot::channel();
        tx.send(Err(anyhow::anyhow!("whisper model missing")))
            .map_err(|_| ())
            .unwrap();
        let err = startup_failure(rx).await;
        assert!(err.to_string().contains("whisper model missing"));
    }

    #[tokio::test]
    async fn silent_exit_is_a_failure() {
        let (tx, rx) = oneshot::channel::<anyhow::Result<()>>();
        drop(tx);
        let err = startup_failure(rx).await;
        assert!(err.to_string().contains("before reporting"));
    }

    #[tokio::test]
    async fn successful_start_never_resolves() {
        let (tx, rx) = oneshot::channel();
        tx.send(Ok(())).map_err(|_| ()).unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(20), startup_failure(rx)).await;
        assert!(waited.is_err());
    }

    #[test]
    fn config_failure_from_capabilities_is_reported() {
        let mut config = CompanionConfig::default();
        config.debug = true;
        config.llm.api_key = Some("sk-test".into());
        config.audio.vad_mode = 9;
        let (tx, rx) = oneshot::channel();
        let (ingress_tx, ingress_rx) = companion_voice::ingress_channel(4);
        let (_commands_tx, commands_rx) = mpsc::channel(4);
        let thread = ControllerThread {
            config,
            turn: Arc::new(TurnStateMachine::new()),
            output: companion_core::shared_sink(companion_voice::NullSink),
            ingress_tx,
            ingress_rx,
            commands_rx,
            ready: Arc::new(AtomicBool::new(false)),
            local_audio: false,
            startup: tx,
        };
        let ready = Arc::clone(&thread.ready);
        thread.spawn().unwrap().join().unwrap();

        let report = rx.blocking_recv().unwrap();
        assert!(report.is_err());
        assert!(!ready.load(Ordering::SeqCst));
    }
}
