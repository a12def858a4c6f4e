//! Response pipeline behaviour against scripted generators and synthesizers.

mod common;

use common::*;
use companion_core::{
    shared_sink, ModelTierLadder, PipelineConfig, ResponseOutcome, ResponsePipeline, TurnState,
    TurnStateMachine, FALLBACK_GREETING,
};
use companion_voice::{ChannelSink, OutputEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Rig {
    pipeline: ResponsePipeline,
    output: mpsc::Receiver<OutputEvent>,
    state: Arc<TurnStateMachine>,
    ladder: Arc<ModelTierLadder>,
}

impl Rig {
    fn new(generator: ScriptedGenerator, tts: RecordingTts) -> Self {
        let state = Arc::new(TurnStateMachine::new());
        state.wake_detected().unwrap();
        state.start_thinking().unwrap();
        let ladder = Arc::new(ModelTierLadder::new(vec!["primary".into(), "backup".into()]));
        let (sink, output) = ChannelSink::channel(64);
        let pipeline = ResponsePipeline::new(
            Arc::new(generator),
            Arc::new(tts),
            shared_sink(sink),
            Arc::clone(&ladder),
            Arc::clone(&state),
            PipelineConfig::default(),
        );
        Self {
            pipeline,
            output,
            state,
            ladder,
        }
    }

    fn audio(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = self.output.try_recv() {
            if let OutputEvent::Audio(bytes) = event {
                out.push(String::from_utf8_lossy(&bytes).into_owned());
            }
        }
        out
    }

    async fn respond(&self) -> ResponseOutcome {
        self.pipeline.respond("prompt", &CancellationToken::new()).await
    }
}

fn scripted(failing: &[&str], scripts: Vec<Script>) -> ScriptedGenerator {
    let generator = ScriptedGenerator::failing(failing);
    for script in scripts {
        generator.script(script);
    }
    generator
}

#[tokio::test]
async fn test_failed_tier_falls_back_and_pins() {
    let mut rig = Rig::new(
        scripted(
            &["primary"],
            vec![Script::Tokens(vec!["The backup tier answers this one nicely."])],
        ),
        RecordingTts::default(),
    );

    let outcome = rig.respond().await;
    assert_eq!(
        outcome,
        ResponseOutcome::Spoken {
            text: "The backup tier answers this one nicely.".into(),
            tier: Some(1),
        }
    );
    assert_eq!(rig.ladder.cursor(), 1);
    assert_eq!(rig.state.state(), TurnState::Awake);
    assert_eq!(rig.audio(), vec!["The backup tier answers this one nicely."]);
}

#[tokio::test]
async fn test_exhausted_ladder_apologises() {
    let mut rig = Rig::new(
        ScriptedGenerator::failing(&["primary", "backup"]),
        RecordingTts::default(),
    );
    let apology = PipelineConfig::default().apology;

    let outcome = rig.respond().await;
    assert_eq!(
        outcome,
        ResponseOutcome::Spoken {
            text: apology.clone(),
            tier: None,
        }
    );
    assert_eq!(rig.audio(), vec![apology]);
    assert_eq!(rig.ladder.cursor(), 0);
    assert_eq!(rig.state.state(), TurnState::Awake);
}

#[tokio::test]
async fn test_reasoning_only_output_counts_as_failure() {
    let mut rig = Rig::new(
        scripted(
            &[],
            vec![
                Script::Tokens(vec!["<emotion_", "thought>just thinking</emotion_thought>"]),
                Script::Tokens(vec!["The second tier has something to say."]),
            ],
        ),
        RecordingTts::default(),
    );

    let outcome = rig.respond().await;
    assert_eq!(outcome.text(), Some("The second tier has something to say."));
    assert_eq!(rig.ladder.cursor(), 1);
    assert!(!rig.audio().iter().any(|a| a.contains("thinking")));
}

#[tokio::test]
async fn test_break_after_speech_keeps_what_was_said() {
    let mut rig = Rig::new(
        scripted(
            &[],
            vec![Script::Break(vec![
                "This sentence is spoken before the break. ",
                "and this",
            ])],
        ),
        RecordingTts::default(),
    );

    let outcome = rig.respond().await;
    assert_eq!(
        outcome,
        ResponseOutcome::Spoken {
            text: "This sentence is spoken before the break. and this".into(),
            tier: Some(0),
        }
    );
    assert_eq!(
        rig.audio(),
        vec!["This sentence is spoken before the break.", "and this"]
    );
    // an unfinished tier is not pinned
    assert_eq!(rig.ladder.cursor(), 0);
}

#[tokio::test]
async fn test_break_before_speech_moves_to_next_tier() {
    let mut rig = Rig::new(
        scripted(
            &[],
            vec![
                Script::Break(vec!["short"]),
                Script::Tokens(vec!["A complete answer from the backup tier."]),
            ],
        ),
        RecordingTts::default(),
    );

    let outcome = rig.respond().await;
    assert_eq!(outcome.text(), Some("A complete answer from the backup tier."));
    assert_eq!(rig.audio(), vec!["A complete answer from the backup tier."]);
}

#[tokio::test]
async fn test_cancelled_run_sends_nothing() {
    let mut rig = Rig::new(
        scripted(&[], vec![Script::Tokens(vec!["This would have been spoken aloud."])]),
        RecordingTts::default(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = rig.pipeline.respond("prompt", &cancel).await;
    assert_eq!(outcome, ResponseOutcome::Cancelled);
    assert!(rig.audio().is_empty());
    assert_eq!(rig.state.state(), TurnState::Thinking);
}

#[tokio::test]
async fn test_synthesis_failure_skips_only_that_chunk() {
    let mut rig = Rig::new(
        scripted(
            &[],
            vec![Script::Tokens(vec![
                "This first sentence is perfectly fine. ",
                "This second one is broken somehow. ",
                "Third sentence arrives safe and sound.",
            ])],
        ),
        RecordingTts::failing_on("broken"),
    );

    let outcome = rig.respond().await;
    assert!(outcome.text().unwrap().contains("broken"));
    assert_eq!(
        rig.audio(),
        vec![
            "This first sentence is perfectly fine.",
            "Third sentence arrives safe and sound.",
        ]
    );
}

#[tokio::test]
async fn test_single_shot_uses_fixed_fallback() {
    let mut rig = Rig::new(
        ScriptedGenerator::failing(&["primary", "backup"]),
        RecordingTts::default(),
    );

    let outcome = rig
        .pipeline
        .speak_generated("greet", FALLBACK_GREETING, &CancellationToken::new())
        .await;
    assert_eq!(
        outcome,
        ResponseOutcome::Spoken {
            text: FALLBACK_GREETING.into(),
            tier: None,
        }
    );
    assert_eq!(rig.audio(), vec![FALLBACK_GREETING]);
}
