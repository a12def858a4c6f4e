//! # companion-core
//!
//! Turn orchestration for a voice companion.
//!
//! ```text
//!            ┌────────────────────────── SessionController ───────────────────────────┐
//!  audio ──▶ │ AudioFrameRouter ─▶ SpeechSegmenter ─▶ Utterance                       │
//!            │        │                                   │                           │
//!            │        └─ wake ─▶ TurnStateMachine ◀───────┤                           │
//!            │                        ▲                   ▼                           │
//!            │                        └──────── ResponsePipeline (one task) ──────────┼─▶ OutputSink
//!            │                                  tiers ▸ reasoning ▸ sentences ▸ TTS   │
//!            └───────────────────────── Journal ─▶ ConversationStore ─────────────────┘
//! ```
//!
//! - [`state`]: the closed Idle/Awake/Thinking/Speaking transition table.
//! - [`pipeline`]: streaming generation through the [`ModelTierLadder`],
//!   reasoning stripping, sentence chunking, synthesis and cancellable delivery.
//! - [`controller`]: the event loop, barge-in, timeouts and session lifecycle.
//! - [`store`] and [`journal`]: sled-backed persistence off the hot path.
//! - [`config`]: layered configuration (defaults, TOML, `COMPANION_*` env).

pub mod config;
pub mod controller;
pub mod error;
pub mod journal;
pub mod ladder;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod prompt;
pub mod session;
pub mod state;
pub mod store;

pub use config::{
    AudioConfig, CompanionConfig, DeliberationConfig, GatewayConfig, LlmConfig, SessionConfig,
    StoreConfig,
};
pub use controller::{Capabilities, Command, EndReason, SessionController, StartResult};
pub use error::{CoreError, CoreResult};
pub use journal::{Journal, JournalOp};
pub use ladder::ModelTierLadder;
pub use llm::{OpenRouterGenerator, TextGenerator, TokenStream};
pub use memory::{ConversationMemory, ConversationTurn, Role};
pub use pipeline::{
    shared_sink, PipelineConfig, ReasoningFilter, ResponseOutcome, ResponsePipeline,
    SentenceChunker, SharedSink,
};
pub use prompt::{PromptBuilder, FALLBACK_FAREWELL, FALLBACK_GREETING};
pub use session::{SessionContext, SessionHandle};
pub use state::{Transition, TurnEvent, TurnState, TurnStateMachine};
pub use store::{AgentConfig, ConversationStore, MemoryStore, SessionGist, SledStore, StoredMessage};
