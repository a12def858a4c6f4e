//! Error taxonomy for the orchestrator.
//!
//! Only `Config` is fatal, and only at startup. Everything else is caught at the
//! component that called the failing capability and turned into a fallback.

use crate::state::{TurnEvent, TurnState};
use companion_voice::VoiceError;
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Missing or malformed configuration. Lists every problem at once.
    #[error("configuration error: {0}")]
    Config(String),

    /// A text-generation call failed (one tier of the ladder).
    #[error("generation failed ({model}): {message}")]
    Generation { model: String, message: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid transition: {event:?} while {from:?}")]
    InvalidTransition { from: TurnState, event: TurnEvent },

    #[error(transparent)]
    Voice(#[from] VoiceError),
}

impl CoreError {
    pub fn generation(model: impl Into<String>, message: impl std::fmt::Display) -> Self {
        CoreError::Generation {
            model: model.into(),
            message: message.to_string(),
        }
    }
}

impl From<sled::Error> for CoreError {
    fn from(e: sled::Error) -> Self {
        CoreError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Persistence(e.to_string())
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(e: config::ConfigError) -> Self {
        CoreError::Config(e.to_string())
    }
}
