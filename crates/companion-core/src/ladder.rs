//! Ranked model tiers with sticky fallback.
//!
//! Once a lower tier has had to answer, the cursor stays there for the rest of
//! the session. It only moves back to the primary tier on [`ModelTierLadder::reset`],
//! which the controller calls at session boundaries.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

#[derive(Debug)]
pub struct ModelTierLadder {
    models: Vec<String>,
    cursor: AtomicUsize,
}

impl ModelTierLadder {
    pub fn new(models: Vec<String>) -> Self {
        Self {
            models,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn model(&self, tier: usize) -> Option<&str> {
        self.models.get(tier).map(String::as_str)
    }

    /// Tiers still eligible this session, best first.
    pub fn remaining(&self) -> impl Iterator<Item = (usize, &str)> {
        self.models
            .iter()
            .enumerate()
            .skip(self.cursor())
            .map(|(i, m)| (i, m.as_str()))
    }

    /// Record that `tier` answered. The cursor never moves backwards.
    pub fn pin(&self, tier: usize) {
        let tier = tier.min(self.models.len().saturating_sub(1));
        let previous = self.cursor.fetch_max(tier, Ordering::SeqCst);
        if tier > previous {
            info!(
                target: "companion::ladder",
                "Falling back to tier {} ({}) for the rest of the session",
                tier,
                self.models[tier]
            );
        }
    }

    pub fn reset(&self) {
        self.cursor.store(0, Ordering::SeqCst);
    }
}
