//! Prompt text for the generation calls. The pipeline treats the result as opaque.

use crate::memory::{render_transcript, ConversationTurn};
use crate::session::SessionContext;
use chrono::{DateTime, Utc};

pub const FALLBACK_GREETING: &str = "Hello! How can I help you?";
pub const FALLBACK_FAREWELL: &str = "Goodbye!";

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    name: String,
    reasoning_start: String,
    reasoning_end: String,
}

impl PromptBuilder {
    pub fn new(
        name: impl Into<String>,
        reasoning_start: impl Into<String>,
        reasoning_end: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            reasoning_start: reasoning_start.into(),
            reasoning_end: reasoning_end.into(),
        }
    }

    fn persona(&self, ctx: &SessionContext) -> String {
        let mut out = format!(
            "You are {}, a voice companion. Your replies are spoken aloud, so use plain \
             sentences with no lists, markdown or emoji.\n\nPersonality: {}\n\nBackground: {}",
            self.name, ctx.personality, ctx.history
        );
        if !ctx.learnings.trim().is_empty() {
            out.push_str("\n\nWhat you have learned about the user: ");
            out.push_str(ctx.learnings.trim());
        }
        out
    }

    fn recent_sessions(&self, ctx: &SessionContext) -> Option<String> {
        let lines: Vec<String> = ctx
            .recent_sessions
            .iter()
            .filter_map(|g| {
                let first = g.first.as_ref()?;
                let last = g.last.as_ref().unwrap_or(first);
                Some(format!(
                    "- {}: opened with \"{}\", ended with \"{}\"",
                    g.started_at.format("%Y-%m-%d"),
                    first.content,
                    last.content
                ))
            })
            .collect();
        (!lines.is_empty()).then(|| lines.join("\n"))
    }

    /// Reply to the latest user utterance.
    pub fn response(&self, ctx: &SessionContext, memory: &[ConversationTurn], user_text: &str) -> String {
        let mut prompt = self.persona(ctx);
        if let Some(recent) = self.recent_sessions(ctx) {
            prompt.push_str("\n\nEarlier conversations:\n");
            prompt.push_str(&recent);
        }
        prompt.push_str(&format!(
            "\n\nIf you want to note how the user seems before answering, wrap that note in \
             {}{} and it will not be spoken.",
            self.reasoning_start, self.reasoning_end
        ));
        if !memory.is_empty() {
            prompt.push_str("\n\nConversation so far:\n");
            prompt.push_str(&render_transcript(memory.iter()));
        }
        prompt.push_str(&format!("\n\nUser: {}\nAssistant:", user_text.trim()));
        prompt
    }

    /// Opening line when a session starts.
    pub fn greeting(&self, ctx: &SessionContext, now: DateTime<Utc>) -> String {
        let mut prompt = self.persona(ctx);
        prompt.push_str("\n\nThe user just woke you up. Greet them in one or two short sentences.");
        match ctx.last_session_ended_at {
            Some(last) => prompt.push_str(&format!(
                " You last spoke {}.",
                describe_gap(now.signed_duration_since(last))
            )),
            None => prompt.push_str(" This is your very first conversation, so introduce yourself."),
        }
        if let Some(milestone) = milestone(ctx.total_sessions + 1) {
            prompt.push_str(&format!(" {}", milestone));
        }
        if let Some(recent) = self.recent_sessions(ctx) {
            prompt.push_str("\n\nEarlier conversations:\n");
            prompt.push_str(&recent);
        }
        prompt
    }

    /// Goodbye after a stop phrase.
    pub fn farewell(&self, ctx: &SessionContext, memory: &[ConversationTurn], stop_phrase: &str) -> String {
        let mut prompt = self.persona(ctx);
        if !memory.is_empty() {
            prompt.push_str("\n\nConversation so far:\n");
            prompt.push_str(&render_transcript(memory.iter()));
        }
        prompt.push_str(&format!(
            "\n\nThe user said \"{}\" to end the conversation. Say a warm goodbye in one short sentence.",
            stop_phrase.trim()
        ));
        prompt
    }

    /// Distil durable learnings from a finished session.
    pub fn reflection(&self, ctx: &SessionContext, turns: &[ConversationTurn]) -> String {
        format!(
            "You maintain long-term notes about the user of a voice companion.\n\n\
             Current notes:\n{}\n\nConversation that just ended:\n{}\n\n\
             Rewrite the notes to include anything new and lasting (preferences, people, plans). \
             Drop small talk. Reply with the notes only, at most five sentences.",
            if ctx.learnings.trim().is_empty() {
                "(none yet)"
            } else {
                ctx.learnings.trim()
            },
            render_transcript(turns.iter())
        )
    }
}

fn describe_gap(gap: chrono::Duration) -> String {
    let minutes = gap.num_minutes();
    let hours = gap.num_hours();
    let days = gap.num_days();
    if minutes < 5 {
        "just a moment ago".to_string()
    } else if hours < 1 {
        format!("{} minutes ago", minutes)
    } else if days < 1 {
        format!("{} hours ago", hours)
    } else if days == 1 {
        "yesterday".to_string()
    } else {
        format!("{} days ago", days)
    }
}

fn milestone(session_number: u64) -> Option<String> {
    match session_number {
        n if n >= 10 && n % 10 == 0 => Some(format!(
            "This is your {}th conversation together; you may mention it lightly.",
            n
        )),
        _ => None,
    }
}
