//! Conversational memory with a token budget.
//!
//! Turns are kept oldest first. After every [`save_turn`] the oldest turns
//! are dropped until the estimated total fits `max_tokens`; the newest turn
//! always survives, truncated if it alone is over budget.
//!
//! In [`MemoryMode::Summary`] dropped turns are not forgotten outright: they
//! wait in a buffer until [`summarize_evicted`] folds them into a running
//! summary with one model call. The summary counts against the same budget
//! and gets whatever room the kept turns leave.
//!
//! [`save_turn`]: ConversationMemory::save_turn
//! [`summarize_evicted`]: ConversationMemory::summarize_evicted

use std::collections::VecDeque;

use serde::Deserialize;
use tracing::debug;

use crate::chunk::{estimate_tokens, CHARS_PER_TOKEN};
use crate::error::{PipelineError, Stage};
use crate::llm::{ChatMessage, ChatModel};
use crate::models::MemoryTurn;

/// Default token budget.
pub const DEFAULT_MAX_TOKENS: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    /// Drop evicted turns.
    #[default]
    Window,
    /// Fold evicted turns into a running summary.
    Summary,
}

#[derive(Debug, Clone)]
pub struct ConversationMemory {
    max_tokens: usize,
    mode: MemoryMode,
    turns: VecDeque<MemoryTurn>,
    summary: Option<String>,
    evicted: Vec<MemoryTurn>,
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOKENS)
    }
}

impl ConversationMemory {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            mode: MemoryMode::Window,
            turns: VecDeque::new(),
            summary: None,
            evicted: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: MemoryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn mode(&self) -> MemoryMode {
        self.mode
    }

    /// Append a turn and enforce the budget.
    pub fn save_turn(&mut self, input: impl Into<String>, output: impl Into<String>) {
        let mut turn = MemoryTurn {
            input: input.into(),
            output: output.into(),
        };
        fit_turn(&mut turn, self.max_tokens);
        self.turns.push_back(turn);

        while self.turns.len() > 1 && self.total_tokens() > self.max_tokens {
            if let Some(dropped) = self.turns.pop_front() {
                debug!(tokens = turn_tokens(&dropped), "memory turn evicted");
                if self.mode == MemoryMode::Summary {
                    self.evicted.push(dropped);
                }
            }
        }
        self.fit_summary();
    }

    /// Turns currently in memory, oldest first.
    pub fn load(&self) -> Vec<MemoryTurn> {
        self.turns.iter().cloned().collect()
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    /// Estimated tokens of the kept turns plus the summary.
    pub fn total_tokens(&self) -> usize {
        self.turns_tokens() + self.summary.as_deref().map_or(0, estimate_tokens)
    }

    fn turns_tokens(&self) -> usize {
        self.turns.iter().map(turn_tokens).sum()
    }

    /// Cut the summary down to the room left by the kept turns.
    fn fit_summary(&mut self) {
        let room = self.max_tokens.saturating_sub(self.turns_tokens());
        if let Some(summary) = &self.summary {
            if estimate_tokens(summary) > room {
                let cut = truncate_to_tokens(summary, room);
                self.summary = (!cut.is_empty()).then_some(cut);
            }
        }
    }

    /// Memory as chat history: the summary (if any) as a system message,
    /// then alternating human/ai messages.
    pub fn as_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() * 2 + 1);
        if let Some(summary) = &self.summary {
            messages.push(ChatMessage::system(format!(
                "Summary of the earlier conversation: {summary}"
            )));
        }
        for turn in &self.turns {
            messages.push(ChatMessage::human(turn.input.clone()));
            messages.push(ChatMessage::ai(turn.output.clone()));
        }
        messages
    }

    /// Whether evicted turns are waiting for [`summarize_evicted`](Self::summarize_evicted).
    pub fn has_evicted(&self) -> bool {
        !self.evicted.is_empty()
    }

    /// Fold buffered evicted turns into the running summary. No-op when
    /// nothing is buffered. On failure the buffer is kept for the next try.
    pub async fn summarize_evicted(&mut self, model: &dyn ChatModel) -> Result<(), PipelineError> {
        if self.evicted.is_empty() {
            return Ok(());
        }

        let lines = self
            .evicted
            .iter()
            .map(|t| format!("Human: {}\nAI: {}", t.input, t.output))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Progressively summarize the lines of conversation provided, \
adding onto the previous summary returning a new summary.

Current summary:
{}

New lines of conversation:
{lines}

New summary:",
            self.summary.as_deref().unwrap_or("")
        );

        let summary = model
            .complete(&[ChatMessage::human(prompt)])
            .await
            .map_err(|e| PipelineError::synthesis(Stage::Summarize, e))?;

        debug!(turns = self.evicted.len(), "evicted turns summarized");
        self.evicted.clear();
        self.summary = Some(summary.trim().to_string());
        self.fit_summary();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.summary = None;
        self.evicted.clear();
    }
}

fn turn_tokens(turn: &MemoryTurn) -> usize {
    estimate_tokens(&turn.input) + estimate_tokens(&turn.output)
}

/// Shrink a lone turn so it fits `max_tokens`: the output gives way first.
fn fit_turn(turn: &mut MemoryTurn, max_tokens: usize) {
    if turn_tokens(turn) <= max_tokens {
        return;
    }
    let input_tokens = estimate_tokens(&turn.input);
    if input_tokens > max_tokens {
        turn.input = truncate_to_tokens(&turn.input, max_tokens);
        turn.output.clear();
    } else {
        turn.output = truncate_to_tokens(&turn.output, max_tokens - input_tokens);
    }
}

fn truncate_to_tokens(text: &str, tokens: usize) -> String {
    text.chars().take(tokens * CHARS_PER_TOKEN).collect()
}
