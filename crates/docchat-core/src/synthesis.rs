//! Answer synthesis: map-then-reduce and single-call strategies.
//!
//! # Map-then-reduce
//!
//! 1. **Map**: each retrieved chunk is sent to the model on its own with the
//!    question. The model answers from that chunk only (or says it doesn't
//!    know) and grades its answer with a `Score: N` line, 0 to 5. Calls fan
//!    out up to `map_concurrency` at a time and are collected in retrieval
//!    order before reduce starts.
//! 2. **Reduce**: one streaming call sees every candidate answer with its
//!    score, source, and date, plus prior conversation, and writes the final
//!    answer citing sources verbatim.
//!
//! # Stuff
//!
//! One streaming call with all retrieved chunk texts in the system prompt.
//! Used by document chat, where the whole context fits in one prompt.
//!
//! Fragments of the streamed call are pushed to a caller-supplied sink as
//! they arrive and accumulated into the returned [`SynthesizedAnswer`].

use std::cmp::Ordering;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{CapabilityError, PipelineError, Stage};
use crate::llm::{ChatMessage, ChatModel};
use crate::models::{CandidateAnswer, Chunk, ScoredChunk, SynthesizedAnswer};

/// Receives answer fragments as they are generated.
pub type FragmentSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Highest score the map stage may assign.
pub const MAX_SCORE: u8 = 5;

/// What to do when a single map call fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapFailurePolicy {
    /// Fail the whole question on the first failed call.
    #[default]
    Abort,
    /// Drop the failed chunk and continue. Authentication failures still
    /// abort, and a map stage with no surviving candidate is an error.
    Skip,
}

/// How to turn retrieved chunks into an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    MapReduce,
    Stuff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynthesisOptions {
    pub map_concurrency: usize,
    pub map_failure: MapFailurePolicy,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            map_concurrency: 4,
            map_failure: MapFailurePolicy::Abort,
        }
    }
}

/// Prompt for one map call.
pub fn map_messages(context: &str, question: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::human(format!(
        "Using ONLY the following context answer the user's question. \
If you can't just say you don't know, don't make anything up.

Then, give a score to the answer between 0 and 5.

If the answer answers the user question the score should be high, else it should be low.

Make sure to always include the answer's score even if it's 0.

Context: {context}

Examples:

Question: How far away is the moon?
Answer: The moon is 384,400 km away.
Score: 5

Question: How far away is the sun?
Answer: I don't know
Score: 0

Your turn!

Question: {question}"
    ))]
}

/// Prompt for the reduce call: system instructions with the formatted
/// candidates, then prior conversation, then the question.
pub fn reduce_messages(
    question: &str,
    candidates: &[CandidateAnswer],
    history: &[ChatMessage],
) -> Vec<ChatMessage> {
    let system = format!(
        "Use ONLY the following pre-existing answers to answer the user's question.

Use the answers that have the highest score (more helpful) and favor the most recent ones.

Cite sources and return the sources of the answers as they are, do not change them.

Answers: {}",
        format_candidates(candidates)
    );
    with_history(system, history, question)
}

/// Prompt for the single-call strategy.
pub fn stuff_messages(question: &str, chunks: &[Chunk], history: &[ChatMessage]) -> Vec<ChatMessage> {
    let context = chunks
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let system = format!(
        "Answer the question using ONLY the following context. \
If you don't know the answer just say you don't know. DON'T make anything up.

Context: {context}"
    );
    with_history(system, history, question)
}

fn with_history(system: String, history: &[ChatMessage], question: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system));
    messages.extend_from_slice(history);
    messages.push(ChatMessage::human(question));
    messages
}

/// Render candidates as the reduce stage sees them.
pub fn format_candidates(candidates: &[CandidateAnswer]) -> String {
    candidates
        .iter()
        .map(|c| {
            format!(
                "{}\nScore: {}\nSource: {}\nDate: {}",
                c.answer,
                c.score,
                c.source_id,
                c.lastmod.as_deref().unwrap_or("unknown")
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Sort by score descending, then by date descending (undated last).
/// Equal candidates keep their retrieval order.
pub fn order_candidates(mut candidates: Vec<CandidateAnswer>) -> Vec<CandidateAnswer> {
    candidates.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| match (&a.lastmod, &b.lastmod) {
                (Some(x), Some(y)) => y.cmp(x),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
    });
    candidates
}

/// Split raw map output into the answer text and its score.
///
/// The last line starting with `Score:` wins; the number is clamped to
/// 0..=5 and a missing or unreadable score counts as 0. A leading
/// `Answer:` label is stripped.
pub fn parse_scored_answer(raw: &str) -> (String, u8) {
    let lines: Vec<&str> = raw.lines().collect();
    let score_line = lines
        .iter()
        .rposition(|line| strip_label(line.trim(), "score:").is_some());

    let score = score_line
        .and_then(|i| strip_label(lines[i].trim(), "score:"))
        .map(parse_score)
        .unwrap_or(0);

    let body: Vec<&str> = lines
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != score_line)
        .map(|(_, line)| *line)
        .collect();
    let body = body.join("\n");
    let body = body.trim();
    let answer = strip_label(body, "answer:").unwrap_or(body).trim();

    (answer.to_string(), score)
}

fn strip_label<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    let head = text.get(..label.len())?;
    head.eq_ignore_ascii_case(label)
        .then(|| &text[label.len()..])
}

fn parse_score(rest: &str) -> u8 {
    let digits: String = rest
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits
        .parse::<u64>()
        .map(|n| n.min(u64::from(MAX_SCORE)) as u8)
        .unwrap_or(0)
}

fn candidate_from(raw: &str, chunk: &Chunk) -> CandidateAnswer {
    let (answer, score) = parse_scored_answer(raw);
    CandidateAnswer {
        answer,
        score,
        source_id: chunk.metadata.source.clone(),
        lastmod: chunk.metadata.lastmod.clone(),
    }
}

/// Sources that appear verbatim in `text`, ordered by first appearance.
pub fn extract_citations<'a>(text: &str, sources: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut found: Vec<(usize, &str)> = Vec::new();
    for source in sources {
        if source.is_empty() || found.iter().any(|(_, s)| *s == source) {
            continue;
        }
        if let Some(at) = text.find(source) {
            found.push((at, source));
        }
    }
    found.sort_by_key(|(at, _)| *at);
    found.into_iter().map(|(_, s)| s.to_string()).collect()
}

/// Runs either strategy against one [`ChatModel`].
pub struct AnswerSynthesizer {
    model: Arc<dyn ChatModel>,
    options: SynthesisOptions,
}

impl AnswerSynthesizer {
    pub fn new(model: Arc<dyn ChatModel>, options: SynthesisOptions) -> Self {
        Self { model, options }
    }

    pub fn model(&self) -> &Arc<dyn ChatModel> {
        &self.model
    }

    /// Answer `question` from `chunks` with the chosen strategy.
    pub async fn answer(
        &self,
        strategy: Strategy,
        question: &str,
        chunks: &[ScoredChunk],
        history: &[ChatMessage],
        sink: FragmentSink<'_>,
    ) -> Result<SynthesizedAnswer, PipelineError> {
        match strategy {
            Strategy::MapReduce => {
                let candidates = self.map_stage(question, chunks).await?;
                self.reduce_stage(question, candidates, history, sink).await
            }
            Strategy::Stuff => {
                let plain: Vec<Chunk> = chunks.iter().map(|s| s.chunk.clone()).collect();
                self.stuff(question, &plain, history, sink).await
            }
        }
    }

    /// One scored candidate per chunk, in chunk order.
    pub async fn map_stage(
        &self,
        question: &str,
        chunks: &[ScoredChunk],
    ) -> Result<Vec<CandidateAnswer>, PipelineError> {
        let model = self.model.as_ref();
        let calls = stream::iter(chunks.iter().map(|scored| {
            let messages = map_messages(&scored.chunk.text, question);
            async move {
                let raw = model.complete(&messages).await?;
                Ok::<_, CapabilityError>(candidate_from(&raw, &scored.chunk))
            }
        }))
        .buffered(self.options.map_concurrency.max(1));

        let candidates = match self.options.map_failure {
            MapFailurePolicy::Abort => calls
                .try_collect::<Vec<_>>()
                .await
                .map_err(|e| PipelineError::synthesis(Stage::Map, e))?,
            MapFailurePolicy::Skip => {
                let results: Vec<_> = calls.collect().await;
                let mut candidates = Vec::with_capacity(results.len());
                let mut last_error = None;
                for (scored, result) in chunks.iter().zip(results) {
                    match result {
                        Ok(candidate) => candidates.push(candidate),
                        Err(e) if e.is_auth() => {
                            return Err(PipelineError::synthesis(Stage::Map, e));
                        }
                        Err(e) => {
                            warn!(chunk = %scored.chunk.id, error = %e, "map call failed, skipping chunk");
                            last_error = Some(e);
                        }
                    }
                }
                if let (true, Some(e)) = (candidates.is_empty(), last_error) {
                    return Err(PipelineError::synthesis(Stage::Map, e));
                }
                candidates
            }
        };

        debug!(candidates = candidates.len(), "map stage done");
        Ok(candidates)
    }

    /// Stream the final answer built from `candidates`.
    pub async fn reduce_stage(
        &self,
        question: &str,
        candidates: Vec<CandidateAnswer>,
        history: &[ChatMessage],
        sink: FragmentSink<'_>,
    ) -> Result<SynthesizedAnswer, PipelineError> {
        let candidates = order_candidates(candidates);
        let messages = reduce_messages(question, &candidates, history);
        let text = self.stream_into(Stage::Reduce, &messages, sink).await?;
        let citations = extract_citations(&text, candidates.iter().map(|c| c.source_id.as_str()));
        Ok(SynthesizedAnswer {
            text,
            citations,
            candidates,
        })
    }

    /// Stream an answer from all `chunks` in one call.
    pub async fn stuff(
        &self,
        question: &str,
        chunks: &[Chunk],
        history: &[ChatMessage],
        sink: FragmentSink<'_>,
    ) -> Result<SynthesizedAnswer, PipelineError> {
        let messages = stuff_messages(question, chunks, history);
        let text = self.stream_into(Stage::Stuff, &messages, sink).await?;
        let citations = extract_citations(&text, chunks.iter().map(|c| c.metadata.source.as_str()));
        Ok(SynthesizedAnswer {
            text,
            citations,
            candidates: Vec::new(),
        })
    }

    async fn stream_into(
        &self,
        stage: Stage,
        messages: &[ChatMessage],
        sink: FragmentSink<'_>,
    ) -> Result<String, PipelineError> {
        let mut fragments = self
            .model
            .stream(messages)
            .await
            .map_err(|e| PipelineError::synthesis(stage, e))?;

        let mut text = String::new();
        while let Some(fragment) = fragments.next().await {
            let fragment = fragment.map_err(|e| PipelineError::synthesis(stage, e))?;
            sink(&fragment);
            text.push_str(&fragment);
        }
        Ok(text)
    }
}
