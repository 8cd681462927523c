//! End-to-end pipeline tests with scripted capabilities: no network.

use std::io::{BufReader, Read, Write};
use std::sync::Arc;

use docchat::chat::{ChatLoop, ChatTarget};
use docchat::config::SitemapConfig;
use docchat::progress::NoProgress;
use docchat::store::fs::LocalFileStore;
use docchat_core::chunk::{ChunkingOptions, LengthUnit};
use docchat_core::models::DocumentSource;
use docchat_core::session::{GateState, Session, SessionOptions};
use docchat_core::store::ByteStore;
use docchat_core::synthesis::Strategy;
use docchat_core::testing::{FakeCapabilities, FakeEmbedder, ScriptedChatModel};
use docchat_core::CapabilityError;
use tempfile::TempDir;

const KEY: &str = "sk-integration-test";

fn site_options() -> SessionOptions {
    let mut options = SessionOptions::new(
        ChunkingOptions {
            chunk_size: 200,
            chunk_overlap: 20,
            separator: None,
            unit: LengthUnit::Chars,
        },
        Strategy::MapReduce,
    );
    options.top_k = 3;
    options
}

fn pages() -> Vec<DocumentSource> {
    vec![
        DocumentSource::new(
            "https://space.dev/moon",
            "The moon is about 384,400 km from Earth.",
        )
        .with_lastmod("2024-01-01"),
        DocumentSource::new("https://bakery.dev/bread", "Bread needs flour.")
            .with_lastmod("2024-02-01"),
        DocumentSource::new(
            "https://space.dev/tides",
            "Tides are caused by the moon.",
        )
        .with_lastmod("2023-05-01"),
    ]
}

fn moon_model() -> ScriptedChatModel {
    ScriptedChatModel::new(|messages| {
        let prompt = messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        if messages.len() == 1 {
            if prompt.contains("Context: The moon is about 384,400 km from Earth.") {
                Ok("Answer: The moon is about 384,400 km away.\nScore: 5".into())
            } else if prompt.contains("Context: Tides are caused by the moon.") {
                Ok("Answer: Close enough to cause tides.\nScore: 3".into())
            } else {
                Ok("Answer: I don't know\nScore: 0".into())
            }
        } else {
            Ok("The moon is about 384,400 km away.\n\nSource: https://space.dev/moon".into())
        }
    })
}

async fn fs_store(tmp: &TempDir) -> Arc<dyn ByteStore> {
    Arc::new(LocalFileStore::open(tmp.path().join("fake-embedding")).await.unwrap())
}

#[tokio::test]
async fn test_site_question_is_mapped_reduced_and_cited() {
    let tmp = TempDir::new().unwrap();
    let caps = Arc::new(FakeCapabilities::new(FakeEmbedder::new(256), moon_model()));
    let mut session = Session::new(site_options(), caps.clone(), fs_store(&tmp).await).unwrap();

    session.enter_credential(KEY).unwrap();
    let report = session.load_sources(&pages()).await.unwrap();
    assert_eq!(report.chunks, 3);
    assert_eq!(report.cache_misses, 3);

    let mut streamed = String::new();
    let mut sink = |fragment: &str| streamed.push_str(fragment);
    let answer = session
        .ask("How far away is the moon?", &mut sink)
        .await
        .unwrap();

    assert_eq!(streamed, answer.text);
    assert_eq!(answer.citations, vec!["https://space.dev/moon".to_string()]);
    assert_eq!(answer.candidates.len(), 3);
    assert_eq!(answer.candidates.iter().map(|c| c.score).max(), Some(5));
    assert_eq!(caps.model.calls(), 4);
    assert_eq!(session.messages().len(), 2);
    assert_eq!(session.memory().load().len(), 1);
}

#[tokio::test]
async fn test_embeddings_survive_a_new_session() {
    let tmp = TempDir::new().unwrap();
    {
        let caps = Arc::new(FakeCapabilities::new(FakeEmbedder::new(64), moon_model()));
        let mut session = Session::new(site_options(), caps, fs_store(&tmp).await).unwrap();
        session.enter_credential(KEY).unwrap();
        session.load_sources(&pages()).await.unwrap();
    }

    let caps = Arc::new(FakeCapabilities::new(FakeEmbedder::new(64), moon_model()));
    let mut session = Session::new(site_options(), caps.clone(), fs_store(&tmp).await).unwrap();
    session.enter_credential(KEY).unwrap();
    let report = session.load_sources(&pages()).await.unwrap();

    assert_eq!(report.cache_hits, 3);
    assert_eq!(report.cache_misses, 0);
    assert_eq!(caps.embedder.embedded_texts(), 0);
}

fn chat_loop(tmp: &TempDir, caps: Arc<FakeCapabilities>, store: Arc<dyn ByteStore>) -> ChatLoop {
    let path = tmp.path().join("moon.md");
    std::fs::write(&path, "The moon is about 384,400 km from Earth.\nIt has no air.\n").unwrap();
    let options = SessionOptions::new(
        ChunkingOptions {
            chunk_size: 100,
            chunk_overlap: 10,
            separator: Some("\n".into()),
            unit: LengthUnit::Chars,
        },
        Strategy::Stuff,
    );
    let session = Session::new(options, caps, store).unwrap();
    ChatLoop::new(
        session,
        ChatTarget::Document(path),
        SitemapConfig::default(),
        Box::new(NoProgress),
    )
}

#[tokio::test]
async fn test_chat_loop_answers_and_prints_history() {
    let tmp = TempDir::new().unwrap();
    let caps = Arc::new(FakeCapabilities::new(
        FakeEmbedder::new(64),
        ScriptedChatModel::replying("About 384,400 km."),
    ));
    let mut chat = chat_loop(&tmp, caps.clone(), fs_store(&tmp).await);

    let input = format!("{KEY}\nHow far away is the moon?\n/history\n/quit\n");
    let mut out = Vec::new();
    chat.run(input.as_bytes(), &mut out).await.unwrap();
    let out = String::from_utf8(out).unwrap();

    assert!(out.contains("Enter your OpenAI API key:"), "{out}");
    assert!(out.contains("Ready!"), "{out}");
    assert!(out.contains("About 384,400 km."), "{out}");
    assert!(out.contains("[you] How far away is the moon?"), "{out}");
    assert!(out.contains("[ai] About 384,400 km."), "{out}");
    assert_eq!(caps.model.calls(), 1);
}

#[tokio::test]
async fn test_chat_loop_malformed_key_makes_no_calls() {
    let tmp = TempDir::new().unwrap();
    let caps = Arc::new(FakeCapabilities::new(
        FakeEmbedder::new(64),
        ScriptedChatModel::replying("unused"),
    ));
    let mut chat = chat_loop(&tmp, caps.clone(), fs_store(&tmp).await);

    let mut out = Vec::new();
    let result = chat.run("not-a-key\n".as_bytes(), &mut out).await;
    let out = String::from_utf8(out).unwrap();

    assert!(result.is_err());
    assert!(out.contains("Please check your API key."), "{out}");
    assert_eq!(caps.capability_calls(), 0);
    assert_eq!(caps.builds(), 0);
}

#[tokio::test]
async fn test_chat_loop_rejected_key_prompts_again() {
    let tmp = TempDir::new().unwrap();
    let embedder = FakeEmbedder::new(64);
    embedder.fail_with(CapabilityError::Auth("Incorrect API key provided".into()));
    let caps = Arc::new(FakeCapabilities::new(
        embedder,
        ScriptedChatModel::replying("unused"),
    ));
    let mut chat = chat_loop(&tmp, caps.clone(), fs_store(&tmp).await);

    let mut out = Vec::new();
    let result = chat.run(format!("{KEY}\n").as_bytes(), &mut out).await;
    let out = String::from_utf8(out).unwrap();

    assert!(result.is_err());
    assert!(matches!(
        chat.session().gate().state(),
        GateState::Rejected { .. }
    ));
    assert_eq!(out.matches("Enter your OpenAI API key:").count(), 2, "{out}");
    assert!(out.contains("Please check your API key."), "{out}");
    assert_eq!(caps.model.calls(), 0);
}

#[tokio::test]
async fn test_chat_loop_clear_asks_for_key_again() {
    let tmp = TempDir::new().unwrap();
    let caps = Arc::new(FakeCapabilities::new(
        FakeEmbedder::new(64),
        ScriptedChatModel::replying("ok"),
    ));
    let mut chat = chat_loop(&tmp, caps, fs_store(&tmp).await);

    let input = format!("{KEY}\n/clear\n/quit\n");
    let mut out = Vec::new();
    chat.run(input.as_bytes(), &mut out).await.unwrap();
    let out = String::from_utf8(out).unwrap();

    assert!(out.contains("API key cleared."), "{out}");
    assert_eq!(out.matches("Enter your OpenAI API key:").count(), 2, "{out}");
    assert!(!chat.session().has_source());
}

/// Serves one line per `read` and runs `on_line` first, so a test can
/// change the fakes between two lines of the same chat.
struct LineByLine<F> {
    lines: std::vec::IntoIter<String>,
    on_line: F,
}

impl<F: FnMut(&str)> Read for LineByLine<F> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.lines.next() {
            Some(line) => {
                (self.on_line)(&line);
                let bytes = line.as_bytes();
                buf[..bytes.len()].copy_from_slice(bytes);
                Ok(bytes.len())
            }
            None => Ok(0),
        }
    }
}

#[tokio::test]
async fn test_chat_loop_retries_load_after_rate_limit() {
    let tmp = TempDir::new().unwrap();
    let embedder = FakeEmbedder::new(64);
    embedder.fail_with(CapabilityError::RateLimit("429 slow down".into()));
    let caps = Arc::new(FakeCapabilities::new(
        embedder,
        ScriptedChatModel::replying("About 384,400 km."),
    ));
    let mut chat = chat_loop(&tmp, caps.clone(), fs_store(&tmp).await);

    let fakes = caps.clone();
    let input = LineByLine {
        lines: vec![
            format!("{KEY}\n"),
            "How far away is the moon?\n".to_string(),
            "/quit\n".to_string(),
        ]
        .into_iter(),
        on_line: move |line: &str| {
            if line.starts_with("How far") {
                fakes.embedder.recover();
            }
        },
    };
    let mut out = Vec::new();
    chat.run(BufReader::new(input), &mut out).await.unwrap();
    let out = String::from_utf8(out).unwrap();

    assert!(out.contains("rate limited"), "{out}");
    assert!(out.contains("Ask again to retry loading"), "{out}");
    assert!(out.contains("Ready!"), "{out}");
    assert!(out.contains("About 384,400 km."), "{out}");
    assert!(chat.session().has_source());
    assert_eq!(caps.model.calls(), 1);
}

#[tokio::test]
async fn test_chat_loop_gives_up_when_load_never_succeeds() {
    let tmp = TempDir::new().unwrap();
    let embedder = FakeEmbedder::new(64);
    embedder.fail_with(CapabilityError::Transient("connection refused".into()));
    let caps = Arc::new(FakeCapabilities::new(
        embedder,
        ScriptedChatModel::replying("unused"),
    ));
    let mut chat = chat_loop(&tmp, caps.clone(), fs_store(&tmp).await);

    let mut out = Vec::new();
    let input = format!("{KEY}\nHow far away is the moon?\n");
    let err = chat.run(input.as_bytes(), &mut out).await.unwrap_err();
    let out = String::from_utf8(out).unwrap();

    assert!(err.to_string().contains("embedding failed"), "{err}");
    assert_eq!(out.matches("connection refused").count(), 2, "{out}");
    assert_eq!(caps.model.calls(), 0);
}

/// Accepts writes until the first `> ` prompt, then behaves like a closed
/// pipe.
#[derive(Default)]
struct ClosedAfterPrompt {
    closed: bool,
}

impl Write for ClosedAfterPrompt {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        if buf == b"> " {
            self.closed = true;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_chat_loop_stops_when_output_is_closed() {
    let tmp = TempDir::new().unwrap();
    let caps = Arc::new(FakeCapabilities::new(
        FakeEmbedder::new(64),
        ScriptedChatModel::replying("About 384,400 km."),
    ));
    let mut chat = chat_loop(&tmp, caps.clone(), fs_store(&tmp).await);
    let mut sink = Vec::new();
    chat.offer_credential(KEY, &mut sink).unwrap();

    let mut out = ClosedAfterPrompt::default();
    let input = "How far away is the moon?\nHow far away is the sun?\n";
    let err = chat.run(input.as_bytes(), &mut out).await.unwrap_err();

    let io = err.downcast_ref::<std::io::Error>().unwrap();
    assert_eq!(io.kind(), std::io::ErrorKind::BrokenPipe);
    assert_eq!(caps.model.calls(), 1);
}
