//! Load progress reporting.
//!
//! Fetching a sitemap and embedding its pages can take a while, so the
//! loaders report what they are doing. Progress goes to **stderr** so stdout
//! stays the chat transcript.

use std::io::Write;

use docchat_core::session::LoadReport;

/// A single progress event while loading a source.
#[derive(Clone, Debug)]
pub enum LoadProgressEvent {
    /// Reading a sitemap document; the page total is not known yet.
    Discovering { sitemap: String },
    /// Page `n` of `total` fetched.
    Fetching { url: String, n: u64, total: u64 },
    /// Sources chunked, embedded, and indexed.
    Indexed(LoadReport),
}

/// Reports load progress. Implementations write to stderr (human or JSON).
pub trait LoadProgressReporter: Send + Sync {
    fn report(&self, event: LoadProgressEvent);
}

/// Human-friendly progress on stderr: "fetch  12 / 1,034 pages".
pub struct StderrProgress;

impl LoadProgressReporter for StderrProgress {
    fn report(&self, event: LoadProgressEvent) {
        let line = match &event {
            LoadProgressEvent::Discovering { sitemap } => {
                format!("sitemap {}  discovering...\n", sitemap)
            }
            LoadProgressEvent::Fetching { n, total, .. } => {
                format!(
                    "fetch  {} / {} pages\n",
                    format_number(*n),
                    format_number(*total)
                )
            }
            LoadProgressEvent::Indexed(report) if report.reused => {
                "index  unchanged source, reusing existing index\n".to_string()
            }
            LoadProgressEvent::Indexed(report) => format!(
                "index  {} chunks from {} sources ({} cached, {} embedded)\n",
                format_number(report.chunks as u64),
                format_number(report.sources as u64),
                format_number(report.cache_hits),
                format_number(report.cache_misses)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl LoadProgressReporter for JsonProgress {
    fn report(&self, event: LoadProgressEvent) {
        let obj = match &event {
            LoadProgressEvent::Discovering { sitemap } => serde_json::json!({
                "event": "progress",
                "phase": "discovering",
                "sitemap": sitemap,
            }),
            LoadProgressEvent::Fetching { url, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "fetching",
                "url": url,
                "n": n,
                "total": total,
            }),
            LoadProgressEvent::Indexed(report) => serde_json::json!({
                "event": "progress",
                "phase": "indexed",
                "report": report,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl LoadProgressReporter for NoProgress {
    fn report(&self, _event: LoadProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn LoadProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
