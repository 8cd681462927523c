//! Terminal chat loop shared by `docchat doc` and `docchat site`.
//!
//! The loop asks for a credential until the gate is ready, loads the
//! source once a usable credential is in place, then answers questions,
//! printing each answer as it streams in. Slash commands:
//!
//! | Command | Effect |
//! |---------|--------|
//! | `/key <value>` | enter a new API key |
//! | `/clear` | forget the API key |
//! | `/history` | print the conversation so far |
//! | `/quit` | leave |
//!
//! Input and output are generic so tests can drive the loop with byte
//! buffers.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Result};
use docchat_core::models::{DocumentSource, Role};
use docchat_core::session::{GateState, Session};
use docchat_core::PipelineError;
use tracing::{debug, warn};

use crate::config::SitemapConfig;
use crate::loader::file::load_file;
use crate::loader::sitemap::SitemapLoader;
use crate::progress::{LoadProgressEvent, LoadProgressReporter};

/// What the user asked to chat about.
#[derive(Debug, Clone)]
pub enum ChatTarget {
    Document(PathBuf),
    Sitemap(String),
}

impl ChatTarget {
    pub fn describe(&self) -> String {
        match self {
            ChatTarget::Document(path) => path.display().to_string(),
            ChatTarget::Sitemap(url) => url.clone(),
        }
    }
}

/// One line of user input, classified.
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Key(&'a str),
    Clear,
    History,
    Quit,
    Question(&'a str),
    Empty,
}

pub fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    match line.split_once(char::is_whitespace) {
        Some(("/key", rest)) => Command::Key(rest.trim()),
        _ => match line {
            "/key" => Command::Key(""),
            "/clear" => Command::Clear,
            "/history" => Command::History,
            "/quit" | "/exit" => Command::Quit,
            question => Command::Question(question),
        },
    }
}

pub struct ChatLoop {
    session: Session,
    target: ChatTarget,
    sitemap: SitemapConfig,
    progress: Box<dyn LoadProgressReporter>,
    /// Raw documents, kept so a new credential or a retried load re-indexes
    /// without re-reading the file or re-crawling the site.
    documents: Option<Vec<DocumentSource>>,
    /// Last recoverable load failure. The next question retries the load.
    load_error: Option<PipelineError>,
}

impl ChatLoop {
    pub fn new(
        session: Session,
        target: ChatTarget,
        sitemap: SitemapConfig,
        progress: Box<dyn LoadProgressReporter>,
    ) -> Self {
        Self {
            session,
            target,
            sitemap,
            progress,
            documents: None,
            load_error: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Apply the credential given on the command line or in the
    /// environment, reporting a bad one like an interactive entry.
    pub fn offer_credential<W: Write>(&mut self, raw: &str, out: &mut W) -> Result<()> {
        if let Err(e) = self.session.enter_credential(raw) {
            writeln!(out, "{}", e.user_message())?;
        }
        Ok(())
    }

    /// Run until `/quit` or end of input. Errors that make continuing
    /// pointless (unreadable source, bad settings, no credential or no
    /// loaded source at end of input) are returned; everything else is
    /// printed and the loop goes on.
    pub async fn run<R: BufRead, W: Write + Send>(&mut self, mut input: R, mut out: W) -> Result<()> {
        let mut line = String::new();
        loop {
            if !self.session.gate().is_ready() {
                if let GateState::Rejected { reason } = self.session.gate().state() {
                    writeln!(out, "{}", PipelineError::Auth(reason.clone()).user_message())?;
                }
                write!(out, "Enter your OpenAI API key: ")?;
                out.flush()?;
                line.clear();
                if input.read_line(&mut line)? == 0 {
                    writeln!(out)?;
                    bail!("no usable API key was provided");
                }
                match parse_command(&line) {
                    Command::Quit => return Ok(()),
                    Command::Empty => continue,
                    Command::Key(key) | Command::Question(key) => {
                        self.load_error = None;
                        if let Err(e) = self.session.enter_credential(key) {
                            writeln!(out, "{}", e.user_message())?;
                        }
                    }
                    Command::Clear | Command::History => {}
                }
                continue;
            }

            if !self.session.has_source() && self.load_error.is_none() {
                self.try_load(&mut out).await?;
                if !self.session.gate().is_ready() {
                    continue;
                }
            }

            write!(out, "> ")?;
            out.flush()?;
            line.clear();
            if input.read_line(&mut line)? == 0 {
                writeln!(out)?;
                if let Some(e) = self.load_error.take() {
                    bail!("{}", e.user_message());
                }
                return Ok(());
            }

            match parse_command(&line) {
                Command::Empty => {}
                Command::Quit => return Ok(()),
                Command::Clear => {
                    self.session.clear_credential();
                    writeln!(out, "API key cleared.")?;
                }
                Command::Key(key) => {
                    self.load_error = None;
                    if let Err(e) = self.session.enter_credential(key) {
                        writeln!(out, "{}", e.user_message())?;
                    }
                }
                Command::History => self.print_history(&mut out)?,
                Command::Question(question) => {
                    if !self.session.has_source() {
                        self.try_load(&mut out).await?;
                        if !self.session.has_source() {
                            continue;
                        }
                    }
                    self.answer(question, &mut out).await?
                }
            }
        }
    }

    /// Load the source and say how it went. Recoverable failures are kept
    /// in `load_error` so the next question retries; an auth failure
    /// leaves the gate rejected for the credential prompt. Anything else
    /// ends the chat.
    async fn try_load<W: Write>(&mut self, out: &mut W) -> Result<()> {
        match self.load().await {
            Ok(()) => {
                self.load_error = None;
                writeln!(
                    out,
                    "Ready! Ask anything about {} (/quit to leave).",
                    self.target.describe()
                )?;
            }
            Err(e) if e.is_auth() => self.load_error = None,
            Err(e) if !e.is_recoverable() || matches!(e, PipelineError::Load(_)) => {
                bail!("{}", e.user_message())
            }
            Err(e) => {
                warn!(error = %e, "loading the source failed");
                writeln!(out, "{}", e.user_message())?;
                writeln!(out, "Ask again to retry loading {}.", self.target.describe())?;
                self.load_error = Some(e);
            }
        }
        Ok(())
    }

    async fn answer<W: Write + Send>(&mut self, question: &str, out: &mut W) -> Result<()> {
        let mut write_error: Option<std::io::Error> = None;
        let mut sink = |fragment: &str| {
            if write_error.is_some() {
                return;
            }
            if let Err(e) = out.write_all(fragment.as_bytes()) {
                write_error = Some(e);
            } else if let Err(e) = out.flush() {
                write_error = Some(e);
            }
        };
        let result = self.session.ask(question, &mut sink).await;
        if let Some(e) = write_error {
            return Err(e.into());
        }
        writeln!(out)?;
        match result {
            Ok(answer) => {
                debug!(citations = ?answer.citations, "answered");
            }
            Err(e) => {
                // Auth failures are announced on the next credential prompt.
                if !e.is_auth() {
                    writeln!(out, "{}", e.user_message())?;
                }
            }
        }
        Ok(())
    }

    fn print_history<W: Write>(&self, out: &mut W) -> Result<()> {
        for message in self.session.messages() {
            let who = match message.role {
                Role::Human => "you",
                Role::Ai => "ai",
            };
            writeln!(out, "[{who}] {}", message.text)?;
        }
        Ok(())
    }

    async fn load(&mut self) -> Result<(), PipelineError> {
        let documents = match self.documents.take() {
            Some(documents) => documents,
            None => match &self.target {
                ChatTarget::Document(path) => vec![load_file(path)?],
                ChatTarget::Sitemap(url) => {
                    SitemapLoader::new(&self.sitemap)?
                        .load(url, self.progress.as_ref())
                        .await?
                }
            },
        };
        let result = self.session.load_sources(&documents).await;
        self.documents = Some(documents);
        let report = result?;
        self.progress.report(LoadProgressEvent::Indexed(report));
        Ok(())
    }
}
