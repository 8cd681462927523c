//! # docchat CLI
//!
//! Chat with a document or a website from the terminal.
//!
//! ## Usage
//!
//! ```bash
//! docchat [--config ./config/docchat.toml] doc <FILE>
//! docchat [--config ./config/docchat.toml] site <SITEMAP_URL>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat doc <FILE>` | Answer questions about a `.txt`, `.md`, `.pdf` or `.docx` file |
//! | `docchat site <URL>` | Answer questions about the pages listed in a sitemap |
//!
//! The API key comes from `--api-key`, then `OPENAI_API_KEY`, then an
//! interactive prompt.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use docchat::chat::{ChatLoop, ChatTarget};
use docchat::config::{self, ChunkingConfig, Config};
use docchat::loader::sitemap::validate_sitemap_url;
use docchat::progress::ProgressMode;
use docchat::providers::OpenAiCapabilities;
use docchat::{logging, store};
use docchat_core::session::{CredentialGate, Session, SessionOptions};
use docchat_core::synthesis::Strategy;

/// docchat: ask questions about a document or a website.
#[derive(Parser)]
#[command(
    name = "docchat",
    about = "Chat with a document or a website, grounded in its content",
    version,
    long_about = "docchat chunks and embeds a document or every page of a sitemap, then answers \
    questions by retrieving the most relevant chunks and asking a language model about them."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/docchat.toml` when it exists, built-in
    /// defaults otherwise.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// OpenAI API key. Falls back to `OPENAI_API_KEY`, then a prompt.
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Progress output on stderr. Defaults to `human` on a terminal, `off`
    /// otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    /// More log output (-v info, -vv debug, -vvv trace). `RUST_LOG` wins.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with a local file.
    ///
    /// Retrieved chunks are handed to the model in a single call.
    Doc {
        /// `.txt`, `.md`, `.pdf` or `.docx` file.
        file: PathBuf,
    },

    /// Chat with a website through its sitemap.
    ///
    /// Each retrieved chunk is answered and scored separately, then the
    /// best answers are combined, citing their pages.
    Site {
        /// Sitemap URL, e.g. `https://developers.cloudflare.com/sitemap.xml`.
        url: String,
    },
}

fn session_options(chunking: &ChunkingConfig, strategy: Strategy, cfg: &Config) -> SessionOptions {
    let mut options = SessionOptions::new(chunking.options(), strategy);
    options.top_k = cfg.retrieval.top_k;
    options.synthesis = cfg.synthesis.options();
    options.memory_max_tokens = cfg.memory.max_token_limit;
    options.memory_mode = cfg.memory.mode;
    options.embed_batch_size = cfg.embedding.batch_size;
    options
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load_config_or_default(cli.config.as_deref())?;

    let (target, options) = match cli.command {
        Commands::Doc { file } => (
            ChatTarget::Document(file),
            session_options(&cfg.chunking, Strategy::Stuff, &cfg),
        ),
        Commands::Site { url } => {
            validate_sitemap_url(&url)?;
            (
                ChatTarget::Sitemap(url),
                session_options(&cfg.site_chunking, Strategy::MapReduce, &cfg),
            )
        }
    };

    let store = store::open_store(&cfg.cache, &cfg.embedding.model).await?;
    let factory = Arc::new(OpenAiCapabilities::new(
        cfg.embedding.clone(),
        cfg.llm.clone(),
    ));
    let gate = CredentialGate::with_pattern(&cfg.credential.pattern)?;
    let session = Session::new(options, factory, store)?.with_gate(gate);

    let progress = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();
    let mut chat = ChatLoop::new(session, target, cfg.sitemap.clone(), progress);

    let mut stdout = std::io::stdout();
    if let Some(key) = cli
        .api_key
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    {
        chat.offer_credential(&key, &mut stdout)?;
    }

    chat.run(std::io::stdin().lock(), stdout).await
}
