//! # docchat
//!
//! Chat over documents: load a file or a website, ask questions, get
//! answers grounded in (and citing) the loaded text.
//!
//! The pipeline itself lives in `docchat-core`; this crate supplies the
//! concrete collaborators and the terminal front end.
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Loaders   │──▶│ docchat-core │◀─▶│  OpenAI API  │
//! │ file/site  │   │   Session    │   │ chat + embed │
//! └────────────┘   └──────┬───────┘   └──────────────┘
//!                         │
//!               ┌─────────┴─────────┐
//!               ▼                   ▼
//!         ┌──────────┐       ┌────────────┐
//!         │   REPL   │       │ byte store │
//!         │  (chat)  │       │ fs/sqlite  │
//!         └──────────┘       └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`http`] | Retry/backoff and status classification for API calls |
//! | [`embedding`] | OpenAI embeddings client |
//! | [`llm`] | OpenAI chat client with SSE streaming |
//! | [`extract`] | PDF and DOCX text extraction |
//! | [`loader`] | File and sitemap loaders |
//! | [`store`] | Filesystem and SQLite byte stores |
//! | [`providers`] | Credential → client factory |
//! | [`progress`] | Load progress on stderr |
//! | [`logging`] | Tracing subscriber setup |
//! | [`chat`] | Terminal chat loop |

pub mod chat;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod http;
pub mod llm;
pub mod loader;
pub mod logging;
pub mod progress;
pub mod providers;
pub mod store;
