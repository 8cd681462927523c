//! # docchat core
//!
//! The retrieval-augmented generation pipeline behind `docchat`: chunking,
//! content-addressed embedding caching, vector retrieval, map-then-reduce
//! answer synthesis, conversational memory, and the session that ties them
//! together behind a credential gate.
//!
//! This crate does no network or filesystem I/O. Models, embedders, and
//! byte stores come in through the [`llm::ChatModel`],
//! [`embedding::Embedder`], and [`store::ByteStore`] traits; the `docchat`
//! app crate provides the real implementations.
//!
//! ```text
//! DocumentSource -> chunk -> cache (embed) -> index
//!                                              |
//! question -> index::Retriever -> synthesis (map -> reduce) -> answer
//!                                   ^
//!                                memory
//! ```

pub mod cache;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod index;
pub mod llm;
pub mod memory;
pub mod models;
pub mod session;
pub mod store;
pub mod synthesis;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{CapabilityError, PipelineError};
