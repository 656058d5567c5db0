//! # Resonance
//!
//! An embedded knowledge-graph and vector-retrieval engine for a local
//! documentation corpus.
//!
//! Resonance ingests Markdown files into a single SQLite store holding
//! *hollow* nodes (metadata, content hash, and a unit-length embedding, but
//! no body text) and typed, confidence-weighted edges. Re-ingestion is
//! incremental: unchanged files are skipped by content hash, so a second run
//! over the same corpus makes no writes and no embedding calls.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────────┐   ┌──────────────┐
//! │  Validator  │──▶│  Pipeline                │──▶│   SQLite     │
//! │ (pre-flight)│   │ hash gate→embed→weave    │   │ nodes+edges  │
//! └─────────────┘   └──────────────────────────┘   └──────┬───────┘
//!                                                         │
//!                     ┌───────────────┬───────────────────┤
//!                     ▼               ▼                   ▼
//!               ┌──────────┐   ┌────────────┐      ┌────────────┐
//!               │  Vector  │   │   Graph    │      │   Survey   │
//!               │  search  │   │ analytics  │      │ (rg/grep)  │
//!               └──────────┘   └────────────┘      └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! resonance init                 # create the store
//! resonance validate             # pre-flight report only
//! resonance ingest               # validate, then ingest
//! resonance search "vector normalization"
//! resonance grep MAX_RETRIES
//! resonance graph overview
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Versioned schema migrations |
//! | [`models`] | Nodes, edges, and snapshots |
//! | [`store`] | Node and edge persistence |
//! | [`vector`] | Unit vectors and similarity search |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`graph`] | In-memory graph analytics |
//! | [`weaver`] | Lexicon-based edge extraction |
//! | [`timeline`] | Chronological chaining of dated nodes |
//! | [`tokenizer`] | Semantic token extraction |
//! | [`frontmatter`] | YAML frontmatter parsing |
//! | [`survey`] | Literal text search via `rg`/`grep` |
//! | [`discover`] | Corpus file discovery |
//! | [`validate`] | Pre-flight corpus validation |
//! | [`ingest`] | Ingestion pipeline |
//! | [`progress`] | Progress reporting |
//! | [`error`] | Error taxonomy |

pub mod config;
pub mod db;
pub mod discover;
pub mod embedding;
pub mod error;
pub mod frontmatter;
pub mod graph;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod store;
pub mod survey;
pub mod timeline;
pub mod tokenizer;
pub mod validate;
pub mod vector;
pub mod weaver;

pub use error::{Error, Result};
