//! symdb: a persistent, incrementally-maintained symbol index for C/C++
//! source trees.
//!
//! The daemon parses every source file of a configured project with libclang,
//! extracts exported definitions and cross-translation-unit references,
//! stores them in an embedded per-project key-value database, and keeps the
//! index current through inotify watches plus periodic syncs. A local-socket
//! protocol answers four query kinds: where is a symbol defined, where is it
//! referenced, which symbols does a file define, which does it reference.
//!
//! # Architecture
//!
//! ```text
//! files on disk ──► inotify ──► ProjectIndexer ──► worker parse ──┐
//!                               (main thread)                     │
//!        ┌─────────────────────────◄──────────────────────────────┘
//!        ▼
//!   atomic commit ──► Store (per-project KVS)
//!
//!   symcli ──► socket session ──► main loop ──► Store ──► response
//! ```
//!
//! One main thread owns all mutable state; worker threads run exactly one
//! task kind (parse-and-hash) and report back by message.

pub mod client;
pub mod config;
pub mod error;
pub mod flags;
pub mod fs_utils;
pub mod project;
pub mod protocol;
pub mod schema;
pub mod server;
pub mod store;
pub mod translation_unit;
pub mod watcher;

pub use config::{Config, ProjectConfig};
pub use error::{Result, SymdbError};
pub use project::ProjectIndexer;
pub use schema::Location;
pub use server::Server;
pub use store::{OpenMode, Store, WriteBatch};
pub use translation_unit::ParsedUnit;
