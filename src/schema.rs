//! Persisted data model for the per-project symbol database.
//!
//! Every value stored in the key-value store is a bincode-encoded struct from
//! this module, keyed by one of the builders below:
//!
//! | Key                      | Value                    |
//! |--------------------------|--------------------------|
//! | `file:info:<rel>`        | [`FileRecord`]           |
//! | `file:symdef:<rel>`      | [`FileDefinedSymbols`]   |
//! | `file:symref:<rel>`      | [`FileReferencedSymbols`]|
//! | `symdef:<usr>`           | [`SymbolDefinition`]     |
//! | `symref:<usr>`           | [`SymbolReference`]      |
//! | `<project_name>`         | [`ProjectInfo`]          |
//! | `home`                   | raw UTF-8 home path      |
//!
//! Paths inside records are always project-relative; queries join them back
//! onto the project home before leaving the daemon.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Result, SymdbError};

/// Key under which a project's home path is persisted, written before any
/// other record so the project can be rehydrated without configuration.
pub const HOME_KEY: &[u8] = b"home";

/// A line/column pair within a file.
pub type LineCol = (u32, u32);

/// A resolved source location. `path` is project-relative in persisted
/// records and absolute in query responses.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub path: String,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(path: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            path: path.into(),
            line,
            column,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.path.is_empty()
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.path, self.line, self.column)
    }
}

/// Skip-cache entry for one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub last_mtime: i64,
    pub content_md5: [u8; 16],
}

/// The set of USRs a file defines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDefinedSymbols {
    pub symbols: BTreeSet<String>,
}

/// One referenced symbol as seen from a single file: the target USR, the
/// module owning the target's definition, and every use site in this file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub usr: String,
    pub module: String,
    pub locations: BTreeSet<LineCol>,
}

/// Everything a file references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReferencedSymbols {
    pub items: Vec<FileReference>,
}

/// Canonical definition locations for one USR, at most one per module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolDefinition {
    pub locations: Vec<Location>,
}

/// Aggregated reference sites for one USR: module of the definition →
/// referencing file (project-relative) → use sites.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolReference {
    pub modules: BTreeMap<String, BTreeMap<String, BTreeSet<LineCol>>>,
}

/// Persisted snapshot of a project's source set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub rel_paths: Vec<String>,
}

pub fn file_info_key(rel_path: &Path) -> Vec<u8> {
    format!("file:info:{}", rel_path.display()).into_bytes()
}

pub fn file_symdef_key(rel_path: &Path) -> Vec<u8> {
    format!("file:symdef:{}", rel_path.display()).into_bytes()
}

pub fn file_symref_key(rel_path: &Path) -> Vec<u8> {
    format!("file:symref:{}", rel_path.display()).into_bytes()
}

pub fn symbol_def_key(usr: &str) -> Vec<u8> {
    format!("symdef:{usr}").into_bytes()
}

pub fn symbol_ref_key(usr: &str) -> Vec<u8> {
    format!("symref:{usr}").into_bytes()
}

pub fn project_key(name: &str) -> Vec<u8> {
    name.as_bytes().to_vec()
}

/// Serialize a record for storage.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| SymdbError::protocol(format!("encode failed: {e}")))
}

/// Deserialize a record loaded from storage.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| SymdbError::protocol(format!("decode failed: {e}")))
}
