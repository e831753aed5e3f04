// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parser records.
//!
//! A parser record is the persisted, versioned unit distributed to every
//! process: identity, declared dependencies (`provide`), the plugin manifest
//! in `code`, the compressed authored `source` and a content `hash` derived
//! from identity, sorted dependencies and code.

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Placeholder returned in place of source text when it is not needed back.
pub const SOURCE_PLACEHOLDER: &str = "<omitted>";

const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 9;
const BROTLI_WINDOW: u32 = 22;

/// Who may invoke a parser through the public API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Only authenticated operators.
    #[default]
    Private,
    /// Anyone, without limits.
    Public,
    /// Anyone, limited to `requests` invocations per `window_seconds`.
    RateLimited {
        /// Allowed invocations per window.
        requests: u32,
        /// Window length in seconds.
        window_seconds: u32,
    },
}

impl Visibility {
    /// Column representation: `(visibility, rate_requests, rate_window_seconds)`.
    pub fn to_columns(self) -> (&'static str, Option<i32>, Option<i32>) {
        match self {
            Visibility::Private => ("private", None, None),
            Visibility::Public => ("public", None, None),
            Visibility::RateLimited {
                requests,
                window_seconds,
            } => (
                "rate_limited",
                Some(requests.min(i32::MAX as u32) as i32),
                Some(window_seconds.min(i32::MAX as u32) as i32),
            ),
        }
    }

    /// Rebuild from the column representation. Unknown values fall back to private.
    pub fn from_columns(kind: &str, requests: Option<i32>, window_seconds: Option<i32>) -> Self {
        match (kind, requests, window_seconds) {
            ("public", _, _) => Visibility::Public,
            ("rate_limited", Some(requests), Some(window_seconds)) => Visibility::RateLimited {
                requests: requests.max(0) as u32,
                window_seconds: window_seconds.max(0) as u32,
            },
            _ => Visibility::Private,
        }
    }
}

/// A stored parser.
#[derive(Debug, Clone, PartialEq)]
pub struct ParserRecord {
    /// Kind-namespaced unique identity, e.g. `importers/foo`
    pub identity: String,
    /// Dependency identities, in declaration order, without duplicates
    pub provide: Vec<String>,
    /// External state the parser touches (informational)
    pub storage_keys: Vec<String>,
    /// Excluded from scheduled group runs when true
    pub disabled: bool,
    /// API visibility
    pub visibility: Visibility,
    /// Runs in the continuous runner instead of scheduled groups
    pub continuous: bool,
    /// Plugin manifest (JSON)
    pub code: String,
    /// Brotli-compressed authored source
    pub source: Vec<u8>,
    /// Content hash of identity, sorted provide and code
    pub hash: String,
    /// Last write time
    pub updated_at: DateTime<Utc>,
}

impl ParserRecord {
    /// Kind prefix of this parser's identity.
    pub fn kind(&self) -> Option<&str> {
        kind_of(&self.identity)
    }
}

/// Kind prefix of an identity (`importers/foo` -> `importers`).
pub fn kind_of(identity: &str) -> Option<&str> {
    match identity.split_once('/') {
        Some((kind, rest)) if !kind.is_empty() && !rest.is_empty() => Some(kind),
        _ => None,
    }
}

/// Compute the content hash of a parser.
///
/// `provide` is sorted and deduplicated first so declaration order does not
/// affect the digest. Fields are separated so that no two distinct inputs
/// concatenate to the same byte string.
pub fn compute_hash(identity: &str, provide: &[String], code: &str) -> String {
    let mut deps: Vec<&str> = provide.iter().map(String::as_str).collect();
    deps.sort_unstable();
    deps.dedup();

    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update([0u8]);
    for (i, dep) in deps.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(dep.as_bytes());
    }
    hasher.update([0u8]);
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deduplicate dependency identities keeping the first occurrence.
pub fn normalize_provide(provide: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    provide
        .into_iter()
        .filter(|dep| !dep.is_empty() && seen.insert(dep.clone()))
        .collect()
}

/// Brotli-compress source text.
pub fn compress_source(text: &str) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut writer =
            brotli::CompressorWriter::new(&mut out, BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_WINDOW);
        writer.write_all(text.as_bytes())?;
        writer.flush()?;
    }
    Ok(out)
}

/// Decompress source text produced by [`compress_source`].
pub fn decompress_source(bytes: &[u8]) -> std::io::Result<String> {
    if bytes.is_empty() {
        return Ok(String::new());
    }
    let mut reader = brotli::Decompressor::new(bytes, BROTLI_BUFFER);
    let mut text = String::new();
    reader.read_to_string(&mut text)?;
    Ok(text)
}

/// A parser as uploaded by an authoring tool.
///
/// Any `hash` the client sends is ignored; it is always recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialParserRecord {
    /// Kind-namespaced identity
    pub identity: String,
    /// Dependency identities
    #[serde(default)]
    pub provide: Vec<String>,
    /// External state tags
    #[serde(default, rename = "storageKeys", alias = "storage_keys")]
    pub storage_keys: Vec<String>,
    /// Disabled flag
    #[serde(default)]
    pub disabled: bool,
    /// API visibility
    #[serde(default)]
    pub visibility: Visibility,
    /// Continuous flag
    #[serde(default)]
    pub continuous: bool,
    /// Plugin manifest
    pub code: String,
    /// Authored source text; falls back to `code` when absent
    #[serde(default)]
    pub source: Option<String>,
}

impl PartialParserRecord {
    /// Turn an upload into a storable record with a server-computed hash.
    pub fn into_record(self) -> std::io::Result<ParserRecord> {
        let provide = normalize_provide(self.provide);
        let hash = compute_hash(&self.identity, &provide, &self.code);
        let source_text = self.source.as_deref().unwrap_or(&self.code);
        let source = compress_source(source_text)?;

        Ok(ParserRecord {
            identity: self.identity,
            provide,
            storage_keys: self.storage_keys,
            disabled: self.disabled,
            visibility: self.visibility,
            continuous: self.continuous,
            code: self.code,
            source,
            hash,
            updated_at: Utc::now(),
        })
    }
}

/// Wire form of a parser with its source as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserDocument {
    /// Identity
    pub identity: String,
    /// Dependency identities
    pub provide: Vec<String>,
    /// External state tags
    #[serde(rename = "storageKeys")]
    pub storage_keys: Vec<String>,
    /// Disabled flag
    pub disabled: bool,
    /// API visibility
    pub visibility: Visibility,
    /// Continuous flag
    pub continuous: bool,
    /// Plugin manifest
    pub code: String,
    /// Source text (or a placeholder)
    pub source: String,
    /// Content hash
    pub hash: String,
    /// Last write time
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl ParserDocument {
    /// Build a document carrying the given source text.
    pub fn from_record(record: &ParserRecord, source: String) -> Self {
        Self {
            identity: record.identity.clone(),
            provide: record.provide.clone(),
            storage_keys: record.storage_keys.clone(),
            disabled: record.disabled,
            visibility: record.visibility,
            continuous: record.continuous,
            code: record.code.clone(),
            source,
            hash: record.hash.clone(),
            updated_at: record.updated_at,
        }
    }
}
