//! Credential registry
//!
//! Maps each client token to its upstream authority and a rotating list of
//! real credentials. The table's shape is fixed at startup; the only thing
//! that changes afterwards is each entry's rotation cursor.

use crate::config::{CredentialRecord, StartPolicy};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A resolved route: where to forward and which credentials to rotate through
#[derive(Debug)]
pub struct RegistryEntry {
    /// Upstream origin without a trailing slash
    authority: String,

    /// Credentials in configured order, never empty
    credentials: Vec<String>,

    /// Index of the credential handed out next
    cursor: AtomicUsize,
}

impl RegistryEntry {
    fn new(authority: String, credentials: Vec<String>, start: StartPolicy) -> Self {
        let cursor = match start {
            StartPolicy::Zero => 0,
            StartPolicy::Random => fastrand::usize(..credentials.len()),
        };

        Self {
            authority,
            credentials,
            cursor: AtomicUsize::new(cursor),
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Current cursor position
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Hand out the credential under the cursor and advance it, wrapping.
    ///
    /// The read-modify-write is a single atomic update, so concurrent callers
    /// each get a distinct slot and no index is skipped or repeated.
    pub fn next_credential(&self) -> &str {
        let len = self.credentials.len();
        let index = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some((i + 1) % len))
            .unwrap_or_else(|i| i);

        &self.credentials[index]
    }
}

/// Process-wide token table
#[derive(Debug, Default)]
pub struct CredentialRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl CredentialRegistry {
    /// Build the registry from configured records.
    ///
    /// Records without credentials are dropped. A repeated token replaces the
    /// earlier entry.
    pub fn build(records: impl IntoIterator<Item = CredentialRecord>, start: StartPolicy) -> Self {
        let mut entries = HashMap::new();

        for record in records {
            if record.credentials.is_empty() {
                tracing::warn!(
                    token = %mask(&record.token),
                    authority = %record.authority,
                    "Route has no credentials, skipping"
                );
                continue;
            }

            let authority = normalize_authority(&record.authority);
            let entry = RegistryEntry::new(authority, record.credentials, start);

            if entries.insert(record.token.clone(), entry).is_some() {
                tracing::warn!(
                    token = %mask(&record.token),
                    "Duplicate token in configuration, later route wins"
                );
            }
        }

        Self { entries }
    }

    /// Exact-match lookup
    pub fn lookup(&self, token: &str) -> Option<&RegistryEntry> {
        self.entries.get(token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Strip one trailing `/` from an authority
pub fn normalize_authority(authority: &str) -> String {
    authority
        .strip_suffix('/')
        .unwrap_or(authority)
        .to_string()
}

/// Short, log-safe rendering of a secret
pub fn mask(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    format!("{}***", prefix)
}
