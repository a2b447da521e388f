use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use russh::keys::PublicKey;
use std::path::Path;
use tracing::{debug, info};

use super::pubkey;

/// The only algorithm id accepted in the key file.
pub const ACCEPTED_ALGORITHM: &str = "ssh-rsa";

/// Result of an atomic check-and-bind on a username.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// The username had no keys; the presented key is now bound to it.
    Bound,
    /// The presented key is one of the username's keys.
    Matched,
    /// The username has keys and the presented key is not among them.
    Mismatch,
}

/// username → accepted public keys.
///
/// Populated from an authorized_keys style file and extended by
/// trust-on-first-use bindings. Entries are never replaced.
#[derive(Debug, Default)]
pub struct KeyStore {
    keys: DashMap<String, Vec<PublicKey>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and parse a key file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading key file: {}", path.display()))?;
        let store = Self::parse(&content);
        info!(
            path = %path.display(),
            users = store.len(),
            "Key file loaded"
        );
        Ok(store)
    }

    /// Parse key file content. Lines that are not exactly
    /// `ssh-rsa <base64> user@host`, or whose key does not decode, are skipped.
    pub fn parse(content: &str) -> Self {
        let store = Self::new();
        for (lineno, line) in content.lines().enumerate() {
            match parse_line(line) {
                Some((user, key)) => store.add_key(&user, key),
                None => debug!(line = lineno + 1, "Skipping key file line"),
            }
        }
        store
    }

    /// Add a key to a user's set (key file loading path).
    pub fn add_key(&self, user: &str, key: PublicKey) {
        let mut keys = self.keys.entry(user.to_string()).or_default();
        if !keys.iter().any(|k| pubkey::same_key(k, &key)) {
            keys.push(key);
        }
    }

    /// Keys bound to `user`, empty when unknown.
    pub fn lookup(&self, user: &str) -> Vec<PublicKey> {
        self.keys
            .get(user)
            .map(|keys| keys.value().clone())
            .unwrap_or_default()
    }

    pub fn contains_user(&self, user: &str) -> bool {
        self.keys.contains_key(user)
    }

    /// Compare `key` against the user's keys without modifying anything.
    /// `None` means the user has no keys.
    pub fn matches(&self, user: &str, key: &PublicKey) -> Option<bool> {
        self.keys
            .get(user)
            .map(|keys| keys.iter().any(|k| pubkey::same_key(k, key)))
    }

    /// Bind `key` to `user` unless the user already has keys, in which case
    /// report whether `key` is one of them. The entry lock makes the
    /// check and the insert one step: concurrent first attempts for the
    /// same username see exactly one `Bound`.
    pub fn bind_if_absent(&self, user: &str, key: &PublicKey) -> Binding {
        match self.keys.entry(user.to_string()) {
            Entry::Occupied(entry) => {
                if entry.get().iter().any(|k| pubkey::same_key(k, key)) {
                    Binding::Matched
                } else {
                    Binding::Mismatch
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(vec![key.clone()]);
                Binding::Bound
            }
        }
    }

    /// Known usernames, sorted.
    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.keys.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Parse one key file line into `(username, key)`.
pub fn parse_line(line: &str) -> Option<(String, PublicKey)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 3 || fields[0] != ACCEPTED_ALGORITHM {
        return None;
    }

    let user = fields[2].split('@').next().unwrap_or_default();
    if user.is_empty() {
        return None;
    }

    let key = pubkey::parse_key_data(fields[1]).ok()?;
    if !key.algorithm().is_rsa() {
        return None;
    }
    Some((user.to_string(), key))
}
