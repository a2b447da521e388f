pub mod keystore;
pub mod pubkey;

use crate::config::types::{AuthConfig, PolicyMode};
use anyhow::Result;
use keystore::{Binding, KeyStore};
use russh::keys::PublicKey;
use std::sync::Arc;
use thiserror::Error;

/// Why an authentication attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("empty username")]
    EmptyUsername,
    #[error("key mismatch")]
    KeyMismatch,
    #[error("unknown user and binding not allowed")]
    UnknownUser,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Accepted(String),
    Rejected(Rejection),
}

impl AuthDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AuthDecision::Accepted(_))
    }
}

/// Public key authentication policy.
///
/// A username that already has keys must present one of them. A username
/// without keys is either bound to the first key it presents
/// ([`PolicyMode::TrustOnFirstUse`]) or refused ([`PolicyMode::Strict`]).
/// Bindings are permanent for the lifetime of the store; there is no
/// revocation.
#[derive(Debug)]
pub struct AuthPolicy {
    store: Arc<KeyStore>,
    mode: PolicyMode,
}

impl AuthPolicy {
    pub fn new(store: Arc<KeyStore>, mode: PolicyMode) -> Self {
        Self { store, mode }
    }

    /// Build the policy from config, loading the key file when one is set.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let store = match &config.authorized_keys {
            Some(path) => KeyStore::load(path)?,
            None => KeyStore::new(),
        };
        Ok(Self::new(Arc::new(store), config.policy))
    }

    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    /// Decide an attempt, binding the key on first use when allowed.
    pub fn decide(&self, username: &str, key: &PublicKey) -> AuthDecision {
        if username.trim().is_empty() {
            return AuthDecision::Rejected(Rejection::EmptyUsername);
        }

        match self.mode {
            PolicyMode::TrustOnFirstUse => match self.store.bind_if_absent(username, key) {
                Binding::Bound => {
                    tracing::info!(
                        user = %username,
                        fingerprint = %pubkey::fingerprint(key),
                        "Key bound on first use"
                    );
                    AuthDecision::Accepted(username.to_string())
                }
                Binding::Matched => AuthDecision::Accepted(username.to_string()),
                Binding::Mismatch => AuthDecision::Rejected(Rejection::KeyMismatch),
            },
            PolicyMode::Strict => self.check(username, key),
        }
    }

    /// The decision [`decide`](Self::decide) would make, without binding.
    /// Used when a client merely offers a key it has not yet signed with.
    pub fn check(&self, username: &str, key: &PublicKey) -> AuthDecision {
        if username.trim().is_empty() {
            return AuthDecision::Rejected(Rejection::EmptyUsername);
        }

        match (self.store.matches(username, key), self.mode) {
            (Some(true), _) => AuthDecision::Accepted(username.to_string()),
            (Some(false), _) => AuthDecision::Rejected(Rejection::KeyMismatch),
            (None, PolicyMode::TrustOnFirstUse) => AuthDecision::Accepted(username.to_string()),
            (None, PolicyMode::Strict) => AuthDecision::Rejected(Rejection::UnknownUser),
        }
    }
}
