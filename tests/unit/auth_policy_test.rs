use sshchat::auth::keystore::KeyStore;
use sshchat::auth::pubkey;
use sshchat::auth::{AuthDecision, AuthPolicy, Rejection};
use sshchat::config::types::PolicyMode;
use russh::keys::PublicKey;
use std::sync::{Arc, Barrier};

const RSA_K1: &str = "AAAAB3NzaC1yc2EAAAADAQABAAABAQDTRv3eC2VE1CR6tAae2pto6+foRnK8tQzC4j0odrD7XPHki4QVA4tEhMxH/ItdhofHfQNj2yuVC0bVwwxrVpQubOXaNgcKGqr3OHCgkOVSpR2iJf/AYWNflBb1o8deS/DQ0kwDEdbu84f9rcAilUsn9VfbjYGz3PWnTDDajQtq9y6iOTUrVNK0M+u+kSSf534zm+rQ7s9YGYqDv6IVGuqKxDhApEf3/EqiM0/Fbh/QTgrIuh7gpUQZ/nB3p7cf5NiwKztgblT6aow0pnNZDkheTWvB+rdUFvnvJWiYB2er4avmjrgIJSLKf2YMXCbhHRQUpCcGmEDya0OUkm9E+HBJ";
const RSA_K2: &str = "AAAAB3NzaC1yc2EAAAADAQABAAABAQC10xvYufyjdfFqYt7ttHkKYIA0n2VBdbR0kAyXwlXCBACdjV11SjVu30BE69r3K6BVuU65HgMWHY3ufIbufu/W3FDIYqZ/fY2I2xvpX1IryKWoz6px5eNDK6/xOad4yYfWFmDmA0E5/Iy9OE34JkiLFEkN7dC55/dzJY1sVUscQ6NyZJT+AYu5BQQ9uyyPU8icB42J0t443CrJxedGD0+nOUsj6JyTV28WQqZuYfK6auOVr2JFDN52Yduj1T5Zx4ygV7U7qTQ4KjZmk+IO7hrFSKtnsC/vJNZCh5zCC6nBYU0TU7P66estp3xWx3+Hj4ZXfNgD0M9KzpY2PKX/lfJL";
const ED25519_K3: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIIV+UyVQevS5UktuSTIujK8Q65e7tjfcKpkMqbaAc477";

fn key(data: &str) -> PublicKey {
    pubkey::parse_key_data(data).unwrap()
}

fn tofu() -> AuthPolicy {
    AuthPolicy::new(Arc::new(KeyStore::new()), PolicyMode::TrustOnFirstUse)
}

fn accepted(user: &str) -> AuthDecision {
    AuthDecision::Accepted(user.to_string())
}

// ---------------------------------------------------------------------------
// Trust on first use
// ---------------------------------------------------------------------------

#[test]
fn first_key_binds_and_locks_username() {
    let policy = tofu();
    let k1 = key(RSA_K1);
    let k2 = key(RSA_K2);

    assert_eq!(policy.decide("alice", &k1), accepted("alice"));
    assert_eq!(
        policy.decide("alice", &k2),
        AuthDecision::Rejected(Rejection::KeyMismatch)
    );
    assert_eq!(policy.decide("alice", &k1), accepted("alice"));
    assert_eq!(policy.key_store().lookup("alice").len(), 1);
}

#[test]
fn any_algorithm_can_bind_on_first_use() {
    let policy = tofu();
    assert!(policy.decide("carol", &key(ED25519_K3)).is_accepted());
    assert!(!policy.decide("carol", &key(RSA_K1)).is_accepted());
}

#[test]
fn usernames_bind_independently() {
    let policy = tofu();
    assert!(policy.decide("alice", &key(RSA_K1)).is_accepted());
    assert!(policy.decide("bob", &key(RSA_K2)).is_accepted());
    assert_eq!(policy.key_store().users(), vec!["alice", "bob"]);
}

#[test]
fn check_does_not_bind() {
    let policy = tofu();
    assert!(policy.check("bob", &key(RSA_K1)).is_accepted());
    assert!(!policy.key_store().contains_user("bob"));

    // The signed attempt decides, whatever was offered before.
    assert!(policy.decide("bob", &key(RSA_K2)).is_accepted());
    assert_eq!(
        policy.check("bob", &key(RSA_K1)),
        AuthDecision::Rejected(Rejection::KeyMismatch)
    );
}

// ---------------------------------------------------------------------------
// Empty username
// ---------------------------------------------------------------------------

#[test]
fn empty_username_always_rejected() {
    let store = KeyStore::parse(&format!("ssh-rsa {} @host\n", RSA_K1));
    let policy = AuthPolicy::new(Arc::new(store), PolicyMode::TrustOnFirstUse);

    for name in ["", "   ", "\t"] {
        assert_eq!(
            policy.decide(name, &key(RSA_K1)),
            AuthDecision::Rejected(Rejection::EmptyUsername)
        );
        assert_eq!(
            policy.check(name, &key(RSA_K1)),
            AuthDecision::Rejected(Rejection::EmptyUsername)
        );
    }
    assert!(policy.key_store().is_empty());
}

// ---------------------------------------------------------------------------
// Key file and strict mode
// ---------------------------------------------------------------------------

#[test]
fn key_file_user_must_present_listed_key() {
    let store = KeyStore::parse(&format!("ssh-rsa {} alice@laptop\n", RSA_K1));
    let policy = AuthPolicy::new(Arc::new(store), PolicyMode::TrustOnFirstUse);

    assert!(policy.decide("alice", &key(RSA_K1)).is_accepted());
    assert_eq!(
        policy.decide("alice", &key(RSA_K2)),
        AuthDecision::Rejected(Rejection::KeyMismatch)
    );
}

#[test]
fn strict_mode_refuses_unknown_users() {
    let store = KeyStore::parse(&format!("ssh-rsa {} alice@laptop\n", RSA_K1));
    let policy = AuthPolicy::new(Arc::new(store), PolicyMode::Strict);

    assert!(policy.decide("alice", &key(RSA_K1)).is_accepted());
    assert_eq!(
        policy.decide("bob", &key(RSA_K2)),
        AuthDecision::Rejected(Rejection::UnknownUser)
    );
    assert!(!policy.key_store().contains_user("bob"));
}

#[test]
fn from_config_without_key_file_is_empty() {
    let config = sshchat::config::types::AuthConfig::default();
    let policy = AuthPolicy::from_config(&config).unwrap();
    assert!(policy.key_store().is_empty());
    assert_eq!(policy.mode(), PolicyMode::TrustOnFirstUse);
}

#[test]
fn from_config_with_missing_key_file_fails() {
    let config = sshchat::config::types::AuthConfig {
        authorized_keys: Some("/nonexistent/sshchat/auth_keys".into()),
        policy: PolicyMode::Strict,
    };
    assert!(AuthPolicy::from_config(&config).is_err());
}

// ---------------------------------------------------------------------------
// Concurrent first use
// ---------------------------------------------------------------------------

#[test]
fn concurrent_first_use_binds_exactly_one_key() {
    let policy = Arc::new(tofu());
    let keys = [key(RSA_K1), key(RSA_K2)];

    for round in 0..50 {
        let user = format!("racer{}", round);
        let barrier = Arc::new(Barrier::new(keys.len()));
        let handles: Vec<_> = keys
            .iter()
            .cloned()
            .map(|k| {
                let policy = policy.clone();
                let barrier = barrier.clone();
                let user = user.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    (policy.decide(&user, &k), k)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<_> = results.iter().filter(|(d, _)| d.is_accepted()).collect();
        assert_eq!(winners.len(), 1, "round {}: exactly one key may bind", round);

        let bound = policy.key_store().lookup(&user);
        assert_eq!(bound.len(), 1);
        assert!(pubkey::same_key(&bound[0], &winners[0].1));

        // The loser stays locked out.
        for (decision, k) in &results {
            if !decision.is_accepted() {
                assert_eq!(*decision, AuthDecision::Rejected(Rejection::KeyMismatch));
                assert!(!policy.decide(&user, k).is_accepted());
            }
        }
    }
}
