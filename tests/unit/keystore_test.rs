use sshchat::auth::keystore::{self, Binding, KeyStore};
use sshchat::auth::pubkey;
use std::io::Write;
use tempfile::NamedTempFile;

const RSA_K1: &str = "AAAAB3NzaC1yc2EAAAADAQABAAABAQDTRv3eC2VE1CR6tAae2pto6+foRnK8tQzC4j0odrD7XPHki4QVA4tEhMxH/ItdhofHfQNj2yuVC0bVwwxrVpQubOXaNgcKGqr3OHCgkOVSpR2iJf/AYWNflBb1o8deS/DQ0kwDEdbu84f9rcAilUsn9VfbjYGz3PWnTDDajQtq9y6iOTUrVNK0M+u+kSSf534zm+rQ7s9YGYqDv6IVGuqKxDhApEf3/EqiM0/Fbh/QTgrIuh7gpUQZ/nB3p7cf5NiwKztgblT6aow0pnNZDkheTWvB+rdUFvnvJWiYB2er4avmjrgIJSLKf2YMXCbhHRQUpCcGmEDya0OUkm9E+HBJ";
const RSA_K2: &str = "AAAAB3NzaC1yc2EAAAADAQABAAABAQC10xvYufyjdfFqYt7ttHkKYIA0n2VBdbR0kAyXwlXCBACdjV11SjVu30BE69r3K6BVuU65HgMWHY3ufIbufu/W3FDIYqZ/fY2I2xvpX1IryKWoz6px5eNDK6/xOad4yYfWFmDmA0E5/Iy9OE34JkiLFEkN7dC55/dzJY1sVUscQ6NyZJT+AYu5BQQ9uyyPU8icB42J0t443CrJxedGD0+nOUsj6JyTV28WQqZuYfK6auOVr2JFDN52Yduj1T5Zx4ygV7U7qTQ4KjZmk+IO7hrFSKtnsC/vJNZCh5zCC6nBYU0TU7P66estp3xWx3+Hj4ZXfNgD0M9KzpY2PKX/lfJL";
const ED25519_K3: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIIV+UyVQevS5UktuSTIujK8Q65e7tjfcKpkMqbaAc477";

#[test]
fn valid_line_is_reachable_by_username() {
    let store = KeyStore::parse(&format!("ssh-rsa {} alice@host\n", RSA_K1));
    let keys = store.lookup("alice");
    assert_eq!(keys.len(), 1);
    assert!(keys[0].algorithm().is_rsa());
}

#[test]
fn two_field_line_is_skipped() {
    let store = KeyStore::parse(&format!("ssh-rsa {}\n", RSA_K1));
    assert!(store.is_empty());
}

#[test]
fn four_field_line_is_skipped() {
    let store = KeyStore::parse(&format!("ssh-rsa {} alice@host extra\n", RSA_K1));
    assert!(store.is_empty());
}

#[test]
fn other_algorithm_is_skipped() {
    let store = KeyStore::parse(&format!("ssh-ed25519 {} carol@host\n", ED25519_K3));
    assert!(store.is_empty());
    assert!(store.lookup("carol").is_empty());
}

#[test]
fn algorithm_id_must_match_key_material() {
    // Declared ssh-rsa, but the blob is an Ed25519 key.
    let store = KeyStore::parse(&format!("ssh-rsa {} carol@host\n", ED25519_K3));
    assert!(store.is_empty());
}

#[test]
fn undecodable_key_is_skipped() {
    let content = format!(
        "ssh-rsa not-base64!! mallory@host\nssh-rsa {} alice@host\n",
        RSA_K1
    );
    let store = KeyStore::parse(&content);
    assert_eq!(store.users(), vec!["alice"]);
}

#[test]
fn username_is_text_before_at() {
    let content = format!("ssh-rsa {} bob\nssh-rsa {} @nohost\n", RSA_K1, RSA_K2);
    let store = KeyStore::parse(&content);
    assert_eq!(store.users(), vec!["bob"]);
}

#[test]
fn user_may_have_several_keys() {
    let content = format!(
        "ssh-rsa {} alice@laptop\nssh-rsa {} alice@desktop\nssh-rsa {} alice@again\n",
        RSA_K1, RSA_K2, RSA_K1
    );
    let store = KeyStore::parse(&content);
    assert_eq!(store.lookup("alice").len(), 2);
    assert_eq!(store.len(), 1);
}

#[test]
fn blank_and_comment_lines_are_ignored() {
    let content = format!("\n# team keys\n\nssh-rsa {} alice@host\n", RSA_K1);
    assert_eq!(KeyStore::parse(&content).len(), 1);
}

#[test]
fn parse_line_returns_user_and_key() {
    let (user, key) = keystore::parse_line(&format!("ssh-rsa  {}\talice@host", RSA_K1)).unwrap();
    assert_eq!(user, "alice");
    assert!(pubkey::same_key(&key, &pubkey::parse_key_data(RSA_K1).unwrap()));
}

#[test]
fn load_reads_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "ssh-rsa {} alice@host", RSA_K1).unwrap();
    writeln!(file, "ssh-ed25519 {} carol@host", ED25519_K3).unwrap();
    writeln!(file, "ssh-rsa {} bob@host", RSA_K2).unwrap();

    let store = KeyStore::load(file.path()).unwrap();
    assert_eq!(store.users(), vec!["alice", "bob"]);
}

#[test]
fn load_missing_file_fails() {
    assert!(KeyStore::load(std::path::Path::new("/nonexistent/auth_keys")).is_err());
}

#[test]
fn bind_if_absent_never_replaces() {
    let store = KeyStore::new();
    let k1 = pubkey::parse_key_data(RSA_K1).unwrap();
    let k2 = pubkey::parse_key_data(RSA_K2).unwrap();

    assert_eq!(store.bind_if_absent("alice", &k1), Binding::Bound);
    assert_eq!(store.bind_if_absent("alice", &k1), Binding::Matched);
    assert_eq!(store.bind_if_absent("alice", &k2), Binding::Mismatch);
    assert_eq!(store.matches("alice", &k1), Some(true));
    assert_eq!(store.matches("alice", &k2), Some(false));
    assert_eq!(store.matches("nobody", &k1), None);
}

#[test]
fn fingerprint_formats() {
    let key = pubkey::parse_key_data(ED25519_K3).unwrap();
    let fp = pubkey::fingerprint(&key);
    assert!(fp.starts_with("SHA256:"));
    assert!(!fp.ends_with('='));

    let hex = pubkey::fingerprint_hex(&key);
    assert_eq!(hex.split(':').count(), 32);
}
