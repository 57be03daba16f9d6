//! Tests for the secret box: round trips, the ciphertext detector, and key
//! file bootstrap.

use crate::secret::{looks_encrypted, SecretBox, CIPHERTEXT_PREFIX};
use tempfile::TempDir;

#[test]
fn encrypt_decrypt_round_trip() {
    let secrets = SecretBox::new(&[42u8; 32]);
    for plaintext in ["", "hunter2", "pässwörd with spaces", "日本語"] {
        let ciphertext = secrets.encrypt(plaintext).unwrap();
        assert!(looks_encrypted(&ciphertext));
        assert_eq!(&*secrets.decrypt(&ciphertext).unwrap(), plaintext);
    }
}

#[test]
fn ciphertexts_differ_per_encryption() {
    let secrets = SecretBox::new(&[42u8; 32]);
    let first = secrets.encrypt("same input").unwrap();
    let second = secrets.encrypt("same input").unwrap();
    // A fresh nonce per encryption means equal plaintexts never produce
    // equal ciphertexts.
    assert_ne!(first, second);
    assert_eq!(&*secrets.decrypt(&first).unwrap(), "same input");
    assert_eq!(&*secrets.decrypt(&second).unwrap(), "same input");
}

#[test]
fn detector_only_accepts_the_version_tag() {
    assert!(looks_encrypted("enc:v1:abcdef"));
    assert!(!looks_encrypted("hunter2"));
    assert!(!looks_encrypted(""));
    assert!(!looks_encrypted("enc:v2:abcdef"));
}

#[test]
fn tampered_ciphertext_fails_to_decrypt() {
    let secrets = SecretBox::new(&[42u8; 32]);
    let ciphertext = secrets.encrypt("hunter2").unwrap();

    let mut tampered = ciphertext.clone();
    // Flip the final base64 character.
    let last = tampered.pop().unwrap();
    tampered.push(if last == 'A' { 'B' } else { 'A' });
    assert!(secrets.decrypt(&tampered).is_err());

    assert!(secrets.decrypt("hunter2").is_err());
    assert!(secrets
        .decrypt(&format!("{}not-base64!!!", CIPHERTEXT_PREFIX))
        .is_err());
}

#[test]
fn wrong_key_fails_to_decrypt() {
    let secrets = SecretBox::new(&[1u8; 32]);
    let other = SecretBox::new(&[2u8; 32]);
    let ciphertext = secrets.encrypt("hunter2").unwrap();
    assert!(other.decrypt(&ciphertext).is_err());
}

#[test]
fn key_file_bootstrap_persists_the_key() {
    let dir = TempDir::new().unwrap();
    let key_path = dir.path().join("secret.key");

    let first = SecretBox::from_key_file(&key_path).unwrap();
    let ciphertext = first.encrypt("hunter2").unwrap();

    // The file exists, has exactly the key material, and a second box built
    // from it can decrypt what the first one produced.
    let raw = std::fs::read(&key_path).unwrap();
    assert_eq!(raw.len(), 32);

    let second = SecretBox::from_key_file(&key_path).unwrap();
    assert_eq!(&*second.decrypt(&ciphertext).unwrap(), "hunter2");
}

#[cfg(unix)]
#[test]
fn key_file_is_private() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let key_path = dir.path().join("secret.key");
    SecretBox::from_key_file(&key_path).unwrap();

    let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn truncated_key_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let key_path = dir.path().join("secret.key");
    std::fs::write(&key_path, b"short").unwrap();
    assert!(SecretBox::from_key_file(&key_path).is_err());
}
