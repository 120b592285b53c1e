//! Password hygiene and askpass session bookkeeping.
//!
//! The pure helpers (`mask_password`, `validate_password`,
//! `generate_password`) have no state. [`SecurePasswordHandler`] tracks the
//! askpass helper scripts a sudo invocation materialises on a remote host so
//! they can be removed unconditionally, including from `dispose` when a
//! command was cancelled mid-flight.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};

/// Token substituted for every password occurrence.
pub const MASK: &str = "***MASKED***";

const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";
// Shell-safe symbol set: no quotes, backslashes or backticks.
const SYMBOLS: &[u8] = b"!@#%^*()-_=+[]{}:,.?";

/// Replace every occurrence of `password` in `text` with [`MASK`].
pub fn mask_password(text: &str, password: &str) -> String {
    if password.is_empty() {
        return text.to_string();
    }
    text.replace(password, MASK)
}

/// Outcome of [`validate_password`]; valid iff `issues` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordValidation {
    pub is_valid: bool,
    pub issues: Vec<String>,
}

pub fn validate_password(password: &str) -> PasswordValidation {
    let mut issues = Vec::new();
    if password.chars().count() < 8 {
        issues.push("Password should be at least 8 characters long".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        issues.push("Password should contain at least one uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        issues.push("Password should contain at least one lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        issues.push("Password should contain at least one digit".to_string());
    }
    if !password.chars().any(|c| !c.is_ascii_alphanumeric()) {
        issues.push("Password should contain at least one special character".to_string());
    }
    PasswordValidation {
        is_valid: issues.is_empty(),
        issues,
    }
}

/// Generate a password of exactly `length` characters containing all four
/// character classes (for `length >= 4`); the result passes
/// [`validate_password`] for `length >= 8`.
pub fn generate_password(length: usize) -> String {
    let mut rng = thread_rng();
    let mut chars: Vec<u8> = Vec::with_capacity(length);

    let classes = [UPPER, LOWER, DIGITS, SYMBOLS];
    if length >= classes.len() {
        for class in classes {
            chars.push(*class.choose(&mut rng).expect("class is non-empty"));
        }
    }

    let all: Vec<u8> = classes.concat();
    while chars.len() < length {
        chars.push(*all.choose(&mut rng).expect("alphabet is non-empty"));
    }
    chars.truncate(length);
    chars.shuffle(&mut rng);
    String::from_utf8(chars).expect("alphabet is ASCII")
}

fn random_id(length: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// One secure-askpass invocation: a short-lived remote helper script plus
/// the environment variable the password travels through.
#[derive(Debug, Clone)]
pub struct AskpassSession {
    pub id: String,
    pub remote_path: String,
    pub env_var: String,
    pub created_at: SystemTime,
}

impl AskpassSession {
    /// Body of the remote helper: prints the password from the session's
    /// env var and exits. Uploaded with mode 0700.
    pub fn helper_script(&self) -> String {
        format!("#!/bin/sh\nprintf '%s\\n' \"${}\"\n", self.env_var)
    }
}

/// Tracks live askpass helpers. Cleanup bookkeeping is idempotent: a
/// session removed twice is a no-op.
#[derive(Debug, Default)]
pub struct SecurePasswordHandler {
    sessions: Mutex<HashMap<String, AskpassSession>>,
}

impl SecurePasswordHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new session with a random helper id and env-var name.
    pub fn begin_session(&self) -> AskpassSession {
        let id = random_id(12);
        let session = AskpassSession {
            remote_path: format!("/tmp/askpass-{id}.sh"),
            env_var: format!("SUDO_ASKPASS_{}", id.to_uppercase()),
            id,
            created_at: SystemTime::now(),
        };
        self.sessions
            .lock()
            .expect("askpass session lock poisoned")
            .insert(session.id.clone(), session.clone());
        session
    }

    /// Record that a session's remote helper was removed.
    pub fn finish_session(&self, id: &str) {
        self.sessions
            .lock()
            .expect("askpass session lock poisoned")
            .remove(id);
    }

    /// Sessions whose helper scripts have not been confirmed removed.
    pub fn pending_sessions(&self) -> Vec<AskpassSession> {
        self.sessions
            .lock()
            .expect("askpass session lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions
            .lock()
            .expect("askpass session lock poisoned")
            .is_empty()
    }
}
