use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::TryRngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const START_COMMAND: &str = "/start";
pub const GET_KEY_COMMAND: &str = "/getkey";

/// Random bytes behind every key.
pub const KEY_ENTROPY_BYTES: usize = 16;
/// Length of an encoded key: 16 bytes in unpadded base64.
pub const KEY_LEN: usize = 22;

pub const GREETING_TEXT: &str =
    "🔐 Hi! I hand out personal one-time access keys.\nSend /getkey to receive yours.";
pub const ALREADY_ACTIVE_TEXT: &str =
    "You already have an active key. A new one can be issued once it has been used.";
pub const ISSUE_FAILED_TEXT: &str =
    "⚠️ Could not issue a key right now. Please try /getkey again later.";

#[derive(Debug, Error)]
pub enum KeyGenError {
    #[error("secure random source failed: {0}")]
    Entropy(String),
}

/// Source of fresh access keys.
pub trait KeySource: Send + Sync {
    fn generate(&self) -> Result<String, KeyGenError>;
}

/// Production key source backed by the operating system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsKeySource;

impl KeySource for OsKeySource {
    fn generate(&self) -> Result<String, KeyGenError> {
        generate_key()
    }
}

pub fn generate_key() -> Result<String, KeyGenError> {
    let mut bytes = [0u8; KEY_ENTROPY_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| KeyGenError::Entropy(e.to_string()))?;
    Ok(encode_key(bytes))
}

/// Lays the bytes out as a v4 UUID and encodes them as URL-safe base64
/// without padding.
pub fn encode_key(bytes: [u8; KEY_ENTROPY_BYTES]) -> String {
    let id = uuid::Builder::from_random_bytes(bytes).into_uuid();
    URL_SAFE_NO_PAD.encode(id.as_bytes())
}

pub fn is_url_safe_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Short stable digest of a key, safe to put in logs.
pub fn key_fingerprint(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    GetKey,
}

pub fn classify(text: &str) -> Option<Command> {
    match text.trim() {
        START_COMMAND => Some(Command::Start),
        GET_KEY_COMMAND => Some(Command::GetKey),
        _ => None,
    }
}

pub fn display_name(username: Option<&str>, user_id: i64) -> String {
    match username {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("user_{user_id}"),
    }
}

pub fn issued_text(key: &str, display_name: &str, user_id: i64) -> String {
    format!(
        "🔑 Your personal one-time key:\n\n<code>{}</code>\n\nBound to: @{} (ID: {user_id})\nSave it now, it will not be shown again!",
        escape_html(key),
        escape_html(display_name),
    )
}

/// Escapes the characters Telegram's HTML parse mode treats as markup.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
