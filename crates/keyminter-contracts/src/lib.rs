use serde::{Deserialize, Serialize};

pub const PARSE_MODE_HTML: &str = "HTML";
pub const SECRET_TOKEN_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";

/// One update as delivered by the Telegram webhook. Only the fields the
/// issuance workflow reads are modelled; everything else is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub update_id: Option<i64>,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub chat: Option<Chat>,
    #[serde(default)]
    pub from: Option<User>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

/// Transient command derived once per webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    pub chat_id: i64,
    pub user_id: i64,
    pub username: Option<String>,
    pub text: String,
}

impl InboundCommand {
    /// Returns `None` unless the update carries a message with text, sender
    /// and chat.
    pub fn from_update(update: &Update) -> Option<Self> {
        let message = update.message.as_ref()?;
        let text = message.text.as_ref()?;
        let from = message.from.as_ref()?;
        let chat = message.chat.as_ref()?;
        Some(Self {
            chat_id: chat.id,
            user_id: from.id,
            username: from.username.clone().filter(|v| !v.is_empty()),
            text: text.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub chat_id: i64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub chat_id: i64,
    pub text: String,
    pub parse_mode: String,
}

impl From<&OutboundMessage> for SendMessageRequest {
    fn from(msg: &OutboundMessage) -> Self {
        Self {
            chat_id: msg.chat_id,
            text: msg.text.clone(),
            parse_mode: PARSE_MODE_HTML.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetWebhookRequest {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_token: Option<String>,
    pub drop_pending_updates: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteWebhookRequest {
    pub drop_pending_updates: bool,
}

/// Long-poll request. `offset` is one past the last `update_id` already
/// handled; Telegram forgets everything below it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetUpdatesRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    pub timeout: u64,
    pub allowed_updates: Vec<String>,
}

/// `getUpdates` envelope. Entries stay raw so one malformed update does not
/// sink the whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetUpdatesResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub result: Vec<serde_json::Value>,
}

/// Row of the key table as stored by the external record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key: String,
    pub used: bool,
    pub user_id: String,
}

impl KeyRecord {
    pub fn unused(key: &str, owner_id: &str) -> Self {
        Self {
            key: key.to_string(),
            used: false,
            user_id: owner_id.to_string(),
        }
    }
}
