use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const CONFIG_SCHEMA: &str = include_str!("../../../config/config.schema.json");

/// Environment variables that override file values, with the config path
/// each one lands on. Later entries win, so `LISTEN_ADDR` beats `PORT`.
pub const ENV_OVERRIDES: &[(&str, &[&str])] = &[
    ("PORT", &["server", "listen_addr"]),
    ("LISTEN_ADDR", &["server", "listen_addr"]),
    ("SUPABASE_URL", &["store", "base_url"]),
    ("SUPABASE_TABLE", &["store", "table"]),
    ("SUPABASE_ANON_KEY", &["store", "api_key"]),
    ("BOT_TOKEN", &["telegram", "bot_token"]),
    ("PUBLIC_URL", &["telegram", "public_url"]),
    ("WEBHOOK_SECRET", &["webhook", "secret"]),
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub telegram: Telegram,
    #[serde(default)]
    pub webhook: Webhook,
    #[serde(default)]
    pub issuer: Issuer,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub sqlite_path: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telegram {
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub public_url: Option<String>,
    /// `webhook` (Telegram pushes to `/webhook`) or `polling` (`getUpdates`).
    #[serde(default = "default_telegram_mode")]
    pub mode: String,
    #[serde(default = "default_poll_timeout_s")]
    pub poll_timeout_s: u64,
}

impl Telegram {
    pub fn polling(&self) -> bool {
        self.mode == "polling"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    #[serde(default)]
    pub secret: Option<String>,
    /// When true, webhook calls without the matching secret header are
    /// rejected with 401.
    #[serde(default = "default_enforce_secret")]
    pub enforce_secret: bool,
}

impl Default for Webhook {
    fn default() -> Self {
        Self {
            secret: None,
            enforce_secret: default_enforce_secret(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issuer {
    #[serde(default = "default_lookup_fail_mode")]
    pub lookup_fail_mode: String,
}

impl Default for Issuer {
    fn default() -> Self {
        Self {
            lookup_fail_mode: default_lookup_fail_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

fn default_table() -> String {
    "one_time_keys".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_telegram_mode() -> String {
    "webhook".to_string()
}

fn default_poll_timeout_s() -> u64 {
    25
}

fn default_enforce_secret() -> bool {
    true
}

fn default_lookup_fail_mode() -> String {
    "allow".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    load_and_validate_with_env(path, |name| std::env::var(name).ok())
}

pub fn load_and_validate_with_env<F>(path: &str, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let mut instance =
        serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    apply_env_overrides(&mut instance, env)?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn apply_env_overrides<F>(instance: &mut Value, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    for &(name, path) in ENV_OVERRIDES {
        let Some(raw) = env(name).filter(|v| !v.is_empty()) else {
            continue;
        };
        let value = env_value(name, raw)?;
        let (leaf, parents) = path
            .split_last()
            .ok_or_else(|| ConfigError::Parse(format!("empty override path for {name}")))?;

        let mut node = &mut *instance;
        for key in parents {
            node = object_mut(node, name)?
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        object_mut(node, name)?.insert(leaf.to_string(), Value::String(value));
    }
    Ok(())
}

fn env_value(name: &str, raw: String) -> Result<String, ConfigError> {
    if name != "PORT" {
        return Ok(raw);
    }
    let port: u16 = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::Parse(format!("PORT must be a TCP port number, got {raw}")))?;
    Ok(format!("0.0.0.0:{port}"))
}

fn object_mut<'a>(
    node: &'a mut Value,
    env_name: &str,
) -> Result<&'a mut Map<String, Value>, ConfigError> {
    if node.is_null() {
        *node = Value::Object(Map::new());
    }
    node.as_object_mut().ok_or_else(|| {
        ConfigError::Parse(format!(
            "cannot apply {env_name}: target section is not a mapping"
        ))
    })
}

fn validate_against_schema(instance: &Value) -> Result<(), ConfigError> {
    let schema: Value =
        serde_json::from_str(CONFIG_SCHEMA).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn is_blank(v: &Option<String>) -> bool {
    v.as_ref().map(|s| s.trim().is_empty()).unwrap_or(true)
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    match cfg.store.kind.as_str() {
        "rest" => {
            if is_blank(&cfg.store.base_url) {
                return Err(ConfigError::UnsupportedConfig(
                    "store.base_url is required when store.type=rest".to_string(),
                ));
            }
            if is_blank(&cfg.store.api_key) {
                return Err(ConfigError::UnsupportedConfig(
                    "store.api_key is required when store.type=rest".to_string(),
                ));
            }
        }
        "sqlite" => {
            if is_blank(&cfg.store.sqlite_path) {
                return Err(ConfigError::UnsupportedConfig(
                    "store.sqlite_path is required when store.type=sqlite".to_string(),
                ));
            }
        }
        "memory" => {
            if cfg.store.sqlite_path.is_some() {
                return Err(ConfigError::UnsupportedConfig(
                    "store.sqlite_path is not supported when store.type=memory".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "store.type={other} is not implemented; supported: rest, memory, sqlite"
            )));
        }
    }
    if cfg.store.table.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "store.table must not be empty".to_string(),
        ));
    }
    if cfg.store.timeout_ms == 0 || cfg.telegram.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "store.timeout_ms and telegram.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "telegram.bot_token is required (or set BOT_TOKEN)".to_string(),
        ));
    }
    match cfg.telegram.mode.as_str() {
        "webhook" => {}
        "polling" => {
            if cfg.telegram.public_url.is_some() {
                return Err(ConfigError::UnsupportedConfig(
                    "telegram.public_url registers a webhook and cannot be combined with telegram.mode=polling"
                        .to_string(),
                ));
            }
            if cfg.telegram.poll_timeout_s > 50 {
                return Err(ConfigError::UnsupportedConfig(
                    "telegram.poll_timeout_s must be <= 50".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "telegram.mode={other} is not supported; supported: webhook, polling"
            )));
        }
    }
    if let Some(url) = cfg.telegram.public_url.as_deref() {
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "telegram.public_url must be an http(s) URL, got {url}"
            )));
        }
    }
    // In polling mode an enforced secret with no value just closes /webhook.
    if !cfg.telegram.polling() && cfg.webhook.enforce_secret && is_blank(&cfg.webhook.secret) {
        return Err(ConfigError::UnsupportedConfig(
            "webhook.secret is required while webhook.enforce_secret=true".to_string(),
        ));
    }
    if !matches!(cfg.issuer.lookup_fail_mode.as_str(), "allow" | "deny") {
        return Err(ConfigError::UnsupportedConfig(format!(
            "issuer.lookup_fail_mode={} is not supported; supported: allow, deny",
            cfg.issuer.lookup_fail_mode
        )));
    }
    if !matches!(cfg.log.format.as_str(), "text" | "json") {
        return Err(ConfigError::UnsupportedConfig(format!(
            "log.format={} is not supported; supported: text, json",
            cfg.log.format
        )));
    }
    Ok(())
}
