//! Screen configuration.
//!
//! Everything the core needs comes from the environment: the order API base
//! URL, the streaming base URL, the shared branch key and the display URL the
//! branch id is taken from. A single connection string (JSON, or URL-safe
//! base64 of that JSON) can supply the same fields at once; explicit variables
//! win over it. The branch key falls back to the OS credential store.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::Value;
use zeroize::Zeroizing;

use crate::channel::DEFAULT_RECONNECT_DELAY;
use crate::error::{Result, ScreenError};
use crate::filter::LaneWindows;
use crate::queue::{DEFAULT_BACKLOG_CAP, DEFAULT_DISPLAY_DURATION};
use crate::storage;

pub const ENV_API_URL: &str = "CUSTOMER_SCREEN_API_URL";
pub const ENV_SOCKET_URL: &str = "CUSTOMER_SCREEN_SOCKET_URL";
pub const ENV_BRANCH_KEY: &str = "CUSTOMER_SCREEN_BRANCH_KEY";
pub const ENV_CONNECTION: &str = "CUSTOMER_SCREEN_CONNECTION";
pub const ENV_DISPLAY_URL: &str = "CUSTOMER_SCREEN_DISPLAY_URL";
pub const ENV_POLL_INTERVAL_MS: &str = "CUSTOMER_SCREEN_POLL_INTERVAL_MS";
pub const ENV_RECONNECT_DELAY_MS: &str = "CUSTOMER_SCREEN_RECONNECT_DELAY_MS";
pub const ENV_NOTIFICATION_MS: &str = "CUSTOMER_SCREEN_NOTIFICATION_MS";
pub const ENV_NOTIFICATION_BACKLOG: &str = "CUSTOMER_SCREEN_NOTIFICATION_BACKLOG";

/// Snapshot poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5_000);

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

/// Normalise a service base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.contains("://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Branch id = last non-empty path segment of the display URL
/// (`https://screen.example.com/display/12` -> `12`).
pub fn branch_id_from_display_url(display_url: &str) -> Option<String> {
    let trimmed = display_url.trim();
    let path = match url::Url::parse(trimmed) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => trimmed
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    path.split('/')
        .filter(|segment| !segment.trim().is_empty())
        .last()
        .map(|segment| segment.trim().to_string())
}

/// Show only the last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "unset".to_string();
    }
    let suffix: String = trimmed
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<char>>()
        .into_iter()
        .rev()
        .collect();
    format!("***{suffix}")
}

// ---------------------------------------------------------------------------
// Connection string
// ---------------------------------------------------------------------------

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

/// Fields a connection string may carry. All optional.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct ConnectionString {
    api_url: Option<String>,
    socket_url: Option<String>,
    key: Option<String>,
    branch_id: Option<String>,
}

fn string_field(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| match v.get(*k) {
            Some(Value::String(s)) => Some(s.trim().to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .find(|s| !s.is_empty())
}

fn parse_connection_string(raw: &str) -> Result<ConnectionString> {
    let payload = decode_connection_string_payload(raw).ok_or_else(|| {
        ScreenError::Config(format!("{ENV_CONNECTION} is not a valid connection string"))
    })?;
    Ok(ConnectionString {
        api_url: string_field(&payload, &["url", "apiUrl"]),
        socket_url: string_field(&payload, &["socketUrl"]),
        key: string_field(&payload, &["key"]),
        branch_id: string_field(&payload, &["branchId", "bid"]),
    })
}

// ---------------------------------------------------------------------------
// ScreenConfig
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ScreenConfig {
    pub api_base_url: String,
    pub socket_base_url: String,
    pub branch_id: String,
    pub branch_key: Zeroizing<String>,
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    pub notification_duration: Duration,
    /// `None` = unbounded backlog.
    pub notification_backlog: Option<usize>,
    pub lane_windows: LaneWindows,
}

impl fmt::Debug for ScreenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScreenConfig")
            .field("api_base_url", &self.api_base_url)
            .field("socket_base_url", &self.socket_base_url)
            .field("branch_id", &self.branch_id)
            .field("branch_key", &mask_secret(&self.branch_key))
            .field("poll_interval", &self.poll_interval)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("notification_duration", &self.notification_duration)
            .field("notification_backlog", &self.notification_backlog)
            .field("lane_windows", &self.lane_windows)
            .finish()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: Duration) -> Result<Duration> {
    match non_empty(lookup(name)) {
        None => Ok(default),
        Some(raw) => match raw.parse::<u64>() {
            Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
            _ => Err(ScreenError::Config(format!(
                "{name} must be a positive number of milliseconds, got {raw:?}"
            ))),
        },
    }
}

impl ScreenConfig {
    /// Load from process environment. `display_url` (usually the first CLI
    /// argument) takes precedence over `CUSTOMER_SCREEN_DISPLAY_URL`.
    pub fn from_env(display_url: Option<String>) -> Result<Self> {
        Self::from_lookup(
            |name| std::env::var(name).ok(),
            display_url,
            || storage::get_credential(storage::KEY_BRANCH_KEY),
        )
    }

    /// Load through an arbitrary variable lookup; `stored_key` is consulted
    /// only when neither the environment nor the connection string carry a key.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        display_url: Option<String>,
        stored_key: impl FnOnce() -> Option<String>,
    ) -> Result<Self> {
        let connection = match non_empty(lookup(ENV_CONNECTION)) {
            Some(raw) => parse_connection_string(&raw)?,
            None => ConnectionString::default(),
        };

        let api_base_url = non_empty(lookup(ENV_API_URL))
            .or(connection.api_url)
            .map(|u| normalize_base_url(&u))
            .ok_or_else(|| ScreenError::Config(format!("{ENV_API_URL} is not set")))?;

        let socket_base_url = non_empty(lookup(ENV_SOCKET_URL))
            .or(connection.socket_url)
            .map(|u| normalize_base_url(&u))
            .unwrap_or_else(|| api_base_url.clone());

        let branch_id = non_empty(display_url)
            .or_else(|| non_empty(lookup(ENV_DISPLAY_URL)))
            .and_then(|u| branch_id_from_display_url(&u))
            .or(connection.branch_id)
            .ok_or_else(|| {
                ScreenError::Config(format!(
                    "No branch id: pass the display URL (…/display/<branchId>) or set {ENV_DISPLAY_URL}"
                ))
            })?;

        let branch_key = non_empty(lookup(ENV_BRANCH_KEY))
            .or(connection.key)
            .or_else(|| non_empty(stored_key()))
            .map(Zeroizing::new)
            .ok_or_else(|| {
                ScreenError::Config(format!(
                    "{ENV_BRANCH_KEY} is not set and no branch key is stored"
                ))
            })?;

        let notification_backlog = match non_empty(lookup(ENV_NOTIFICATION_BACKLOG)) {
            None => Some(DEFAULT_BACKLOG_CAP),
            Some(raw) => match raw.parse::<usize>() {
                Ok(0) => None,
                Ok(cap) => Some(cap),
                Err(_) => {
                    return Err(ScreenError::Config(format!(
                        "{ENV_NOTIFICATION_BACKLOG} must be a whole number, got {raw:?}"
                    )))
                }
            },
        };

        Ok(Self {
            api_base_url,
            socket_base_url,
            branch_id,
            branch_key,
            poll_interval: millis(&lookup, ENV_POLL_INTERVAL_MS, DEFAULT_POLL_INTERVAL)?,
            reconnect_delay: millis(&lookup, ENV_RECONNECT_DELAY_MS, DEFAULT_RECONNECT_DELAY)?,
            notification_duration: millis(&lookup, ENV_NOTIFICATION_MS, DEFAULT_DISPLAY_DURATION)?,
            notification_backlog,
            lane_windows: LaneWindows::default(),
        })
    }
}
