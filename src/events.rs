use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// One pixel fetch. Created once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenEvent {
    pub sender: String,
    pub recipient: String,
    pub sent_at: DateTime<Utc>,
    pub opened_at: DateTime<Utc>,
    /// `opened_at - sent_at`; negative when the client claims a future send.
    pub delay_seconds: i64,
    pub client_ip: String,
    /// Stored text: the raw user agent plus the appended audit label.
    pub user_agent: String,
}

impl OpenEvent {
    pub fn new(
        sender: &str,
        recipient: &str,
        sent_at: DateTime<Utc>,
        opened_at: DateTime<Utc>,
        client_ip: &str,
        user_agent: &str,
    ) -> Self {
        Self {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            sent_at,
            opened_at,
            delay_seconds: delay_seconds(sent_at, opened_at),
            client_ip: client_ip.to_string(),
            user_agent: user_agent.to_string(),
        }
    }
}

/// One tracked-link follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickEvent {
    pub sender: String,
    pub recipient: String,
    pub url: String,
    pub clicked_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub browser: String,
    pub os: String,
    pub country: String,
    /// Mail exchanger of the recipient's domain, best-effort.
    pub mail_server: String,
    pub client_ip: String,
    pub token: String,
    pub user_agent: String,
    /// Always 1 in append mode; incremented on conflict in upsert mode.
    pub click_count: i64,
}

pub fn delay_seconds(sent_at: DateTime<Utc>, opened_at: DateTime<Utc>) -> i64 {
    (opened_at - sent_at).num_seconds()
}

/// Parse the client-supplied send time. Accepts RFC 3339 and naive ISO
/// timestamps (read as UTC). Unparseable or missing values fall back to
/// `received_at`. The value is never checked against a dispatch record.
pub fn parse_sent(raw: Option<&str>, received_at: DateTime<Utc>) -> DateTime<Utc> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(value) => parse_timestamp(value).unwrap_or_else(|| {
            log::debug!("Unparseable sent timestamp '{value}', using receipt time");
            received_at
        }),
        None => received_at,
    }
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}
