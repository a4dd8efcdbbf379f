use crate::aggregator::{group_opens, OpenGroup};
use crate::config::ClickWriteMode;
use crate::events::{ClickEvent, OpenEvent};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};

/// Append-only event store. Each operation opens its own connection and
/// drops it before returning, whatever the outcome.
#[derive(Debug, Clone)]
pub struct EventStore {
    db_path: PathBuf,
}

/// Row cap for the raw listings.
pub const LISTING_LIMIT: usize = 100;

const OPEN_COLUMNS: &str =
    "sender, recipient, sent_at, opened_at, delay_seconds, client_ip, user_agent";

const CLICK_COLUMNS: &str = "sender, recipient, url, clicked_at, sent_at, browser, os, country, \
     mail_server, client_ip, token, user_agent, click_count";

impl EventStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .with_context(|| format!("Failed to open event database: {}", self.db_path.display()))
    }

    /// Create the database file, tables and indexes if missing.
    pub fn init(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS opens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                delay_seconds INTEGER NOT NULL,
                client_ip TEXT,
                user_agent TEXT,
                recorded_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS opens_pair ON opens (lower(sender), lower(recipient));
            CREATE INDEX IF NOT EXISTS opens_opened_at ON opens (opened_at);

            CREATE TABLE IF NOT EXISTS clicks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                url TEXT NOT NULL,
                clicked_at TEXT NOT NULL,
                sent_at TEXT,
                browser TEXT,
                os TEXT,
                country TEXT,
                mail_server TEXT,
                client_ip TEXT,
                token TEXT NOT NULL,
                user_agent TEXT,
                click_count INTEGER NOT NULL DEFAULT 1,
                deduplicated INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS clicks_clicked_at ON clicks (clicked_at);
            CREATE UNIQUE INDEX IF NOT EXISTS clicks_dedup
                ON clicks (sender, recipient, token) WHERE deduplicated = 1;",
        )
        .context("Failed to create event tables")?;
        Ok(())
    }

    pub fn ping(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    pub fn insert_open(&self, event: &OpenEvent) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            &format!("INSERT INTO opens ({OPEN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                event.sender,
                event.recipient,
                encode_time(&event.sent_at),
                encode_time(&event.opened_at),
                event.delay_seconds,
                event.client_ip,
                event.user_agent,
            ],
        )
        .context("Failed to insert open event")?;
        Ok(())
    }

    /// Append mode always inserts. Upsert mode keeps one row per
    /// (sender, recipient, token) through a partial unique index, so
    /// concurrent clicks on the same link cannot double-insert.
    pub fn record_click(&self, event: &ClickEvent, mode: ClickWriteMode) -> Result<()> {
        let conn = self.connect()?;
        let sql = match mode {
            ClickWriteMode::Append => format!(
                "INSERT INTO clicks ({CLICK_COLUMNS}, deduplicated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1, 0)"
            ),
            ClickWriteMode::Upsert => format!(
                "INSERT INTO clicks ({CLICK_COLUMNS}, deduplicated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1, 1)
                 ON CONFLICT (sender, recipient, token) WHERE deduplicated = 1 DO UPDATE SET
                     url = excluded.url,
                     clicked_at = excluded.clicked_at,
                     sent_at = COALESCE(excluded.sent_at, clicks.sent_at),
                     browser = excluded.browser,
                     os = excluded.os,
                     country = excluded.country,
                     mail_server = excluded.mail_server,
                     client_ip = excluded.client_ip,
                     user_agent = excluded.user_agent,
                     click_count = clicks.click_count + 1"
            ),
        };
        conn.execute(
            &sql,
            params![
                event.sender,
                event.recipient,
                event.url,
                encode_time(&event.clicked_at),
                event.sent_at.as_ref().map(encode_time),
                event.browser,
                event.os,
                event.country,
                event.mail_server,
                event.client_ip,
                event.token,
                event.user_agent,
            ],
        )
        .context("Failed to record click event")?;
        Ok(())
    }

    /// Every raw open belonging to the `limit` sender/recipient pairs with
    /// the most recent first open, folded into groups.
    pub fn grouped_opens(&self, limit: usize) -> Result<Vec<OpenGroup>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPEN_COLUMNS} FROM opens
             WHERE (lower(sender), lower(recipient)) IN (
                 SELECT lower(sender), lower(recipient) FROM opens
                 GROUP BY lower(sender), lower(recipient)
                 ORDER BY MIN(opened_at) DESC, lower(sender), lower(recipient)
                 LIMIT ?1
             )"
        ))?;
        let events = stmt
            .query_map(params![limit as i64], open_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read open events")?;
        Ok(group_opens(events))
    }

    pub fn recent_opens(&self, limit: usize) -> Result<Vec<OpenEvent>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPEN_COLUMNS} FROM opens ORDER BY opened_at DESC, id DESC LIMIT ?1"
        ))?;
        let events = stmt
            .query_map(params![limit as i64], open_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read open events")?;
        Ok(events)
    }

    pub fn recent_clicks(&self, limit: usize) -> Result<Vec<ClickEvent>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CLICK_COLUMNS} FROM clicks ORDER BY clicked_at DESC, id DESC LIMIT ?1"
        ))?;
        let events = stmt
            .query_map(params![limit as i64], click_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read click events")?;
        Ok(events)
    }
}

/// Fixed-width UTC text, so lexical order is chronological order.
fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn open_from_row(row: &Row<'_>) -> rusqlite::Result<OpenEvent> {
    Ok(OpenEvent {
        sender: row.get(0)?,
        recipient: row.get(1)?,
        sent_at: decode_time(2, &row.get::<_, String>(2)?)?,
        opened_at: decode_time(3, &row.get::<_, String>(3)?)?,
        delay_seconds: row.get(4)?,
        client_ip: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        user_agent: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
    })
}

fn click_from_row(row: &Row<'_>) -> rusqlite::Result<ClickEvent> {
    let text = |idx: usize| -> rusqlite::Result<String> {
        Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
    };
    Ok(ClickEvent {
        sender: row.get(0)?,
        recipient: row.get(1)?,
        url: row.get(2)?,
        clicked_at: decode_time(3, &row.get::<_, String>(3)?)?,
        sent_at: match row.get::<_, Option<String>>(4)? {
            Some(s) => Some(decode_time(4, &s)?),
            None => None,
        },
        browser: text(5)?,
        os: text(6)?,
        country: text(7)?,
        mail_server: text(8)?,
        client_ip: text(9)?,
        token: row.get(10)?,
        user_agent: text(11)?,
        click_count: row.get(12)?,
    })
}
