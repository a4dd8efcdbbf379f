use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub lookups: LookupConfig,
    #[serde(default)]
    pub heuristics: HeuristicConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: String,
    /// Opens classified as suspicious are still stored, with the label
    /// appended to the user agent. When false they are dropped.
    #[serde(default = "default_true")]
    pub store_suspicious: bool,
    #[serde(default)]
    pub click_mode: ClickWriteMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClickWriteMode {
    /// Every click is a new row.
    #[default]
    Append,
    /// One row per (sender, recipient, token), with a click counter.
    Upsert,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_lookup_timeout")]
    pub timeout_seconds: u64,
    /// `{ip}` is replaced with the client address.
    #[serde(default = "default_geo_endpoint")]
    pub geo_endpoint: String,
}

/// The versioned ruleset behind the suspicion conditions. Every list is
/// matched as a lower-case substring, except `legacy_fingerprints` which
/// are regular expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConfig {
    pub proxy_markers: Vec<String>,
    pub browser_allow_list: Vec<String>,
    pub automation_deny_list: Vec<String>,
    pub legacy_fingerprints: Vec<String>,
    pub suspicious_delay_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    pub timezone: String,
}

fn default_true() -> bool {
    true
}

fn default_lookup_timeout() -> u64 {
    3
}

fn default_geo_endpoint() -> String {
    "https://ipapi.co/{ip}/country_name/".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5000".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "/var/lib/mailpixel/events.db".to_string(),
            store_suspicious: true,
            click_mode: ClickWriteMode::Append,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        // Links already in circulation were signed with this value.
        Self {
            secret: "clave-secreta".to_string(),
        }
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: default_lookup_timeout(),
            geo_endpoint: default_geo_endpoint(),
        }
    }
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        };
        Self {
            proxy_markers: strings(&["googleimageproxy", "ggpht.com"]),
            browser_allow_list: strings(&[
                "chrome",
                "safari",
                "firefox",
                "edge",
                "android",
                "iphone",
                "ios",
                "applewebkit",
                "mozilla",
            ]),
            automation_deny_list: strings(&[
                "bot",
                "scanner",
                "proxy",
                "fetch",
                "curl",
                "python",
                "requests",
                "defender",
                "antivirus",
                "microsoft office",
                "ms-office",
                "libwww",
            ]),
            legacy_fingerprints: strings(&[
                r"windows nt 5\.1; rv:11\.0\)",
                r"msie 6\.0; windows nt 5\.1",
            ]),
            suspicious_delay_seconds: 2,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            timezone: "America/Santiago".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            token: TokenConfig::default(),
            lookups: LookupConfig::default(),
            heuristics: HeuristicConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML config: {path}"))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Environment overrides, applied after the file is read.
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            self.storage.database_path = path;
        }
        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            self.server.listen_addr = addr;
        } else if let Ok(port) = std::env::var("PORT") {
            self.server.listen_addr = format!("0.0.0.0:{port}");
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.report_timezone()?;
        if self.token.secret.is_empty() {
            return Err(anyhow!("token.secret must not be empty"));
        }
        let heuristics = &self.heuristics;
        if heuristics.browser_allow_list.is_empty() {
            return Err(anyhow!(
                "heuristics.browser_allow_list is empty; every user agent would be invalid"
            ));
        }
        if heuristics.proxy_markers.is_empty() {
            return Err(anyhow!(
                "heuristics.proxy_markers is empty; proxy prefetches would never be flagged"
            ));
        }
        if heuristics.automation_deny_list.is_empty() {
            return Err(anyhow!(
                "heuristics.automation_deny_list is empty; automated clients would never be flagged"
            ));
        }
        for pattern in &self.heuristics.legacy_fingerprints {
            regex::Regex::new(pattern)
                .with_context(|| format!("Invalid legacy fingerprint pattern: {pattern}"))?;
        }
        Ok(())
    }

    pub fn report_timezone(&self) -> anyhow::Result<chrono_tz::Tz> {
        self.report
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow!("Invalid report.timezone '{}': {e}", self.report.timezone))
    }
}
