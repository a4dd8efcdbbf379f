//! Best-effort network lookups for click enrichment. Every failure,
//! timeout or disabled lookup yields [`UNKNOWN`]; nothing here returns an
//! error to the caller.

use crate::config::LookupConfig;
use crate::signals::UNKNOWN;
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Lookups {
    enabled: bool,
    timeout: Duration,
    geo_endpoint: String,
}

impl Lookups {
    pub fn new(config: &LookupConfig) -> Self {
        Self {
            enabled: config.enabled,
            timeout: Duration::from_secs(config.timeout_seconds),
            geo_endpoint: config.geo_endpoint.clone(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            timeout: Duration::from_secs(0),
            geo_endpoint: String::new(),
        }
    }

    /// Country name for a client address.
    pub async fn country(&self, ip: &str) -> String {
        if !self.enabled {
            return UNKNOWN.to_string();
        }
        match ip.parse::<IpAddr>() {
            Ok(addr) if is_routable(&addr) => {}
            _ => {
                log::debug!("Skipping geo lookup for non-public address: {ip}");
                return UNKNOWN.to_string();
            }
        }

        let client = match reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("mailpixel/", env!("CARGO_PKG_VERSION")))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                log::warn!("Failed to create HTTP client for geo lookup: {e}");
                return UNKNOWN.to_string();
            }
        };

        let url = self.geo_endpoint.replace("{ip}", ip);
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) if !body.trim().is_empty() => body.trim().to_string(),
                Ok(_) => UNKNOWN.to_string(),
                Err(e) => {
                    log::debug!("Geo lookup body read failed for {ip}: {e}");
                    UNKNOWN.to_string()
                }
            },
            Ok(response) => {
                log::debug!("Geo lookup for {ip} returned {}", response.status());
                UNKNOWN.to_string()
            }
            Err(e) => {
                log::debug!("Geo lookup failed for {ip}: {e}");
                UNKNOWN.to_string()
            }
        }
    }

    /// Preferred mail exchanger for the domain of an email address.
    pub async fn mail_server(&self, email: &str) -> String {
        if !self.enabled {
            return UNKNOWN.to_string();
        }
        let Some(domain) = extract_domain(email) else {
            log::debug!("No domain in address '{email}', skipping MX lookup");
            return UNKNOWN.to_string();
        };

        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                log::warn!("Failed to create DNS resolver for {domain}: {e}");
                return UNKNOWN.to_string();
            }
        };

        match tokio::time::timeout(self.timeout, resolver.mx_lookup(domain.as_str())).await {
            Ok(Ok(response)) => response
                .iter()
                .min_by_key(|mx| mx.preference())
                .map(|mx| mx.exchange().to_utf8().trim_end_matches('.').to_string())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            Ok(Err(e)) => {
                log::debug!("MX lookup failed for {domain}: {e}");
                UNKNOWN.to_string()
            }
            Err(_) => {
                log::debug!("MX lookup timed out for {domain}");
                UNKNOWN.to_string()
            }
        }
    }
}

/// Lower-cased domain part of an email address.
pub fn extract_domain(email: &str) -> Option<String> {
    let at = email.rfind('@')?;
    if at == 0 {
        return None;
    }
    let domain = email[at + 1..].trim().trim_end_matches('>');
    if domain.contains('.')
        && domain.len() < 255
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        Some(domain.to_lowercase())
    } else {
        None
    }
}

fn is_routable(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified())
        }
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
    }
}
