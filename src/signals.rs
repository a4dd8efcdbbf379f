//! User-agent signal extraction.
//!
//! All matching is case-insensitive substring matching over ordered rule
//! lists; the first rule that matches wins.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const UNKNOWN: &str = "Unknown";

/// Browser and OS labels derived from a user agent, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientLabels {
    pub browser: String,
    pub os: String,
}

/// Device class used by the aggregation report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    Windows,
    Android,
    #[serde(rename = "iOS")]
    Ios,
    Mac,
    Linux,
    Mobile,
    Other,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Windows => "Windows",
            DeviceClass::Android => "Android",
            DeviceClass::Ios => "iOS",
            DeviceClass::Mac => "Mac",
            DeviceClass::Linux => "Linux",
            DeviceClass::Mobile => "Mobile",
            DeviceClass::Other => "Other",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct SignalExtractor;

impl SignalExtractor {
    pub fn browser(user_agent: &str) -> &'static str {
        let ua = user_agent.to_lowercase();
        if ua.contains("chrome") && !ua.contains("edg") {
            "Chrome"
        } else if ua.contains("firefox") {
            "Firefox"
        } else if ua.contains("safari") && !ua.contains("chrome") {
            "Safari"
        } else if ua.contains("edg") {
            "Edge"
        } else if ua.contains("opera") {
            "Opera"
        } else {
            UNKNOWN
        }
    }

    pub fn os(user_agent: &str) -> &'static str {
        match Self::os_class(&user_agent.to_lowercase()) {
            Some(class) => class.as_str(),
            None => UNKNOWN,
        }
    }

    pub fn labels(user_agent: &str) -> ClientLabels {
        ClientLabels {
            browser: Self::browser(user_agent).to_string(),
            os: Self::os(user_agent).to_string(),
        }
    }

    /// Device class for one user agent. Same ordering as the OS rules,
    /// with a generic mobile bucket before the fallback.
    pub fn device(user_agent: &str) -> DeviceClass {
        let ua = user_agent.to_lowercase();
        if let Some(class) = Self::os_class(&ua) {
            return class;
        }
        if ua.contains("mobile") {
            DeviceClass::Mobile
        } else {
            DeviceClass::Other
        }
    }

    /// Distinct device classes over a batch, in order of first appearance.
    pub fn device_set<'a, I>(user_agents: I) -> DeviceSet
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut set = DeviceSet::default();
        for ua in user_agents {
            set.insert(Self::device(ua));
        }
        set
    }

    fn os_class(ua_lower: &str) -> Option<DeviceClass> {
        if ua_lower.contains("windows") {
            Some(DeviceClass::Windows)
        } else if ua_lower.contains("android") {
            Some(DeviceClass::Android)
        } else if ["iphone", "ipad", "ios"].iter().any(|t| ua_lower.contains(t)) {
            Some(DeviceClass::Ios)
        } else if ua_lower.contains("macintosh") || ua_lower.contains("mac os") {
            Some(DeviceClass::Mac)
        } else if ua_lower.contains("linux") {
            Some(DeviceClass::Linux)
        } else {
            None
        }
    }
}

/// Insertion-ordered set of device classes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSet(Vec<DeviceClass>);

impl DeviceSet {
    pub fn insert(&mut self, class: DeviceClass) -> bool {
        if self.contains(class) {
            return false;
        }
        self.0.push(class);
        true
    }

    pub fn contains(&self, class: DeviceClass) -> bool {
        self.0.contains(&class)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[DeviceClass] {
        &self.0
    }

    pub fn join(&self, separator: &str) -> String {
        self.0
            .iter()
            .map(DeviceClass::as_str)
            .collect::<Vec<_>>()
            .join(separator)
    }
}

impl fmt::Display for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_WIN: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const EDGE_WIN: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0";
    const SAFARI_IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
    const CHROME_ANDROID: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";
    const FIREFOX_LINUX: &str = "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";
    const SAFARI_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_1) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15";

    #[test]
    fn test_browser_rules() {
        assert_eq!(SignalExtractor::browser(CHROME_WIN), "Chrome");
        assert_eq!(SignalExtractor::browser(EDGE_WIN), "Edge");
        assert_eq!(SignalExtractor::browser(SAFARI_IPHONE), "Safari");
        assert_eq!(SignalExtractor::browser(FIREFOX_LINUX), "Firefox");
        assert_eq!(SignalExtractor::browser("Opera/9.80 (X11)"), "Opera");
        assert_eq!(SignalExtractor::browser("curl/8.4.0"), UNKNOWN);
        assert_eq!(SignalExtractor::browser(""), UNKNOWN);
    }

    #[test]
    fn test_os_rules() {
        assert_eq!(SignalExtractor::os(CHROME_WIN), "Windows");
        assert_eq!(SignalExtractor::os(CHROME_ANDROID), "Android");
        assert_eq!(SignalExtractor::os(SAFARI_IPHONE), "iOS");
        assert_eq!(SignalExtractor::os(SAFARI_MAC), "Mac");
        assert_eq!(SignalExtractor::os(FIREFOX_LINUX), "Linux");
        assert_eq!(SignalExtractor::os("curl/8.4.0"), UNKNOWN);
    }

    #[test]
    fn test_device_mobile_bucket() {
        assert_eq!(
            SignalExtractor::device("SomePhone/1.0 Mobile"),
            DeviceClass::Mobile
        );
        assert_eq!(SignalExtractor::device("curl/8.4.0"), DeviceClass::Other);
    }

    #[test]
    fn test_device_set_dedups_in_first_seen_order() {
        let set = SignalExtractor::device_set([SAFARI_IPHONE, SAFARI_IPHONE, CHROME_ANDROID]);
        assert_eq!(set.as_slice(), &[DeviceClass::Ios, DeviceClass::Android]);
        assert_eq!(set.to_string(), "iOS, Android");
        assert_eq!(set.len(), 2);
        assert!(set.contains(DeviceClass::Android));
        assert!(!set.contains(DeviceClass::Windows));
    }

    #[test]
    fn test_empty_device_set() {
        let set = SignalExtractor::device_set(std::iter::empty());
        assert!(set.is_empty());
        assert_eq!(set.to_string(), "");
    }
}
