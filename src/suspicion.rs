//! Suspicion conditions for a single pixel fetch.
//!
//! Each condition is an independent rule over an [`OpenAttempt`]. The
//! evaluator runs every rule and keeps every result; nothing short-circuits.

use crate::config::HeuristicConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Declaration order is the order conditions appear in a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SuspicionCondition {
    SameParty,
    KnownProxySignature,
    InvalidUserAgent,
    BlacklistedUserAgent,
    SuspiciousDelay,
    LegacyBrowserSignature,
    EmptyUserAgent,
}

impl SuspicionCondition {
    pub const ALL: [SuspicionCondition; 7] = [
        SuspicionCondition::SameParty,
        SuspicionCondition::KnownProxySignature,
        SuspicionCondition::InvalidUserAgent,
        SuspicionCondition::BlacklistedUserAgent,
        SuspicionCondition::SuspiciousDelay,
        SuspicionCondition::LegacyBrowserSignature,
        SuspicionCondition::EmptyUserAgent,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SuspicionCondition::SameParty => "sameParty",
            SuspicionCondition::KnownProxySignature => "knownProxySignature",
            SuspicionCondition::InvalidUserAgent => "invalidUserAgent",
            SuspicionCondition::BlacklistedUserAgent => "blacklistedUserAgent",
            SuspicionCondition::SuspiciousDelay => "suspiciousDelay",
            SuspicionCondition::LegacyBrowserSignature => "legacyBrowserSignature",
            SuspicionCondition::EmptyUserAgent => "emptyUserAgent",
        }
    }

    /// Conditions that depend on nothing but the user agent text and are
    /// re-checked when reading stored rows.
    pub fn is_user_agent_intrinsic(&self) -> bool {
        matches!(
            self,
            SuspicionCondition::InvalidUserAgent
                | SuspicionCondition::BlacklistedUserAgent
                | SuspicionCondition::EmptyUserAgent
        )
    }
}

impl fmt::Display for SuspicionCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a rule may look at.
#[derive(Debug, Clone, Default)]
pub struct OpenAttempt {
    pub sender: String,
    pub recipient: String,
    pub delay_seconds: i64,
    pub user_agent: Option<String>,
}

impl OpenAttempt {
    pub fn new(
        sender: &str,
        recipient: &str,
        delay_seconds: i64,
        user_agent: Option<&str>,
    ) -> Self {
        Self {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            delay_seconds,
            user_agent: user_agent.map(str::to_string),
        }
    }

    /// Only the user agent is known; parties and delay are neutral.
    pub fn user_agent_only(user_agent: &str) -> Self {
        Self {
            user_agent: Some(user_agent.to_string()),
            ..Default::default()
        }
    }

    fn user_agent_lower(&self) -> String {
        self.user_agent
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_default()
    }
}

/// Named outcome of every condition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SuspicionVerdict {
    conditions: BTreeMap<SuspicionCondition, bool>,
}

impl SuspicionVerdict {
    pub fn set(&mut self, condition: SuspicionCondition, value: bool) {
        self.conditions.insert(condition, value);
    }

    pub fn get(&self, condition: SuspicionCondition) -> bool {
        self.conditions.get(&condition).copied().unwrap_or(false)
    }

    /// Triggered conditions in declaration order.
    pub fn triggered(&self) -> Vec<SuspicionCondition> {
        self.conditions
            .iter()
            .filter(|(_, &hit)| hit)
            .map(|(condition, _)| *condition)
            .collect()
    }

    pub fn any(&self) -> bool {
        self.conditions.values().any(|&hit| hit)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SuspicionCondition, bool)> + '_ {
        self.conditions.iter().map(|(c, v)| (*c, *v))
    }
}

pub trait SuspicionRule: Send + Sync {
    fn condition(&self) -> SuspicionCondition;
    fn check(&self, attempt: &OpenAttempt) -> bool;
}

struct SamePartyRule;

impl SuspicionRule for SamePartyRule {
    fn condition(&self) -> SuspicionCondition {
        SuspicionCondition::SameParty
    }

    fn check(&self, attempt: &OpenAttempt) -> bool {
        attempt.sender.eq_ignore_ascii_case(&attempt.recipient)
    }
}

/// Fires when the user agent contains any of `needles`.
struct ContainsAnyRule {
    condition: SuspicionCondition,
    needles: Vec<String>,
}

impl SuspicionRule for ContainsAnyRule {
    fn condition(&self) -> SuspicionCondition {
        self.condition
    }

    fn check(&self, attempt: &OpenAttempt) -> bool {
        let ua = attempt.user_agent_lower();
        self.needles.iter().any(|needle| ua.contains(needle.as_str()))
    }
}

/// Closed-world allow-list: anything not naming a known browser is invalid,
/// including genuine browsers that are not on the list.
struct AllowListRule {
    allowed: Vec<String>,
}

impl SuspicionRule for AllowListRule {
    fn condition(&self) -> SuspicionCondition {
        SuspicionCondition::InvalidUserAgent
    }

    fn check(&self, attempt: &OpenAttempt) -> bool {
        let ua = attempt.user_agent_lower();
        !self.allowed.iter().any(|token| ua.contains(token.as_str()))
    }
}

struct EmptyUserAgentRule;

impl SuspicionRule for EmptyUserAgentRule {
    fn condition(&self) -> SuspicionCondition {
        SuspicionCondition::EmptyUserAgent
    }

    fn check(&self, attempt: &OpenAttempt) -> bool {
        attempt.user_agent.as_deref().map_or(true, str::is_empty)
    }
}

struct DelayRule {
    threshold_seconds: i64,
}

impl SuspicionRule for DelayRule {
    fn condition(&self) -> SuspicionCondition {
        SuspicionCondition::SuspiciousDelay
    }

    fn check(&self, attempt: &OpenAttempt) -> bool {
        attempt.delay_seconds < self.threshold_seconds
    }
}

struct FingerprintRule {
    patterns: Vec<Regex>,
}

impl SuspicionRule for FingerprintRule {
    fn condition(&self) -> SuspicionCondition {
        SuspicionCondition::LegacyBrowserSignature
    }

    fn check(&self, attempt: &OpenAttempt) -> bool {
        let ua = attempt.user_agent_lower();
        self.patterns.iter().any(|re| re.is_match(&ua))
    }
}

pub struct SuspicionEvaluator {
    rules: Vec<Box<dyn SuspicionRule>>,
}

impl SuspicionEvaluator {
    pub fn from_config(config: &HeuristicConfig) -> anyhow::Result<Self> {
        let lower = |items: &[String]| -> Vec<String> {
            items.iter().map(|s| s.to_lowercase()).collect()
        };

        let mut patterns = Vec::with_capacity(config.legacy_fingerprints.len());
        for pattern in &config.legacy_fingerprints {
            patterns.push(Regex::new(&pattern.to_lowercase())?);
        }

        let mut rules: Vec<Box<dyn SuspicionRule>> = vec![
            Box::new(SamePartyRule),
            Box::new(ContainsAnyRule {
                condition: SuspicionCondition::KnownProxySignature,
                needles: lower(&config.proxy_markers),
            }),
            Box::new(AllowListRule {
                allowed: lower(&config.browser_allow_list),
            }),
            Box::new(ContainsAnyRule {
                condition: SuspicionCondition::BlacklistedUserAgent,
                needles: lower(&config.automation_deny_list),
            }),
            Box::new(DelayRule {
                threshold_seconds: config.suspicious_delay_seconds,
            }),
            Box::new(FingerprintRule { patterns }),
            Box::new(EmptyUserAgentRule),
        ];
        rules.sort_by_key(|rule| rule.condition());

        Ok(Self { rules })
    }

    pub fn evaluate(&self, attempt: &OpenAttempt) -> SuspicionVerdict {
        let mut verdict = SuspicionVerdict::default();
        for rule in &self.rules {
            verdict.set(rule.condition(), rule.check(attempt));
        }
        verdict
    }

    /// Evaluate only the user-agent-intrinsic conditions.
    pub fn evaluate_user_agent(&self, user_agent: &str) -> SuspicionVerdict {
        let attempt = OpenAttempt::user_agent_only(user_agent);
        let mut verdict = SuspicionVerdict::default();
        for rule in self
            .rules
            .iter()
            .filter(|rule| rule.condition().is_user_agent_intrinsic())
        {
            verdict.set(rule.condition(), rule.check(&attempt));
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const GMAIL_PROXY: &str =
        "Mozilla/5.0 (Windows NT 5.1; rv:11.0) Gecko Firefox/11.0 (via ggpht.com GoogleImageProxy)";

    fn evaluator() -> SuspicionEvaluator {
        SuspicionEvaluator::from_config(&HeuristicConfig::default()).unwrap()
    }

    #[test]
    fn test_genuine_open_triggers_nothing() {
        let verdict =
            evaluator().evaluate(&OpenAttempt::new("a@x.com", "b@y.com", 30, Some(CHROME)));
        assert!(!verdict.any());
        let evaluated: Vec<SuspicionCondition> = verdict.iter().map(|(c, _)| c).collect();
        assert_eq!(evaluated, SuspicionCondition::ALL);
    }

    #[test]
    fn test_same_party_is_case_insensitive() {
        let verdict =
            evaluator().evaluate(&OpenAttempt::new("A@X.com", "a@x.COM", 30, Some(CHROME)));
        assert_eq!(verdict.triggered(), vec![SuspicionCondition::SameParty]);
    }

    #[test]
    fn test_same_party_folds_ascii_only() {
        let verdict =
            evaluator().evaluate(&OpenAttempt::new("ÉL@x.com", "él@x.com", 30, Some(CHROME)));
        assert!(!verdict.get(SuspicionCondition::SameParty));
    }

    #[test]
    fn test_proxy_marker_detected() {
        let verdict =
            evaluator().evaluate(&OpenAttempt::new("a@x.com", "b@y.com", 600, Some(GMAIL_PROXY)));
        assert!(!verdict.get(SuspicionCondition::SameParty));
        assert!(verdict.get(SuspicionCondition::KnownProxySignature));
        // "GoogleImageProxy" also hits the deny-list and the legacy fingerprint.
        assert!(verdict.get(SuspicionCondition::BlacklistedUserAgent));
        assert!(verdict.get(SuspicionCondition::LegacyBrowserSignature));
    }

    #[test]
    fn test_delay_threshold() {
        let eval = evaluator();
        for delay in [-5, 0, 1] {
            let verdict =
                eval.evaluate(&OpenAttempt::new("a@x.com", "b@y.com", delay, Some(CHROME)));
            assert_eq!(verdict.triggered(), vec![SuspicionCondition::SuspiciousDelay]);
        }
        let verdict = eval.evaluate(&OpenAttempt::new("a@x.com", "b@y.com", 2, Some(CHROME)));
        assert!(!verdict.any());
    }

    #[test]
    fn test_empty_user_agent_is_also_invalid() {
        let eval = evaluator();
        for ua in [None, Some("")] {
            let verdict = eval.evaluate(&OpenAttempt::new("a@x.com", "b@y.com", 30, ua));
            assert_eq!(
                verdict.triggered(),
                vec![
                    SuspicionCondition::InvalidUserAgent,
                    SuspicionCondition::EmptyUserAgent
                ]
            );
        }
    }

    #[test]
    fn test_unknown_client_is_invalid() {
        let attempt = OpenAttempt::new("a@x.com", "b@y.com", 30, Some("NetNewsWire"));
        let verdict = evaluator().evaluate(&attempt);
        assert_eq!(verdict.triggered(), vec![SuspicionCondition::InvalidUserAgent]);
    }

    #[test]
    fn test_deny_list_tokens() {
        let eval = evaluator();
        for ua in ["curl/8.4.0", "python-requests/2.31", "Mozilla/5.0 (compatible; bingbot/2.0)"] {
            let verdict = eval.evaluate(&OpenAttempt::new("a@x.com", "b@y.com", 30, Some(ua)));
            assert!(verdict.get(SuspicionCondition::BlacklistedUserAgent), "{ua}");
        }
    }

    #[test]
    fn test_user_agent_only_evaluation_ignores_parties_and_delay() {
        let verdict = evaluator().evaluate_user_agent(CHROME);
        assert!(!verdict.any());
        assert_eq!(verdict.iter().count(), 3);
        assert!(verdict
            .iter()
            .all(|(condition, _)| condition.is_user_agent_intrinsic()));
    }

    #[test]
    fn test_threshold_is_configurable() {
        let config = HeuristicConfig {
            suspicious_delay_seconds: 10,
            ..HeuristicConfig::default()
        };
        let eval = SuspicionEvaluator::from_config(&config).unwrap();
        let verdict = eval.evaluate(&OpenAttempt::new("a@x.com", "b@y.com", 5, Some(CHROME)));
        assert!(verdict.get(SuspicionCondition::SuspiciousDelay));
    }
}
