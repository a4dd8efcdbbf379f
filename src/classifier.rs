use crate::config::HeuristicConfig;
use crate::suspicion::{OpenAttempt, SuspicionCondition, SuspicionEvaluator, SuspicionVerdict};
use std::fmt;

const AUDIT_SEPARATOR: &str = " | ";
const VALID_LABEL: &str = "Valid";
const SUSPICIOUS_PREFIX: &str = "Suspicious: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenLabel {
    Valid,
    /// Triggered conditions, in declaration order.
    Suspicious(Vec<SuspicionCondition>),
}

impl OpenLabel {
    pub fn from_verdict(verdict: &SuspicionVerdict) -> Self {
        let triggered = verdict.triggered();
        if triggered.is_empty() {
            OpenLabel::Valid
        } else {
            OpenLabel::Suspicious(triggered)
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, OpenLabel::Valid)
    }
}

impl fmt::Display for OpenLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenLabel::Valid => f.write_str(VALID_LABEL),
            OpenLabel::Suspicious(conditions) => {
                let names: Vec<&str> = conditions.iter().map(|c| c.name()).collect();
                write!(f, "{SUSPICIOUS_PREFIX}{}", names.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub verdict: SuspicionVerdict,
    pub label: OpenLabel,
}

impl Classification {
    pub fn is_genuine(&self) -> bool {
        self.label.is_valid()
    }
}

/// Append the audit label to the user agent for storage.
pub fn append_label(user_agent: &str, label: &OpenLabel) -> String {
    format!("{user_agent}{AUDIT_SEPARATOR}{label}")
}

/// Recover the raw user agent from stored text. Rows written before
/// labelling carry no suffix and come back unchanged.
pub fn strip_label(stored: &str) -> &str {
    match stored.rfind(AUDIT_SEPARATOR) {
        Some(idx) => {
            let tail = &stored[idx + AUDIT_SEPARATOR.len()..];
            if tail == VALID_LABEL || tail.starts_with(SUSPICIOUS_PREFIX) {
                &stored[..idx]
            } else {
                stored
            }
        }
        None => stored,
    }
}

pub struct OpenClassifier {
    evaluator: SuspicionEvaluator,
}

impl OpenClassifier {
    pub fn new(evaluator: SuspicionEvaluator) -> Self {
        Self { evaluator }
    }

    pub fn from_config(config: &HeuristicConfig) -> anyhow::Result<Self> {
        Ok(Self::new(SuspicionEvaluator::from_config(config)?))
    }

    /// Write-time decision: any of the seven conditions makes the open suspicious.
    pub fn classify(&self, attempt: &OpenAttempt) -> Classification {
        let verdict = self.evaluator.evaluate(attempt);
        let label = OpenLabel::from_verdict(&verdict);
        log::debug!(
            "Classified open {} -> {}: {}",
            attempt.sender,
            attempt.recipient,
            label
        );
        Classification { verdict, label }
    }

    /// Read-time filter over stored user-agent text. Only the conditions
    /// intrinsic to the user agent are re-checked; the stored label is
    /// ignored.
    pub fn is_trustworthy(&self, stored_user_agent: &str) -> bool {
        let raw = strip_label(stored_user_agent);
        !self.evaluator.evaluate_user_agent(raw).any()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    fn classifier() -> OpenClassifier {
        OpenClassifier::from_config(&HeuristicConfig::default()).unwrap()
    }

    #[test]
    fn test_valid_label() {
        let result =
            classifier().classify(&OpenAttempt::new("a@x.com", "b@y.com", 10, Some(CHROME)));
        assert!(result.is_genuine());
        assert_eq!(result.label.to_string(), "Valid");
    }

    #[test]
    fn test_label_lists_conditions_in_declaration_order() {
        let result = classifier().classify(&OpenAttempt::new("a@x.com", "a@x.com", 0, Some("")));
        assert_eq!(
            result.label.to_string(),
            "Suspicious: sameParty, invalidUserAgent, suspiciousDelay, emptyUserAgent"
        );
    }

    #[test]
    fn test_proxy_marker_is_always_suspicious() {
        let c = classifier();
        for ua in [
            "Mozilla/5.0 (Windows NT 10.0) Chrome/120.0 GoogleImageProxy",
            "Mozilla/5.0 Safari (via ggpht.com)",
        ] {
            let result = c.classify(&OpenAttempt::new("a@x.com", "b@y.com", 3600, Some(ua)));
            assert!(result.verdict.get(SuspicionCondition::KnownProxySignature));
            assert!(!result.verdict.get(SuspicionCondition::SameParty));
            assert!(!result.is_genuine());
        }
    }

    #[test]
    fn test_audit_label_roundtrip() {
        let label = OpenLabel::Suspicious(vec![SuspicionCondition::SameParty]);
        let stored = append_label(CHROME, &label);
        assert_eq!(stored, format!("{CHROME} | Suspicious: sameParty"));
        assert_eq!(strip_label(&stored), CHROME);
        assert_eq!(strip_label(&append_label(CHROME, &OpenLabel::Valid)), CHROME);
    }

    #[test]
    fn test_strip_label_leaves_unlabelled_rows() {
        assert_eq!(strip_label(CHROME), CHROME);
        assert_eq!(strip_label("foo | bar"), "foo | bar");
        assert_eq!(strip_label(""), "");
    }

    #[test]
    fn test_is_trustworthy() {
        let c = classifier();
        assert!(c.is_trustworthy(CHROME));
        assert!(!c.is_trustworthy(""));
        assert!(!c.is_trustworthy("curl/8.4.0"));
        assert!(!c.is_trustworthy("Mozilla/5.0 (compatible; Googlebot/2.1)"));
        assert!(!c.is_trustworthy("NetNewsWire/6.1"));
    }

    #[test]
    fn test_read_time_filter_ignores_write_time_only_conditions() {
        let c = classifier();
        let result = c.classify(&OpenAttempt::new("a@x.com", "A@x.com", 0, Some(CHROME)));
        assert_eq!(
            result.label.to_string(),
            "Suspicious: sameParty, suspiciousDelay"
        );
        let stored = append_label(CHROME, &result.label);
        assert!(c.is_trustworthy(&stored));
    }

    #[test]
    fn test_empty_user_agent_with_label_is_untrusted() {
        let c = classifier();
        let result = c.classify(&OpenAttempt::new("a@x.com", "b@y.com", 60, Some("")));
        let stored = append_label("", &result.label);
        assert!(!c.is_trustworthy(&stored));
    }
}
