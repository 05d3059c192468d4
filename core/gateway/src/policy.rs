//! Declarative per-endpoint encryption policy.

use serde::{Deserialize, Serialize};

use keyledger_common::{Error, Result};

/// What the gateway must do for one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPolicy {
    /// The request body must arrive as an encrypted envelope.
    pub decrypt_request: bool,
    /// The response body must leave as an encrypted envelope.
    pub encrypt_response: bool,
}

impl EndpointPolicy {
    pub const PASSTHROUGH: Self = Self {
        decrypt_request: false,
        encrypt_response: false,
    };

    pub const BOTH: Self = Self {
        decrypt_request: true,
        encrypt_response: true,
    };

    pub fn is_protected(&self) -> bool {
        self.decrypt_request || self.encrypt_response
    }
}

/// One policy rule.
///
/// `pattern` is an exact path, or a prefix ending in `*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub pattern: String,
    #[serde(flatten)]
    pub policy: EndpointPolicy,
}

impl PolicyRule {
    pub fn new(pattern: impl Into<String>, policy: EndpointPolicy) -> Self {
        Self {
            pattern: pattern.into(),
            policy,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.pattern.is_empty() {
            return Err(Error::Config("policy pattern cannot be empty".to_string()));
        }
        if self.pattern.trim_end_matches('*').contains('*') {
            return Err(Error::Config(format!(
                "policy pattern {:?} may only use '*' as a trailing wildcard",
                self.pattern
            )));
        }
        Ok(())
    }

    fn matches(&self, path: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => path == self.pattern,
        }
    }
}

/// Ordered rule table; the first matching rule wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyTable {
    pub rules: Vec<PolicyRule>,
    /// Applied when no rule matches.
    pub default: EndpointPolicy,
}

impl PolicyTable {
    pub fn new(rules: Vec<PolicyRule>, default: EndpointPolicy) -> Self {
        Self { rules, default }
    }

    pub fn validate(&self) -> Result<()> {
        self.rules.iter().try_for_each(PolicyRule::validate)
    }

    /// Policy for a request path.
    pub fn lookup(&self, path: &str) -> EndpointPolicy {
        self.rules
            .iter()
            .find(|rule| rule.matches(path))
            .map(|rule| rule.policy)
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PolicyTable {
        PolicyTable::new(
            vec![
                PolicyRule::new("/api/reflections/public", EndpointPolicy::PASSTHROUGH),
                PolicyRule::new("/api/reflections/*", EndpointPolicy::BOTH),
                PolicyRule::new(
                    "/api/reports",
                    EndpointPolicy {
                        decrypt_request: false,
                        encrypt_response: true,
                    },
                ),
            ],
            EndpointPolicy::PASSTHROUGH,
        )
    }

    #[test]
    fn test_first_match_wins() {
        let table = table();
        assert_eq!(table.lookup("/api/reflections/public"), EndpointPolicy::PASSTHROUGH);
        assert_eq!(table.lookup("/api/reflections/42"), EndpointPolicy::BOTH);
    }

    #[test]
    fn test_exact_match_is_exact() {
        let table = table();
        assert!(table.lookup("/api/reports").encrypt_response);
        assert!(!table.lookup("/api/reports/1").is_protected());
    }

    #[test]
    fn test_default_applies() {
        let table = PolicyTable::new(Vec::new(), EndpointPolicy::BOTH);
        assert_eq!(table.lookup("/anything"), EndpointPolicy::BOTH);
    }

    #[test]
    fn test_validate_rejects_inner_wildcard() {
        let table = PolicyTable::new(
            vec![PolicyRule::new("/api/*/secret", EndpointPolicy::BOTH)],
            EndpointPolicy::PASSTHROUGH,
        );
        assert!(table.validate().is_err());
        assert!(self::table().validate().is_ok());
    }

    #[test]
    fn test_rule_json_is_flat() {
        let rule: PolicyRule = serde_json::from_str(
            r#"{"pattern":"/api/*","decrypt_request":true,"encrypt_response":false}"#,
        )
        .unwrap();
        assert!(rule.policy.decrypt_request);
        assert!(!rule.policy.encrypt_response);
    }
}
