//! Label matchers used by routes, silences and inhibition rules.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AlertError, Result};
use crate::types::LabelSet;

/// The comparison a matcher applies to a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    /// `=`: value equals.
    Equal,
    /// `!=`: value differs.
    NotEqual,
    /// `=~`: value matches the anchored regex.
    Regex,
    /// `!~`: value does not match the anchored regex.
    NotRegex,
}

impl MatchType {
    /// Returns the operator as written in configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Regex => "=~",
            Self::NotRegex => "!~",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchType {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "=" => Ok(Self::Equal),
            "!=" => Ok(Self::NotEqual),
            "=~" => Ok(Self::Regex),
            "!~" => Ok(Self::NotRegex),
            other => Err(AlertError::InvalidMatcher {
                reason: format!("unknown operator {other:?}"),
            }),
        }
    }
}

/// A single label predicate.
///
/// A label that is absent from the set is treated as having the empty value,
/// so `severity!="critical"` matches alerts without a `severity` label.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "(String, String, String)", into = "(String, String, String)")]
pub struct Matcher {
    name: String,
    match_type: MatchType,
    value: String,
    regex: Option<Regex>,
}

impl Matcher {
    /// Creates a matcher, compiling the regex for regex operators.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::InvalidMatcher`] if the name is empty or the regex
    /// does not compile.
    pub fn new(match_type: MatchType, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        if name.is_empty() {
            return Err(AlertError::InvalidMatcher {
                reason: "label name must not be empty".to_string(),
            });
        }
        let regex = match match_type {
            MatchType::Regex | MatchType::NotRegex => Some(
                Regex::new(&format!("^(?:{value})$")).map_err(|e| AlertError::InvalidMatcher {
                    reason: format!("invalid regex for {name}: {e}"),
                })?,
            ),
            MatchType::Equal | MatchType::NotEqual => None,
        };
        Ok(Self {
            name,
            match_type,
            value,
            regex,
        })
    }

    /// Shorthand for an equality matcher.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::InvalidMatcher`] if the name is empty.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        Self::new(MatchType::Equal, name, value)
    }

    /// The label name this matcher inspects.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The matcher's operator.
    #[must_use]
    pub const fn match_type(&self) -> MatchType {
        self.match_type
    }

    /// The literal value or regex source.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns true if `value` satisfies the matcher.
    #[must_use]
    pub fn matches_value(&self, value: &str) -> bool {
        match (&self.match_type, &self.regex) {
            (MatchType::Equal, _) => value == self.value,
            (MatchType::NotEqual, _) => value != self.value,
            (MatchType::Regex, Some(re)) => re.is_match(value),
            (MatchType::NotRegex, Some(re)) => !re.is_match(value),
            (MatchType::Regex | MatchType::NotRegex, None) => false,
        }
    }

    /// Returns true if the label set satisfies the matcher.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.matches_value(labels.get(&self.name).map_or("", String::as_str))
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.match_type == other.match_type && self.value == other.value
    }
}

impl Eq for Matcher {}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.match_type, self.value)
    }
}

impl TryFrom<(String, String, String)> for Matcher {
    type Error = AlertError;

    fn try_from((name, op, value): (String, String, String)) -> Result<Self> {
        Self::new(op.parse()?, name, value)
    }
}

impl From<Matcher> for (String, String, String) {
    fn from(m: Matcher) -> Self {
        (m.name, m.match_type.as_str().to_string(), m.value)
    }
}

/// A conjunction of matchers. An empty set matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Matchers(pub Vec<Matcher>);

impl Matchers {
    /// Returns true if every matcher is satisfied.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.0.iter().all(|m| m.matches(labels))
    }

    /// Returns true if there are no matchers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the matchers.
    pub fn iter(&self) -> impl Iterator<Item = &Matcher> {
        self.0.iter()
    }
}

impl From<Vec<Matcher>> for Matchers {
    fn from(matchers: Vec<Matcher>) -> Self {
        Self(matchers)
    }
}

impl fmt::Display for Matchers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, m) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{m}")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test_case(MatchType::Equal, "critical", "critical", true ; "equal hit")]
    #[test_case(MatchType::Equal, "critical", "warning", false ; "equal miss")]
    #[test_case(MatchType::NotEqual, "critical", "warning", true ; "not equal hit")]
    #[test_case(MatchType::Regex, "crit.*", "critical", true ; "regex hit")]
    #[test_case(MatchType::Regex, "crit", "critical", false ; "regex is anchored")]
    #[test_case(MatchType::NotRegex, "warn|info", "critical", true ; "not regex hit")]
    #[test_case(MatchType::NotRegex, "warn|info", "info", false ; "not regex miss")]
    fn matcher_semantics(op: MatchType, pattern: &str, value: &str, expected: bool) {
        let m = Matcher::new(op, "severity", pattern).unwrap();
        assert_eq!(m.matches(&labels(&[("severity", value)])), expected);
    }

    #[test]
    fn missing_label_is_empty() {
        let ne = Matcher::new(MatchType::NotEqual, "severity", "critical").unwrap();
        let eq_empty = Matcher::equal("severity", "").unwrap();
        let empty = LabelSet::new();
        assert!(ne.matches(&empty));
        assert!(eq_empty.matches(&empty));
    }

    #[test]
    fn invalid_regex_rejected() {
        let err = Matcher::new(MatchType::Regex, "job", "(").unwrap_err();
        assert!(matches!(err, AlertError::InvalidMatcher { .. }));
    }

    #[test]
    fn empty_name_rejected() {
        assert!(Matcher::equal("", "x").is_err());
    }

    #[test]
    fn unknown_operator_rejected() {
        let parsed: std::result::Result<Matcher, _> =
            serde_json::from_str(r#"["severity", "==", "critical"]"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn tuple_serde() {
        let m: Matcher = serde_json::from_str(r#"["team", "=~", "db|web"]"#).unwrap();
        assert_eq!(m.match_type(), MatchType::Regex);
        assert!(m.matches(&labels(&[("team", "web")])));
        assert_eq!(serde_json::to_string(&m).unwrap(), r#"["team","=~","db|web"]"#);
    }

    #[test]
    fn conjunction_and_display() {
        let ms = Matchers(vec![
            Matcher::equal("alertname", "HighCPU").unwrap(),
            Matcher::new(MatchType::NotEqual, "env", "dev").unwrap(),
        ]);
        assert!(ms.matches(&labels(&[("alertname", "HighCPU"), ("env", "prod")])));
        assert!(!ms.matches(&labels(&[("alertname", "HighCPU"), ("env", "dev")])));
        assert!(Matchers::default().matches(&LabelSet::new()));
        assert_eq!(ms.to_string(), r#"{alertname="HighCPU",env!="dev"}"#);
    }
}
