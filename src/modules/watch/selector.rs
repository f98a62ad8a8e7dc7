//! Label selectors for filtering watch events.
//!
//! Supports the Kubernetes selector string syntax:
//! `k=v`, `k==v`, `k!=v`, `k in (a,b)`, `k notin (a,b)`, `k` and `!k`,
//! joined by commas.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::{WatchError, WatchResult};

/// Label selector operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelSelectorOperator {
    /// Key equals the single value.
    Equals,
    /// Key is absent or differs from the single value.
    NotEquals,
    /// Key's value is in the set.
    In,
    /// Key is absent or its value is not in the set.
    NotIn,
    /// Key exists.
    Exists,
    /// Key does not exist.
    DoesNotExist,
}

/// One selector requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelectorRequirement {
    /// Label key.
    pub key: String,
    /// Operator.
    pub operator: LabelSelectorOperator,
    /// Values for the operator.
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    /// Check whether a label set satisfies this requirement.
    #[must_use]
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            LabelSelectorOperator::Equals | LabelSelectorOperator::In => {
                value.is_some_and(|v| self.values.contains(v))
            },
            LabelSelectorOperator::NotEquals | LabelSelectorOperator::NotIn => {
                value.map_or(true, |v| !self.values.contains(v))
            },
            LabelSelectorOperator::Exists => value.is_some(),
            LabelSelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

impl std::fmt::Display for LabelSelectorRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.operator {
            LabelSelectorOperator::Equals => write!(f, "{}={}", self.key, self.values.join(",")),
            LabelSelectorOperator::NotEquals => {
                write!(f, "{}!={}", self.key, self.values.join(","))
            },
            LabelSelectorOperator::In => {
                write!(f, "{} in ({})", self.key, self.values.join(","))
            },
            LabelSelectorOperator::NotIn => {
                write!(f, "{} notin ({})", self.key, self.values.join(","))
            },
            LabelSelectorOperator::Exists => write!(f, "{}", self.key),
            LabelSelectorOperator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    /// Requirements that must all hold.
    pub requirements: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    /// Create a new empty label selector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality match.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.push(LabelSelectorRequirement {
            key: key.into(),
            operator: LabelSelectorOperator::Equals,
            values: vec![value.into()],
        });
        self
    }

    /// Parse a selector string.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::InvalidSelector`] on malformed input.
    pub fn parse(selector: &str) -> WatchResult<Self> {
        let invalid = |message: &str| WatchError::InvalidSelector {
            selector: selector.to_string(),
            message: message.to_string(),
        };

        let mut requirements = Vec::new();
        for term in split_terms(selector).map_err(invalid)? {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            requirements.push(parse_term(term).map_err(invalid)?);
        }

        Ok(Self { requirements })
    }

    /// Check whether a label set satisfies every requirement.
    #[must_use]
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// Check if the selector is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Convert to the selector string form.
    #[must_use]
    pub fn to_selector_string(&self) -> String {
        self.requirements
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromStr for LabelSelector {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_selector_string())
    }
}

impl Serialize for LabelSelector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_selector_string())
    }
}

impl<'de> Deserialize<'de> for LabelSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Split on commas that are not inside a parenthesised value set.
fn split_terms(selector: &str) -> Result<Vec<&str>, &'static str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (idx, ch) in selector.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1).ok_or("unbalanced parenthesis")?,
            ',' if depth == 0 => {
                terms.push(&selector[start..idx]);
                start = idx + 1;
            },
            _ => {},
        }
    }

    if depth != 0 {
        return Err("unbalanced parenthesis");
    }
    terms.push(&selector[start..]);
    Ok(terms)
}

fn parse_term(term: &str) -> Result<LabelSelectorRequirement, &'static str> {
    if let Some(key) = term.strip_prefix('!') {
        return Ok(LabelSelectorRequirement {
            key: valid_key(key)?,
            operator: LabelSelectorOperator::DoesNotExist,
            values: Vec::new(),
        });
    }

    if let Some((key, value)) = term.split_once("!=") {
        return Ok(LabelSelectorRequirement {
            key: valid_key(key)?,
            operator: LabelSelectorOperator::NotEquals,
            values: vec![value.trim().to_string()],
        });
    }

    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        return Ok(LabelSelectorRequirement {
            key: valid_key(key)?,
            operator: LabelSelectorOperator::Equals,
            values: vec![value.trim().to_string()],
        });
    }

    if let Some((key, rest)) = term.split_once(" notin ") {
        return Ok(LabelSelectorRequirement {
            key: valid_key(key)?,
            operator: LabelSelectorOperator::NotIn,
            values: value_set(rest)?,
        });
    }

    if let Some((key, rest)) = term.split_once(" in ") {
        return Ok(LabelSelectorRequirement {
            key: valid_key(key)?,
            operator: LabelSelectorOperator::In,
            values: value_set(rest)?,
        });
    }

    Ok(LabelSelectorRequirement {
        key: valid_key(term)?,
        operator: LabelSelectorOperator::Exists,
        values: Vec::new(),
    })
}

fn valid_key(key: &str) -> Result<String, &'static str> {
    let key = key.trim();
    if key.is_empty() {
        return Err("empty label key");
    }
    if key.contains(char::is_whitespace) {
        return Err("label key contains whitespace");
    }
    Ok(key.to_string())
}

fn value_set(raw: &str) -> Result<Vec<String>, &'static str> {
    let inner = raw
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or("value set must be parenthesised")?;

    let values: Vec<String> = inner
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();

    if values.is_empty() {
        return Err("empty value set");
    }
    Ok(values)
}
