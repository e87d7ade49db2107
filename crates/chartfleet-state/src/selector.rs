//! Label selectors.
//!
//! [`LabelSelector`] is the serialized form stored in specs: exact
//! `match_labels` plus set-based `match_expressions`. Before use it is
//! validated and compiled into a [`Selector`], a flat list of requirements
//! that must all hold. An empty selector matches everything.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};
use crate::types::Labels;

static LABEL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").unwrap());

static LABEL_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$").unwrap());

static DNS_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

/// Serialized label selector.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: Labels,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

/// One set-based expression: `key <operator> values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    /// One of `In`, `NotIn`, `Exists`, `DoesNotExist`.
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelector {
    /// Selector requiring every given label.
    pub fn matching_labels(labels: &[(&str, &str)]) -> Self {
        Self {
            match_labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    /// Validate and compile into a [`Selector`].
    pub fn to_selector(&self) -> StateResult<Selector> {
        let mut requirements = Vec::with_capacity(self.match_labels.len() + self.match_expressions.len());
        for (key, value) in &self.match_labels {
            validate_key(key)?;
            validate_value(key, value)?;
            requirements.push(Requirement {
                key: key.clone(),
                operator: Operator::In,
                values: BTreeSet::from([value.clone()]),
            });
        }
        for expr in &self.match_expressions {
            requirements.push(Requirement::from_expression(expr)?);
        }
        Ok(Selector { requirements })
    }
}

/// Set-based operator of a compiled requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A single validated requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

impl Requirement {
    fn from_expression(expr: &LabelSelectorRequirement) -> StateResult<Self> {
        validate_key(&expr.key)?;
        let operator = match expr.operator.as_str() {
            "In" => Operator::In,
            "NotIn" => Operator::NotIn,
            "Exists" => Operator::Exists,
            "DoesNotExist" => Operator::DoesNotExist,
            other => {
                return Err(StateError::InvalidSelector(format!(
                    "{other:?} is not a valid label selector operator"
                )));
            }
        };
        match operator {
            Operator::In | Operator::NotIn if expr.values.is_empty() => {
                return Err(StateError::InvalidSelector(format!(
                    "key {}: values must be non-empty for operator {}",
                    expr.key, expr.operator
                )));
            }
            Operator::Exists | Operator::DoesNotExist if !expr.values.is_empty() => {
                return Err(StateError::InvalidSelector(format!(
                    "key {}: values must be empty for operator {}",
                    expr.key, expr.operator
                )));
            }
            _ => {}
        }
        for value in &expr.values {
            validate_value(&expr.key, value)?;
        }
        Ok(Self {
            key: expr.key.clone(),
            operator,
            values: expr.values.iter().cloned().collect(),
        })
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        match self.operator {
            Operator::In => labels.get(&self.key).is_some_and(|v| self.values.contains(v)),
            Operator::NotIn => labels.get(&self.key).is_none_or(|v| !self.values.contains(v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

/// A compiled selector: all requirements must match.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Selector matching every object.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Exact-match selector over trusted, already-valid labels.
    pub fn from_labels(labels: &Labels) -> Self {
        Self {
            requirements: labels
                .iter()
                .map(|(k, v)| Requirement {
                    key: k.clone(),
                    operator: Operator::In,
                    values: BTreeSet::from([v.clone()]),
                })
                .collect(),
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.requirements.is_empty() {
            return f.write_str("<everything>");
        }
        for (i, r) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            let values = r.values.iter().cloned().collect::<Vec<_>>().join(",");
            match r.operator {
                Operator::In if r.values.len() == 1 => write!(f, "{}={}", r.key, values)?,
                Operator::In => write!(f, "{} in ({})", r.key, values)?,
                Operator::NotIn => write!(f, "{} notin ({})", r.key, values)?,
                Operator::Exists => write!(f, "{}", r.key)?,
                Operator::DoesNotExist => write!(f, "!{}", r.key)?,
            }
        }
        Ok(())
    }
}

fn validate_key(key: &str) -> StateResult<()> {
    let (prefix, name) = match key.rsplit_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > 253 || !DNS_SUBDOMAIN.is_match(prefix) {
            return Err(StateError::InvalidSelector(format!(
                "key {key:?}: prefix must be a DNS subdomain"
            )));
        }
    }
    if name.is_empty() || name.len() > 63 || !LABEL_NAME.is_match(name) {
        return Err(StateError::InvalidSelector(format!(
            "key {key:?}: name must be 1-63 alphanumeric characters, '-', '_' or '.'"
        )));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> StateResult<()> {
    if value.len() > 63 || !LABEL_VALUE.is_match(value) {
        return Err(StateError::InvalidSelector(format!(
            "key {key:?}: invalid label value {value:?}"
        )));
    }
    Ok(())
}
