//! Tri-state status conditions.
//!
//! A condition is a named `True`/`False`/`Unknown` signal with an optional
//! reason, severity and message. Objects expose their conditions through
//! [`Conditioned`]; the free functions here read and write them the same way
//! for every kind. A condition that is absent reads as `Unknown`.
//!
//! Two folds build derived conditions:
//! - [`aggregate`] folds the same condition across many child objects.
//! - [`summary`] folds several of one object's own conditions into `Ready`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::epoch_secs;

/// Top-level readiness condition.
pub const READY: &str = "Ready";

/// Status of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        })
    }
}

/// Severity of a non-True condition. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A single status condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix timestamp (seconds) of the last status flip.
    #[serde(default)]
    pub last_transition_time: u64,
}

impl Condition {
    pub fn new_true(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            status: ConditionStatus::True,
            severity: None,
            reason: None,
            message: None,
            last_transition_time: 0,
        }
    }

    pub fn new_false(kind: &str, reason: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            status: ConditionStatus::False,
            severity: Some(severity),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: 0,
        }
    }

    pub fn new_unknown(kind: &str, reason: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            status: ConditionStatus::Unknown,
            severity: None,
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: 0,
        }
    }

    /// Same condition with `kind` replaced.
    fn retyped(mut self, kind: &str) -> Self {
        self.kind = kind.to_string();
        self
    }
}

/// Objects that carry a condition list.
pub trait Conditioned {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

/// Look up a condition by type.
pub fn get<'a, T: Conditioned + ?Sized>(obj: &'a T, kind: &str) -> Option<&'a Condition> {
    obj.conditions().iter().find(|c| c.kind == kind)
}

/// Status of a condition; absent conditions are `Unknown`.
pub fn status<T: Conditioned + ?Sized>(obj: &T, kind: &str) -> ConditionStatus {
    get(obj, kind).map_or(ConditionStatus::Unknown, |c| c.status)
}

pub fn is_true<T: Conditioned + ?Sized>(obj: &T, kind: &str) -> bool {
    status(obj, kind) == ConditionStatus::True
}

pub fn is_false<T: Conditioned + ?Sized>(obj: &T, kind: &str) -> bool {
    status(obj, kind) == ConditionStatus::False
}

pub fn is_unknown<T: Conditioned + ?Sized>(obj: &T, kind: &str) -> bool {
    status(obj, kind) == ConditionStatus::Unknown
}

/// Set a condition, replacing any existing one of the same type.
///
/// The transition time is kept when the status does not change, so that
/// re-marking a condition every pass does not produce a spurious write.
/// `Ready` sorts first, the rest alphabetically.
pub fn set<T: Conditioned + ?Sized>(obj: &mut T, mut condition: Condition) {
    let conditions = obj.conditions_mut();
    match conditions.iter_mut().find(|c| c.kind == condition.kind) {
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time
            } else {
                epoch_secs()
            };
            *existing = condition;
        }
        None => {
            condition.last_transition_time = epoch_secs();
            conditions.push(condition);
        }
    }
    conditions.sort_by(|a, b| sort_key(&a.kind).cmp(&sort_key(&b.kind)));
}

fn sort_key(kind: &str) -> (bool, &str) {
    (kind != READY, kind)
}

pub fn mark_true<T: Conditioned + ?Sized>(obj: &mut T, kind: &str) {
    set(obj, Condition::new_true(kind));
}

/// Mark True while still carrying an explanatory reason.
pub fn mark_true_with_reason<T: Conditioned + ?Sized>(
    obj: &mut T,
    kind: &str,
    reason: &str,
    message: impl Into<String>,
) {
    let mut condition = Condition::new_true(kind);
    condition.severity = Some(Severity::Info);
    condition.reason = Some(reason.to_string());
    condition.message = Some(message.into());
    set(obj, condition);
}

pub fn mark_false<T: Conditioned + ?Sized>(
    obj: &mut T,
    kind: &str,
    reason: &str,
    severity: Severity,
    message: impl Into<String>,
) {
    set(obj, Condition::new_false(kind, reason, severity, message));
}

pub fn mark_unknown<T: Conditioned + ?Sized>(
    obj: &mut T,
    kind: &str,
    reason: &str,
    message: impl Into<String>,
) {
    set(obj, Condition::new_unknown(kind, reason, message));
}

/// Fold one condition across many sources into a single condition of type `kind`.
///
/// Each source is `(name, condition)`; a missing condition counts as
/// `Unknown`. The result is `False` if any source is False (reason of the
/// most severe one), else `Unknown` if any source is not True, else `True`.
/// The message names the sources that are not True.
pub fn aggregate<'a, I>(kind: &str, sources: I) -> Condition
where
    I: IntoIterator<Item = (&'a str, Option<&'a Condition>)>,
{
    let mut total = 0usize;
    let mut worst_false: Option<&Condition> = None;
    let mut first_unknown: Option<&Condition> = None;
    let mut not_true = Vec::new();

    for (name, condition) in sources {
        total += 1;
        match condition {
            Some(c) if c.status == ConditionStatus::True => {}
            Some(c) if c.status == ConditionStatus::False => {
                not_true.push(name);
                if worst_false.is_none_or(|w| c.severity > w.severity) {
                    worst_false = Some(c);
                }
            }
            other => {
                not_true.push(name);
                if first_unknown.is_none() {
                    first_unknown = other;
                }
            }
        }
    }

    if not_true.is_empty() {
        return Condition::new_true(kind);
    }

    let message = format!(
        "{} of {} not ready: {}",
        not_true.len(),
        total,
        not_true.join(", ")
    );
    match worst_false {
        Some(c) => Condition::new_false(
            kind,
            c.reason.as_deref().unwrap_or("NotReady"),
            c.severity.unwrap_or(Severity::Info),
            message,
        ),
        None => Condition::new_unknown(
            kind,
            first_unknown
                .and_then(|c| c.reason.as_deref())
                .unwrap_or("ReadinessUnknown"),
            message,
        ),
    }
}

/// Fold several of `obj`'s own conditions into a `Ready` condition.
///
/// `False` if any listed condition is False (the most severe wins, ties go to
/// the first listed), else `Unknown` if any is Unknown or absent, else `True`.
pub fn summary<T: Conditioned + ?Sized>(obj: &T, kinds: &[&str]) -> Condition {
    let mut worst_false: Option<&Condition> = None;
    let mut first_unknown: Option<(&str, Option<&Condition>)> = None;

    for kind in kinds {
        match get(obj, kind) {
            Some(c) if c.status == ConditionStatus::True => {}
            Some(c) if c.status == ConditionStatus::False => {
                if worst_false.is_none_or(|w| c.severity > w.severity) {
                    worst_false = Some(c);
                }
            }
            other => {
                if first_unknown.is_none() {
                    first_unknown = Some((kind, other));
                }
            }
        }
    }

    if let Some(c) = worst_false {
        return c.clone().retyped(READY);
    }
    match first_unknown {
        Some((_, Some(c))) => c.clone().retyped(READY),
        Some((kind, None)) => Condition::new_unknown(
            READY,
            "ConditionMissing",
            format!("condition {kind} not yet reported"),
        ),
        None => Condition::new_true(READY),
    }
}

/// Compute [`summary`] and store it as `obj`'s `Ready` condition.
pub fn set_summary<T: Conditioned + ?Sized>(obj: &mut T, kinds: &[&str]) {
    let ready = summary(obj, kinds);
    set(obj, ready);
}
