use serde::{Deserialize, Serialize};

/// A status condition as written by the open-cluster-management APIs.
///
/// Timestamps are kept in their RFC 3339 wire form so that conditions can be
/// compared and patched without a round trip through a time type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

pub const TRUE: &str = "True";
pub const FALSE: &str = "False";
pub const UNKNOWN: &str = "Unknown";

// === impl Condition ===

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status: if status { TRUE } else { FALSE }.to_string(),
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
            observed_generation: None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == TRUE
    }
}

pub fn find<'c>(conditions: &'c [Condition], type_: &str) -> Option<&'c Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).map(Condition::is_true).unwrap_or(false)
}

/// Inserts or replaces a condition of the same type.
///
/// The transition time is only moved forward when the status changes. Returns
/// `false` when the stored condition already matches.
pub fn set(conditions: &mut Vec<Condition>, mut cond: Condition, now: &str) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == cond.type_) {
        Some(existing) => {
            if existing.status == cond.status
                && existing.reason == cond.reason
                && existing.message == cond.message
            {
                return false;
            }
            cond.last_transition_time = if existing.status == cond.status {
                existing.last_transition_time.clone()
            } else {
                Some(now.to_string())
            };
            *existing = cond;
        }
        None => {
            cond.last_transition_time = Some(now.to_string());
            conditions.push(cond);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const T0: &str = "2024-01-01T00:00:00Z";
    const T1: &str = "2024-01-01T00:01:00Z";

    #[test]
    fn set_tracks_transitions() {
        let mut conds = vec![];
        assert!(set(&mut conds, Condition::new("Ready", false, "A", "a"), T0));
        assert_eq!(conds[0].last_transition_time.as_deref(), Some(T0));

        // Same status, new message: time is retained.
        assert!(set(&mut conds, Condition::new("Ready", false, "A", "b"), T1));
        assert_eq!(conds[0].last_transition_time.as_deref(), Some(T0));
        assert_eq!(conds[0].message, "b");

        // Flip: time moves.
        assert!(set(&mut conds, Condition::new("Ready", true, "B", "b"), T1));
        assert_eq!(conds[0].last_transition_time.as_deref(), Some(T1));

        // No change.
        assert!(!set(&mut conds, Condition::new("Ready", true, "B", "b"), T1));
        assert_eq!(conds.len(), 1);
        assert!(is_true(&conds, "Ready"));
        assert!(!is_true(&conds, "Other"));
    }
}
