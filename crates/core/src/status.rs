//! Status record of a tracked instance and its per-dimension conditions.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::{Deserialize, Serialize};

/// Aggregate health of a tracked instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterPhase {
    #[default]
    Creating,
    Healthy,
    Unhealthy,
    Abnormal,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterPhase::Creating => "Creating",
            ClusterPhase::Healthy => "Healthy",
            ClusterPhase::Unhealthy => "Unhealthy",
            ClusterPhase::Abnormal => "Abnormal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilvusCondition {
    /// Dimension name; unique within an instance.
    pub name: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl MilvusCondition {
    pub fn new(name: impl Into<String>, status: ConditionStatus) -> Self {
        Self { name: name.into(), status, ..Default::default() }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilvusStatus {
    #[serde(default)]
    pub status: ClusterPhase,
    #[serde(default)]
    pub conditions: Vec<MilvusCondition>,
}

impl MilvusStatus {
    /// Same phase and same condition set, ignoring list order.
    pub fn equivalent(&self, other: &MilvusStatus) -> bool {
        self.status == other.status
            && ConditionSet::from_conditions(&self.conditions) == ConditionSet::from_conditions(&other.conditions)
    }
}

/// Conditions keyed by dimension name. Materialized to a list (sorted by name)
/// only when written back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionSet {
    by_name: BTreeMap<String, MilvusCondition>,
}

impl ConditionSet {
    /// Later duplicates win.
    pub fn from_conditions(conditions: &[MilvusCondition]) -> Self {
        let by_name = conditions.iter().map(|c| (c.name.clone(), c.clone())).collect();
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> Option<&MilvusCondition> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MilvusCondition> {
        self.by_name.values()
    }

    /// Insert or replace the condition of the same name. The transition time
    /// moves to `now` only when the status of that dimension changed.
    /// Returns whether anything observable changed.
    pub fn upsert(&mut self, mut cond: MilvusCondition, now: &Time) -> bool {
        match self.by_name.get(&cond.name) {
            Some(prev) if prev.status == cond.status => {
                cond.last_transition_time = prev.last_transition_time.clone();
            }
            _ => cond.last_transition_time = Some(now.clone()),
        }
        let changed = self.by_name.get(&cond.name) != Some(&cond);
        self.by_name.insert(cond.name.clone(), cond);
        changed
    }

    pub fn into_conditions(self) -> Vec<MilvusCondition> {
        self.by_name.into_values().collect()
    }
}
