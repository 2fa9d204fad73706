use serde::{Deserialize, Serialize};

use crate::error::ArbiterError;

/// How an idle bus picks a direction when both directions have waiters and
/// the elevated-priority rule does not decide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FairnessPolicy {
    /// Serve the direction other than the one served last.
    #[default]
    Alternate,
    /// Serve the direction whose oldest waiter arrived first.
    OldestFirst,
}

impl std::str::FromStr for FairnessPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alternate" => Ok(FairnessPolicy::Alternate),
            "oldest-first" | "oldest_first" => Ok(FairnessPolicy::OldestFirst),
            other => Err(format!("unknown fairness policy {other:?}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterCfg {
    /// Number of slots on the bus.
    pub capacity: usize,
    pub fairness: FairnessPolicy,
    /// Consecutive idle-to-active cycles a direction may win over a waiting
    /// opposite direction only because it holds elevated waiters.
    pub elevated_streak_limit: u32,
    /// Stop admitting and refilling in the current direction while the
    /// opposite direction has waiters, so the bus drains and turns around.
    pub yield_to_opposite: bool,
}

/// Slots on the accelerator bus.
pub const DEFAULT_CAPACITY: usize = 3;

impl Default for ArbiterCfg {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            fairness: FairnessPolicy::Alternate,
            elevated_streak_limit: 1,
            yield_to_opposite: false,
        }
    }
}

impl ArbiterCfg {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ArbiterError> {
        if self.capacity == 0 {
            return Err(ArbiterError::InvalidCapacity {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Load overrides from environment variables.
    ///
    /// Only fields whose variable is set are touched. Unparseable values are
    /// logged and the current value is kept.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("BUS_ARBITER_CAPACITY") {
            match val.trim().parse::<usize>() {
                Ok(c) if c > 0 => self.capacity = c,
                _ => tracing::warn!(value = %val, "ignoring invalid BUS_ARBITER_CAPACITY"),
            }
        }
        if let Some(val) = lookup("BUS_ARBITER_FAIRNESS") {
            match val.parse::<FairnessPolicy>() {
                Ok(p) => self.fairness = p,
                Err(e) => tracing::warn!(value = %val, error = %e, "ignoring BUS_ARBITER_FAIRNESS"),
            }
        }
        if let Some(val) = lookup("BUS_ARBITER_ELEVATED_STREAK_LIMIT") {
            match val.trim().parse::<u32>() {
                Ok(n) => self.elevated_streak_limit = n,
                Err(e) => tracing::warn!(
                    value = %val,
                    error = %e,
                    "ignoring BUS_ARBITER_ELEVATED_STREAK_LIMIT"
                ),
            }
        }
        if let Some(val) = lookup("BUS_ARBITER_YIELD_TO_OPPOSITE") {
            match val.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.yield_to_opposite = true,
                "0" | "false" | "no" | "off" => self.yield_to_opposite = false,
                _ => tracing::warn!(value = %val, "ignoring BUS_ARBITER_YIELD_TO_OPPOSITE"),
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_a_three_slot_alternating_bus() {
        let cfg = ArbiterCfg::default();
        assert_eq!(cfg.capacity, 3);
        assert_eq!(cfg.fairness, FairnessPolicy::Alternate);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(
            ArbiterCfg::with_capacity(0).validate(),
            Err(ArbiterError::InvalidCapacity { capacity: 0 })
        );
    }

    #[test]
    fn env_overrides_apply_valid_values() {
        let cfg = ArbiterCfg::default().with_overrides_from(lookup(&[
            ("BUS_ARBITER_CAPACITY", "8"),
            ("BUS_ARBITER_FAIRNESS", "oldest-first"),
            ("BUS_ARBITER_ELEVATED_STREAK_LIMIT", "4"),
            ("BUS_ARBITER_YIELD_TO_OPPOSITE", "on"),
        ]));
        assert_eq!(cfg.capacity, 8);
        assert_eq!(cfg.fairness, FairnessPolicy::OldestFirst);
        assert_eq!(cfg.elevated_streak_limit, 4);
        assert!(cfg.yield_to_opposite);
    }

    #[test]
    fn env_overrides_keep_defaults_on_garbage() {
        let cfg = ArbiterCfg::default().with_overrides_from(lookup(&[
            ("BUS_ARBITER_CAPACITY", "0"),
            ("BUS_ARBITER_FAIRNESS", "random"),
            ("BUS_ARBITER_YIELD_TO_OPPOSITE", "maybe"),
        ]));
        assert_eq!(cfg, ArbiterCfg::default());
    }
}
