//! Escalation ladder for repeat offenders.
//!
//! Every mitigation is an incident keyed by `(reason, scope key)`. Repeats of
//! the same incident inside the escalation window push the action up the
//! configured ladder. A `block`-level outcome puts its scope key on hold:
//! the key is answered with the same block until the retry-after it was
//! given has passed.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::action::{MitigationAction, MitigationDecision};
use crate::clock::Clock;
use crate::error::{PalisadeError, Result};

/// Escalation tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Rungs from mildest to harshest
    #[serde(default = "default_ladder")]
    pub ladder: Vec<MitigationAction>,
    /// Repeats per rung before moving up
    #[serde(default = "default_promote_after")]
    pub promote_after: u32,
    /// How long an incident is remembered after it was first seen
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Minimum retry-after for block-level outcomes
    #[serde(default = "default_block_duration_ms")]
    pub block_duration_ms: u64,
}

fn default_ladder() -> Vec<MitigationAction> {
    vec![
        MitigationAction::RateLimit,
        MitigationAction::Challenge,
        MitigationAction::Block,
    ]
}

fn default_promote_after() -> u32 {
    3
}

fn default_window_ms() -> u64 {
    600_000
}

fn default_block_duration_ms() -> u64 {
    300_000
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            ladder: default_ladder(),
            promote_after: default_promote_after(),
            window_ms: default_window_ms(),
            block_duration_ms: default_block_duration_ms(),
        }
    }
}

impl EscalationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ladder.is_empty() {
            return Err(PalisadeError::Config("escalation.ladder must not be empty".to_string()));
        }
        if self.ladder.contains(&MitigationAction::Allow) {
            return Err(PalisadeError::Config(
                "escalation.ladder must not contain allow".to_string(),
            ));
        }
        if self
            .ladder
            .windows(2)
            .any(|pair| pair[0].severity() >= pair[1].severity())
        {
            return Err(PalisadeError::Config(
                "escalation.ladder must be strictly increasing in severity".to_string(),
            ));
        }
        if self.promote_after == 0 {
            return Err(PalisadeError::Config("escalation.promote_after must be > 0".to_string()));
        }
        if self.window_ms == 0 {
            return Err(PalisadeError::Config("escalation.window_ms must be > 0".to_string()));
        }
        Ok(())
    }

    /// Action after moving `level` rungs up from `action`.
    ///
    /// An action that is not on the ladder first moves to the mildest rung
    /// harsher than it. The result is never milder than `action`.
    pub fn promote(&self, action: MitigationAction, level: u32) -> MitigationAction {
        if level == 0 || self.ladder.is_empty() {
            return action;
        }
        let top = self.ladder.len() - 1;
        let steps = level as usize;
        let target = match self.ladder.iter().position(|rung| *rung == action) {
            Some(position) => position + steps,
            None => match self
                .ladder
                .iter()
                .position(|rung| rung.severity() > action.severity())
            {
                Some(position) => position + steps - 1,
                None => return action,
            },
        };
        let promoted = self.ladder[target.min(top)];
        if promoted.severity() < action.severity() {
            action
        } else {
            promoted
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Incident {
    count: u32,
    first_seen: u64,
    last_seen: u64,
}

/// A scope key serving a block.
#[derive(Debug)]
struct Hold {
    until: u64,
    action: MitigationAction,
    reason: String,
    level: u32,
}

/// Result of running a decision through the ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    pub decision: MitigationDecision,
    /// The action was raised above the selector's choice
    pub promoted: bool,
}

/// Tracks incidents and promotes repeated ones.
#[derive(Debug)]
pub struct EscalationLadder {
    config: EscalationConfig,
    incidents: DashMap<String, Incident>,
    holds: DashMap<String, Hold>,
    clock: Arc<dyn Clock>,
}

impl EscalationLadder {
    pub fn new(config: EscalationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            incidents: DashMap::new(),
            holds: DashMap::new(),
            clock,
        }
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// Count this occurrence of the decision's incident and apply the
    /// resulting escalation level.
    ///
    /// Allow and circuit-breaker decisions pass through unchanged.
    pub fn apply(&self, mut decision: MitigationDecision, scope_key: &str) -> Escalation {
        if decision.is_allow() || decision.is_circuit_breaker() {
            return Escalation {
                decision,
                promoted: false,
            };
        }

        let now = self.clock.now_millis();
        let count = {
            let mut incident = self
                .incidents
                .entry(format!("{}|{}", decision.reason, scope_key))
                .or_insert(Incident {
                    count: 0,
                    first_seen: now,
                    last_seen: now,
                });
            if now.saturating_sub(incident.first_seen) >= self.config.window_ms {
                *incident = Incident {
                    count: 0,
                    first_seen: now,
                    last_seen: now,
                };
            }
            incident.count = incident.count.saturating_add(1);
            incident.last_seen = now;
            incident.count
        };

        let level = (count - 1) / self.config.promote_after;
        let original = decision.action;
        let action = self.config.promote(original, level);
        let promoted = action != original;

        decision.action = action;
        decision.allowed = action.admits();
        decision.escalation_level = level;
        if action != MitigationAction::Delay {
            decision.delay_ms = 0;
        }
        if matches!(action, MitigationAction::Block | MitigationAction::Escalate) {
            decision.retry_after_seconds = decision
                .retry_after_seconds
                .max(self.config.block_duration_ms.div_ceil(1000));
            self.hold(scope_key, &decision, now);
        }

        if promoted {
            debug!(
                scope_key = %scope_key,
                reason = %decision.reason,
                from = %original,
                to = %action,
                level,
                "Escalated mitigation"
            );
        }

        Escalation { decision, promoted }
    }

    fn hold(&self, scope_key: &str, decision: &MitigationDecision, now: u64) {
        let until = now.saturating_add(decision.retry_after_seconds.saturating_mul(1000));
        let hold = Hold {
            until,
            action: decision.action,
            reason: decision.reason.clone(),
            level: decision.escalation_level,
        };
        match self.holds.entry(scope_key.to_string()) {
            Entry::Occupied(mut current) => {
                if until >= current.get().until {
                    current.insert(hold);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(hold);
            }
        }
    }

    /// The block a scope key is still serving, if any.
    ///
    /// `retry_after_seconds` counts down to the end of the hold.
    pub fn held(&self, scope_key: &str) -> Option<MitigationDecision> {
        let now = self.clock.now_millis();
        let hold = self.holds.get(scope_key)?;
        if now >= hold.until {
            return None;
        }

        let retry = (hold.until - now).div_ceil(1000);
        let mut decision = MitigationDecision::mitigate(hold.action, hold.reason.clone(), retry);
        decision.escalation_level = hold.level;
        Some(decision)
    }

    pub fn has_holds(&self) -> bool {
        !self.holds.is_empty()
    }

    /// Forget incidents older than the escalation window and holds that
    /// have run out. Returns how many entries were dropped.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let window = self.config.window_ms;
        let before = self.incidents.len() + self.holds.len();
        self.incidents
            .retain(|_, incident| now.saturating_sub(incident.first_seen) < window);
        self.holds.retain(|_, hold| now < hold.until);
        before.saturating_sub(self.incidents.len() + self.holds.len())
    }

    pub fn active_incidents(&self) -> usize {
        self.incidents.len()
    }

    pub fn active_holds(&self) -> usize {
        self.holds.len()
    }
}
