// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::{KeylockError, Result};
use crate::locking::{LockManager, LockRequest, OwnerId};
use colored::*;
use std::time::Duration;

/// One observable step of the walk-through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioStep {
    pub actor: &'static str,
    pub action: String,
    pub outcome: bool,
}

/// Two owners contending for one key: A holds it, B is turned away, A
/// releases, B gets it.
pub struct ScenarioCommand<'a> {
    manager: &'a LockManager,
}

impl<'a> ScenarioCommand<'a> {
    pub fn new(manager: &'a LockManager) -> Result<Self> {
        Ok(Self { manager })
    }

    pub fn execute(&self, key: &str, lease: Duration) -> Result<()> {
        println!(
            "{} '{}' ({} strategy, lease {:.1}s)",
            "Scenario".cyan().bold(),
            key,
            self.manager.wait_strategy(),
            lease.as_secs_f64()
        );

        for step in self.run(key, lease)? {
            let marker = if step.outcome {
                "✓".green().bold()
            } else {
                "✗".red().bold()
            };
            println!("  {marker} {} {}", step.actor.bold(), step.action);
        }

        println!(
            "{} active locks after the run: {}",
            "→".dimmed(),
            self.manager.active_lock_count()
        );
        Ok(())
    }

    pub fn run(&self, key: &str, lease: Duration) -> Result<Vec<ScenarioStep>> {
        let owner_a = OwnerId::token("A");
        let owner_b = OwnerId::token("B");
        let mut steps = Vec::new();

        let handle_a = self
            .manager
            .try_acquire_with(LockRequest::new(key).lease(lease).owner(owner_a.clone()))?
            .ok_or_else(|| unexpected(key, "A could not take a free key"))?;
        steps.push(ScenarioStep {
            actor: "A",
            action: format!("acquires '{key}'"),
            outcome: true,
        });

        let first_try = self
            .manager
            .try_acquire_with(LockRequest::new(key).lease(lease).owner(owner_b.clone()))?;
        if first_try.is_some() {
            return Err(unexpected(key, "B acquired while A held the key"));
        }
        steps.push(ScenarioStep {
            actor: "B",
            action: format!(
                "try_acquire '{key}' fails immediately (held by {})",
                self.manager
                    .current_owner(key)
                    .map(|owner| owner.to_string())
                    .unwrap_or_else(|| "nobody".to_string())
            ),
            outcome: false,
        });

        let freed = handle_a.release();
        steps.push(ScenarioStep {
            actor: "A",
            action: format!("releases '{key}'"),
            outcome: freed,
        });

        let handle_b = self
            .manager
            .try_acquire_with(LockRequest::new(key).lease(lease).owner(owner_b))?
            .ok_or_else(|| unexpected(key, "B could not take the key after A released it"))?;
        steps.push(ScenarioStep {
            actor: "B",
            action: format!("try_acquire '{key}' succeeds"),
            outcome: true,
        });

        let freed = handle_b.release();
        steps.push(ScenarioStep {
            actor: "B",
            action: format!("releases '{key}'"),
            outcome: freed,
        });

        Ok(steps)
    }
}

fn unexpected(key: &str, details: &str) -> KeylockError {
    KeylockError::ExclusionViolated(format!("'{key}': {details}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_through_matches_expected_outcomes() {
        let manager = LockManager::default();
        let command = ScenarioCommand::new(&manager).unwrap();
        let steps = command.run("id1", Duration::from_secs(5)).unwrap();

        let outcomes: Vec<(&str, bool)> =
            steps.iter().map(|step| (step.actor, step.outcome)).collect();
        assert_eq!(
            outcomes,
            [("A", true), ("B", false), ("A", true), ("B", true), ("B", true)]
        );
        assert!(steps[1].action.contains("token:A"));
        assert_eq!(manager.active_lock_count(), 0);
    }

    #[test]
    fn walk_through_refuses_when_key_is_taken() {
        let manager = LockManager::default();
        let _held = manager
            .acquire_with(LockRequest::new("id1").owner(OwnerId::token("C")))
            .unwrap();

        let command = ScenarioCommand::new(&manager).unwrap();
        let err = command.run("id1", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, KeylockError::ExclusionViolated(_)));
    }
}
