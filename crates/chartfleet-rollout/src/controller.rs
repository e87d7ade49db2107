//! Rollout planner: decides which clusters a pass reconciles.
//!
//! The planner is a pure function of the phase options, the persisted
//! progress of the current episode and fresh batch metadata. It never talks
//! to the store; the caller executes the returned plan and persists the
//! progress the plan reports for the clusters it actually processed.

use chartfleet_state::{ObjectKey, RolloutOptions, RolloutState};
use tracing::{debug, info};

use crate::batch::{BatchMetadata, ReleaseState, RolloutGate};
use crate::error::RolloutResult;
use crate::strategy::{ResolvedSteps, scaled_value};

/// Outcome of planning one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutDecision {
    /// Every candidate has been rolled out in this episode.
    Completed,
    /// Nothing to reconcile now; look again later. Progress is not written.
    Hold(RolloutGate),
    /// Reconcile the plan's targets in order.
    Proceed(RolloutPlan),
}

/// How persisted progress changes once targets are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// First batch of the episode: count is what was processed.
    Restart { step_size: u32 },
    /// Later batch: count grows by what was processed.
    Extend { count: u32, step_size: u32 },
    /// Persisted count was above the releases that exist; write it back down.
    Clamp { count: u32, step_size: u32 },
    Unchanged,
}

/// Clusters to reconcile this pass, in rollout order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutPlan {
    pub gate: RolloutGate,
    pub targets: Vec<ObjectKey>,
    generation: i64,
    progress: Progress,
}

impl RolloutPlan {
    /// Progress to persist after the first `processed` targets were
    /// reconciled. `None` means the persisted progress stays as it is.
    pub fn progress_after(&self, processed: usize) -> Option<RolloutState> {
        let processed = u32::try_from(processed.min(self.targets.len())).unwrap_or(u32::MAX);
        match self.progress {
            Progress::Restart { step_size } => Some(RolloutState {
                count: processed,
                step_size,
                generation: self.generation,
            }),
            // Nothing processed: keep the step where it was.
            Progress::Extend { .. } if processed == 0 => None,
            Progress::Extend { count, step_size } => Some(RolloutState {
                count: count.saturating_add(processed),
                step_size,
                generation: self.generation,
            }),
            Progress::Clamp { count, step_size } => Some(RolloutState {
                count,
                step_size,
                generation: self.generation,
            }),
            Progress::Unchanged => None,
        }
    }
}

/// Plans passes for one deployment's active rollout phase.
#[derive(Debug, Clone, Copy)]
pub struct RolloutPlanner<'a> {
    deployment: &'a str,
    options: &'a RolloutOptions,
}

impl<'a> RolloutPlanner<'a> {
    pub fn new(deployment: &'a str, options: &'a RolloutOptions) -> Self {
        Self {
            deployment,
            options,
        }
    }

    /// Decide this pass from the episode's `persisted` progress and the
    /// current `batch` metadata.
    ///
    /// The persisted count never counts for more than the selected clusters
    /// that have a release of the episode, so a cluster selected after
    /// another was dropped is still rolled out.
    pub fn plan(&self, persisted: RolloutState, batch: &BatchMetadata) -> RolloutResult<RolloutDecision> {
        let total = u32::try_from(batch.len()).unwrap_or(u32::MAX);
        let existing = u32::try_from(batch.existing()).unwrap_or(u32::MAX);
        let state = RolloutState {
            count: persisted.count.min(existing),
            ..persisted
        };
        if state.count >= total {
            info!(deployment = %self.deployment, count = state.count, "rollout completed");
            return Ok(RolloutDecision::Completed);
        }

        let gate = batch.gate();
        let decision = match gate {
            RolloutGate::Unknown => self.first_batch(state, batch, total)?,
            RolloutGate::WaitingForReadiness => RolloutDecision::Proceed(RolloutPlan {
                gate,
                targets: batch
                    .entries()
                    .iter()
                    .filter(|e| e.exists())
                    .map(|e| e.cluster.clone())
                    .collect(),
                generation: state.generation,
                progress: if state.count < persisted.count {
                    Progress::Clamp {
                        count: state.count,
                        step_size: state.step_size,
                    }
                } else {
                    Progress::Unchanged
                },
            }),
            RolloutGate::AdvanceReady => self.next_batch(state, batch, total)?,
        };

        match &decision {
            RolloutDecision::Proceed(plan) => debug!(
                deployment = %self.deployment,
                gate = ?plan.gate,
                targets = plan.targets.len(),
                count = state.count,
                "rollout planned"
            ),
            RolloutDecision::Hold(gate) => debug!(
                deployment = %self.deployment,
                ?gate,
                count = state.count,
                "rollout holding"
            ),
            RolloutDecision::Completed => {}
        }
        Ok(decision)
    }

    fn first_batch(
        &self,
        state: RolloutState,
        batch: &BatchMetadata,
        total: u32,
    ) -> RolloutResult<RolloutDecision> {
        let step_size = scaled_value("step_init", &self.options.step_init, total)?;
        if batch.existing() == step_size as usize {
            return Ok(RolloutDecision::Hold(RolloutGate::Unknown));
        }
        Ok(RolloutDecision::Proceed(RolloutPlan {
            gate: RolloutGate::Unknown,
            targets: batch
                .entries()
                .iter()
                .take(step_size as usize)
                .map(|e| e.cluster.clone())
                .collect(),
            generation: state.generation,
            progress: Progress::Restart { step_size },
        }))
    }

    fn next_batch(
        &self,
        state: RolloutState,
        batch: &BatchMetadata,
        total: u32,
    ) -> RolloutResult<RolloutDecision> {
        let steps = ResolvedSteps::resolve(self.options, total)?;
        let step_size = steps.next_step(state.step_size);

        // Progress lost to a failed status write is recovered from the
        // releases that exist.
        let base = u32::try_from(batch.existing()).unwrap_or(u32::MAX);

        // The window of handled clusters grows to the new step size. Once it
        // stops growing, each batch adds a full step instead.
        let window = if step_size > base {
            step_size
        } else {
            base.saturating_add(step_size)
        };

        let mut handled = 0u32;
        let mut targets = Vec::new();
        for entry in batch.entries() {
            if entry.state == ReleaseState::Pending {
                return Ok(RolloutDecision::Hold(RolloutGate::AdvanceReady));
            }
            if handled >= window {
                break;
            }
            if entry.state == ReleaseState::Missing {
                targets.push(entry.cluster.clone());
            }
            handled += 1;
        }

        Ok(RolloutDecision::Proceed(RolloutPlan {
            gate: RolloutGate::AdvanceReady,
            targets,
            generation: state.generation,
            progress: Progress::Extend {
                count: base,
                step_size,
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchEntry;
    use chartfleet_state::StepValue;

    fn options(init: &str, inc: Option<&str>, limit: Option<&str>) -> RolloutOptions {
        RolloutOptions {
            step_init: init.into(),
            step_increment: inc.map(StepValue::from),
            step_limit: limit.map(StepValue::from),
        }
    }

    fn fleet(states: &[ReleaseState]) -> BatchMetadata {
        BatchMetadata::new(
            states
                .iter()
                .enumerate()
                .map(|(i, s)| BatchEntry::new(ObjectKey::new("fleet", format!("c{i:02}")), *s)),
        )
    }

    fn state(count: u32, step_size: u32) -> RolloutState {
        RolloutState {
            count,
            step_size,
            generation: 1,
        }
    }

    fn names(plan: &RolloutPlan) -> Vec<String> {
        plan.targets.iter().map(|k| k.name.clone()).collect()
    }

    fn proceed(decision: RolloutDecision) -> RolloutPlan {
        match decision {
            RolloutDecision::Proceed(plan) => plan,
            other => panic!("expected a plan, got {other:?}"),
        }
    }

    use ReleaseState::{Missing, Pending, Ready};

    #[test]
    fn first_batch_takes_initial_step() {
        let opts = options("20%", None, None);
        let planner = RolloutPlanner::new("fleet/web", &opts);
        let plan = proceed(planner.plan(state(0, 0), &fleet(&[Missing; 10])).unwrap());

        assert_eq!(plan.gate, RolloutGate::Unknown);
        assert_eq!(names(&plan), vec!["c00", "c01"]);
        assert_eq!(plan.progress_after(2), Some(state(2, 2)));
        // A failure after the first cluster records what was done.
        assert_eq!(plan.progress_after(1), Some(state(1, 2)));
    }

    #[test]
    fn next_batch_grows_window_to_new_step() {
        let opts = options("20%", Some("20%"), Some("50%"));
        let planner = RolloutPlanner::new("fleet/web", &opts);
        let mut states = [Missing; 10];
        states[0] = Ready;
        states[1] = Ready;

        let plan = proceed(planner.plan(state(2, 2), &fleet(&states)).unwrap());
        assert_eq!(plan.gate, RolloutGate::AdvanceReady);
        assert_eq!(names(&plan), vec!["c02", "c03"]);
        assert_eq!(plan.progress_after(2), Some(state(4, 4)));
    }

    #[test]
    fn waiting_touches_only_existing_releases() {
        let opts = options("20%", Some("20%"), None);
        let planner = RolloutPlanner::new("fleet/web", &opts);
        let mut states = [Missing; 10];
        states[0] = Ready;
        states[1] = Pending;

        let plan = proceed(planner.plan(state(2, 2), &fleet(&states)).unwrap());
        assert_eq!(plan.gate, RolloutGate::WaitingForReadiness);
        assert_eq!(names(&plan), vec!["c00", "c01"]);
        assert_eq!(plan.progress_after(2), None);
    }

    #[test]
    fn completed_when_count_covers_candidates() {
        let opts = options("1", None, None);
        let planner = RolloutPlanner::new("fleet/web", &opts);
        assert_eq!(
            planner.plan(state(3, 1), &fleet(&[Ready; 3])).unwrap(),
            RolloutDecision::Completed
        );
        // A deselected cluster leaves the count above the candidate count.
        assert_eq!(
            planner.plan(state(3, 1), &fleet(&[Ready; 2])).unwrap(),
            RolloutDecision::Completed
        );
    }

    #[test]
    fn newly_selected_cluster_is_not_counted_as_rolled_out() {
        let opts = options("1", None, None);
        let planner = RolloutPlanner::new("fleet/web", &opts);
        // Three releases were counted, then one cluster was swapped for a new one.
        let plan = proceed(planner.plan(state(3, 1), &fleet(&[Ready, Ready, Missing])).unwrap());
        assert_eq!(names(&plan), vec!["c02"]);
        assert_eq!(plan.progress_after(1), Some(state(3, 1)));
    }

    #[test]
    fn stale_count_is_written_back_while_waiting() {
        let opts = options("1", Some("1"), None);
        let planner = RolloutPlanner::new("fleet/web", &opts);
        let plan = proceed(planner.plan(state(4, 3), &fleet(&[Ready, Pending, Missing, Missing])).unwrap());
        assert_eq!(plan.gate, RolloutGate::WaitingForReadiness);
        assert_eq!(plan.progress_after(2), Some(state(2, 3)));
    }

    #[test]
    fn batch_with_nothing_processed_keeps_step() {
        let opts = options("1", Some("1"), None);
        let planner = RolloutPlanner::new("fleet/web", &opts);
        let plan = proceed(planner.plan(state(1, 1), &fleet(&[Ready, Missing, Missing])).unwrap());
        assert_eq!(names(&plan), vec!["c01"]);
        assert_eq!(plan.progress_after(0), None);
        assert_eq!(plan.progress_after(1), Some(state(2, 2)));
    }

    #[test]
    fn zero_initial_step_holds() {
        let opts = RolloutOptions {
            step_init: StepValue::Int(0),
            step_increment: None,
            step_limit: None,
        };
        let planner = RolloutPlanner::new("fleet/web", &opts);
        assert_eq!(
            planner.plan(state(0, 0), &fleet(&[Missing; 3])).unwrap(),
            RolloutDecision::Hold(RolloutGate::Unknown)
        );
    }

    #[test]
    fn malformed_step_is_an_error() {
        let opts = options("20%", Some("lots"), None);
        let planner = RolloutPlanner::new("fleet/web", &opts);
        let mut states = [Missing; 4];
        states[0] = Ready;
        assert!(planner.plan(state(1, 1), &fleet(&states)).is_err());
    }

    #[test]
    fn capped_step_still_reaches_every_cluster() {
        let opts = options("20%", Some("20%"), Some("50%"));
        let planner = RolloutPlanner::new("fleet/web", &opts);
        let mut states = [Missing; 10];
        let mut progress = state(0, 0);
        let mut passes = 0;

        loop {
            passes += 1;
            assert!(passes < 20, "rollout did not converge");
            let batch = fleet(&states);
            let plan = match planner.plan(progress, &batch).unwrap() {
                RolloutDecision::Completed => break,
                RolloutDecision::Hold(gate) => panic!("unexpected hold at {gate:?}"),
                RolloutDecision::Proceed(plan) => plan,
            };
            for key in &plan.targets {
                let i: usize = key.name[1..].parse().unwrap();
                states[i] = Ready;
            }
            if let Some(next) = plan.progress_after(plan.targets.len()) {
                assert!(next.count >= progress.count, "count decreased");
                progress = next;
            }
        }
        assert_eq!(progress.count, 10);
        assert!(states.iter().all(|s| *s == Ready));
    }

    #[test]
    fn never_skips_ahead_of_an_unready_batch() {
        let opts = options("3", Some("3"), None);
        let planner = RolloutPlanner::new("fleet/web", &opts);
        let states = [Ready, Pending, Ready, Missing, Missing, Missing];
        let plan = proceed(planner.plan(state(3, 3), &fleet(&states)).unwrap());
        assert!(plan.targets.iter().all(|k| k.name.as_str() < "c03"));
    }

    #[test]
    fn planning_is_deterministic() {
        let opts = options("30%", Some("30%"), None);
        let planner = RolloutPlanner::new("fleet/web", &opts);
        let keys: Vec<_> = (0..10).rev().map(|i| format!("c{i:02}")).collect();
        let shuffled = BatchMetadata::new(
            keys.iter()
                .map(|k| BatchEntry::new(ObjectKey::new("fleet", k.as_str()), Missing)),
        );
        let ordered = fleet(&[Missing; 10]);

        let a = proceed(planner.plan(state(0, 0), &shuffled).unwrap());
        let b = proceed(planner.plan(state(0, 0), &ordered).unwrap());
        assert_eq!(a.targets, b.targets);
        assert_eq!(names(&a), vec!["c00", "c01", "c02"]);
    }

    #[test]
    fn lost_progress_is_recovered_from_existing_releases() {
        let opts = options("2", Some("2"), None);
        let planner = RolloutPlanner::new("fleet/web", &opts);
        let states = [Ready, Ready, Missing, Missing, Missing, Missing];

        // Progress was never persisted, yet two releases exist and are ready.
        let plan = proceed(planner.plan(state(0, 0), &fleet(&states)).unwrap());
        assert_eq!(names(&plan), vec!["c02", "c03"]);
        assert_eq!(plan.progress_after(2), Some(state(4, 2)));
    }
}
