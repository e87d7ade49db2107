//! Rollout policy resolution: which phase applies, and how big each step is.
//!
//! Step values are absolute cluster counts or `"<p>%"` percentages of the
//! current candidate count, rounded up. They are resolved afresh every pass,
//! so a fleet that grows or shrinks mid-rollout shifts the step sizes with it.

use chartfleet_state::{RolloutOptions, RolloutPolicy, StepValue};

use crate::error::{RolloutError, RolloutResult};

/// Which rollout policy governs the current episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutPhase {
    /// First rollout of a new deployment.
    Install,
    /// Rollout of an edited deployment.
    Upgrade,
}

impl RolloutPhase {
    /// Options configured for this phase, if any.
    pub fn options<'a>(&self, policy: &'a RolloutPolicy) -> Option<&'a RolloutOptions> {
        match self {
            RolloutPhase::Install => policy.install.as_ref(),
            RolloutPhase::Upgrade => policy.upgrade.as_ref(),
        }
    }
}

/// Pick the phase for a deployment at `generation`.
///
/// Generation 1 is the install; anything later is an upgrade. A phase
/// without options means the deployment fans out without a rollout.
pub fn active_phase(generation: i64, policy: Option<&RolloutPolicy>) -> Option<RolloutPhase> {
    let policy = policy?;
    let phase = if generation <= 1 {
        RolloutPhase::Install
    } else {
        RolloutPhase::Upgrade
    };
    phase.options(policy).map(|_| phase)
}

/// Resolve a step value against `total` candidates.
///
/// Percentages round up; absolute values below zero resolve to zero.
pub fn scaled_value(field: &'static str, value: &StepValue, total: u32) -> RolloutResult<u32> {
    let invalid = |reason: &str| RolloutError::InvalidStep {
        field,
        value: value.to_string(),
        reason: reason.to_string(),
    };
    match value {
        StepValue::Int(v) => Ok(u32::try_from((*v).max(0)).unwrap_or(u32::MAX)),
        StepValue::Str(s) => {
            let percent = s
                .strip_suffix('%')
                .ok_or_else(|| invalid("string values must be percentages"))?;
            let percent: i64 = percent
                .parse()
                .map_err(|_| invalid("percentage is not an integer"))?;
            let scaled = (percent.max(0) * i64::from(total) + 99) / 100;
            Ok(u32::try_from(scaled).unwrap_or(u32::MAX))
        }
    }
}

/// Step values of one phase, resolved against a fixed candidate count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSteps {
    pub init: u32,
    pub increment: u32,
    pub limit: Option<u32>,
}

impl ResolvedSteps {
    pub fn resolve(options: &RolloutOptions, total: u32) -> RolloutResult<Self> {
        let init = scaled_value("step_init", &options.step_init, total)?;
        let increment = match &options.step_increment {
            Some(v) => scaled_value("step_increment", v, total)?,
            None => 0,
        };
        let limit = match &options.step_limit {
            Some(v) => Some(scaled_value("step_limit", v, total)?),
            None => None,
        };
        Ok(Self {
            init,
            increment,
            limit,
        })
    }

    /// Step size following `old_step`.
    ///
    /// The limit only applies when it is larger than the initial step; a
    /// limit at or below `init` is ignored.
    pub fn next_step(&self, old_step: u32) -> u32 {
        let step = old_step.saturating_add(self.increment);
        match self.limit {
            Some(limit) if limit > self.init && step > limit => limit,
            _ => step,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(init: StepValue, inc: Option<StepValue>, limit: Option<StepValue>) -> RolloutOptions {
        RolloutOptions {
            step_init: init,
            step_increment: inc,
            step_limit: limit,
        }
    }

    #[test]
    fn percentages_round_up() {
        assert_eq!(scaled_value("step_init", &"20%".into(), 10), Ok(2));
        assert_eq!(scaled_value("step_init", &"25%".into(), 10), Ok(3));
        assert_eq!(scaled_value("step_init", &"1%".into(), 1), Ok(1));
        assert_eq!(scaled_value("step_init", &"100%".into(), 7), Ok(7));
        assert_eq!(scaled_value("step_init", &"50%".into(), 0), Ok(0));
    }

    #[test]
    fn absolute_values_clamp_at_zero() {
        assert_eq!(scaled_value("step_init", &StepValue::Int(3), 10), Ok(3));
        assert_eq!(scaled_value("step_init", &StepValue::Int(-4), 10), Ok(0));
        // Absolute values are not bounded by the fleet size.
        assert_eq!(scaled_value("step_init", &StepValue::Int(30), 10), Ok(30));
    }

    #[test]
    fn malformed_values_are_rejected() {
        for bad in ["two", "20", "x%", "%", "2.5%"] {
            let err = scaled_value("step_increment", &bad.into(), 10).unwrap_err();
            let RolloutError::InvalidStep { field, value, .. } = err;
            assert_eq!(field, "step_increment");
            assert_eq!(value, bad);
        }
    }

    #[test]
    fn phase_follows_generation_and_policy() {
        let install_only = RolloutPolicy {
            install: Some(options(StepValue::Int(1), None, None)),
            upgrade: None,
        };
        assert_eq!(active_phase(1, Some(&install_only)), Some(RolloutPhase::Install));
        assert_eq!(active_phase(2, Some(&install_only)), None);

        let upgrade_only = RolloutPolicy {
            install: None,
            upgrade: Some(options(StepValue::Int(1), None, None)),
        };
        assert_eq!(active_phase(1, Some(&upgrade_only)), None);
        assert_eq!(active_phase(3, Some(&upgrade_only)), Some(RolloutPhase::Upgrade));

        assert_eq!(active_phase(1, None), None);
    }

    #[test]
    fn limit_caps_growth_when_above_init() {
        let steps = ResolvedSteps::resolve(
            &options("20%".into(), Some("20%".into()), Some("50%".into())),
            10,
        )
        .unwrap();
        assert_eq!(steps, ResolvedSteps { init: 2, increment: 2, limit: Some(5) });
        assert_eq!(steps.next_step(2), 4);
        assert_eq!(steps.next_step(4), 5);
        assert_eq!(steps.next_step(5), 5);
    }

    #[test]
    fn limit_at_or_below_init_is_ignored() {
        let opts = options(
            StepValue::Int(3),
            Some(StepValue::Int(2)),
            Some(StepValue::Int(3)),
        );
        let steps = ResolvedSteps::resolve(&opts, 10).unwrap();
        assert_eq!(steps.next_step(3), 5);
        assert_eq!(steps.next_step(9), 11);
    }

    #[test]
    fn missing_increment_keeps_step() {
        let steps = ResolvedSteps::resolve(&options(StepValue::Int(2), None, None), 10).unwrap();
        assert_eq!(steps.next_step(2), 2);
    }
}
