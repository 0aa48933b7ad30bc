//! Scale the service on load balancer requests per target.
//!
//! [build] attaches a target-tracking policy to the service: the desired task count is adjusted
//! to keep requests per task near `requests_per_instance_target`, never leaving
//! `[min_instances, max_instances]`. Every action starts a cooldown (of the action's direction)
//! during which no further action is taken, so bursty load cannot make the count flap.
//!
//! [Controller] applies the same rules to observed load. It is deterministic: time is an offset
//! supplied by the caller.

use crate::{
    balancer::LoadBalancing,
    compute::ComputeService,
    config::EnvironmentConfig,
    naming::{name, ResourceKind},
    provision::{Handle, Provisioner, Resource},
    Error,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest cooldown accepted, in seconds (one day).
pub const MAX_COOLDOWN: u64 = 24 * 60 * 60;

/// Instance bounds, target ratio, and cooldowns (in seconds).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScalingConfig {
    pub min_instances: u32,
    pub max_instances: u32,
    pub requests_per_instance_target: u32,
    pub scale_in_cooldown: u64,
    pub scale_out_cooldown: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 10,
            requests_per_instance_target: 1000,
            scale_in_cooldown: 60,
            scale_out_cooldown: 60,
        }
    }
}

impl ScalingConfig {
    /// Ensures the bounds are ordered, the target is positive, the cooldowns are at most
    /// [MAX_COOLDOWN], and `desired_count` is in bounds.
    pub fn validate(&self, desired_count: u32) -> Result<(), Error> {
        if self.min_instances == 0 {
            return Err(Error::InvalidScalingBounds(
                "min instances must be at least 1".into(),
            ));
        }
        if self.max_instances < self.min_instances {
            return Err(Error::InvalidScalingBounds(format!(
                "max instances {} is below min instances {}",
                self.max_instances, self.min_instances
            )));
        }
        if self.requests_per_instance_target == 0 {
            return Err(Error::InvalidScalingBounds(
                "requests per instance target must be positive".into(),
            ));
        }
        if self.scale_in_cooldown > MAX_COOLDOWN || self.scale_out_cooldown > MAX_COOLDOWN {
            return Err(Error::InvalidScalingBounds(format!(
                "cooldowns ({}s in, {}s out) must not exceed {MAX_COOLDOWN}s",
                self.scale_in_cooldown, self.scale_out_cooldown
            )));
        }
        if desired_count < self.min_instances || desired_count > self.max_instances {
            return Err(Error::InvalidScalingBounds(format!(
                "desired count {desired_count} is outside [{}, {}]",
                self.min_instances, self.max_instances
            )));
        }
        Ok(())
    }

    pub fn scale_in_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_in_cooldown)
    }

    pub fn scale_out_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_out_cooldown)
    }
}

/// The created scaling policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingPolicy {
    pub handle: Handle,
    pub scalable_target: Handle,
    pub service: Handle,
    pub target_group: Handle,
    pub min_instances: u32,
    pub max_instances: u32,
    pub requests_per_instance_target: u32,
    pub scale_in_cooldown: Duration,
    pub scale_out_cooldown: Duration,
}

impl ScalingPolicy {
    /// Returns a controller following this policy, starting from `desired_count`.
    pub fn controller(&self, desired_count: u32) -> Controller {
        Controller::new(
            self.min_instances,
            self.max_instances,
            self.requests_per_instance_target,
            self.scale_in_cooldown,
            self.scale_out_cooldown,
            desired_count,
        )
    }
}

/// Registers the service as a scalable target and attaches the policy.
///
/// On success the service's bounds are recorded and its desired count is clamped into them.
pub fn build<P: Provisioner>(
    engine: &mut P,
    environment: &EnvironmentConfig,
    compute: &mut ComputeService,
    balancing: &LoadBalancing,
) -> Result<ScalingPolicy, Error> {
    environment.validate()?;
    let (min, max) = (environment.min_instances, environment.max_instances);

    // Register scalable target
    let scalable_target = engine.create(
        &name(ResourceKind::ScalableTarget, &environment.environment),
        Resource::ScalableTarget {
            service: compute.service.clone(),
            cluster: compute.cluster_name.clone(),
            service_name: compute.service_name.clone(),
            min,
            max,
        },
    )?;
    info!(
        scalable_target = scalable_target.id(),
        min, max, "registered scalable target"
    );

    // Track requests per target
    let policy = engine.create(
        &name(ResourceKind::ScalingPolicy, &environment.environment),
        Resource::ScalingPolicy {
            target: scalable_target.clone(),
            load_balancer: balancing.load_balancer.handle.clone(),
            target_group: balancing.target_group.handle.clone(),
            requests_per_target: environment.requests_per_instance_target,
            scale_in_cooldown: environment.scale_in_cooldown,
            scale_out_cooldown: environment.scale_out_cooldown,
        },
    )?;
    info!(
        policy = policy.id(),
        target = environment.requests_per_instance_target,
        "created scaling policy"
    );

    compute.bounds = Some((min, max));
    compute.desired_count = compute.desired_count.clamp(min, max);
    Ok(ScalingPolicy {
        handle: policy,
        scalable_target,
        service: compute.service.clone(),
        target_group: balancing.target_group.handle.clone(),
        min_instances: min,
        max_instances: max,
        requests_per_instance_target: environment.requests_per_instance_target,
        scale_in_cooldown: environment.scale_in_cooldown,
        scale_out_cooldown: environment.scale_out_cooldown,
    })
}

/// A change of the desired count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    ScaleOut { from: u32, to: u32 },
    ScaleIn { from: u32, to: u32 },
}

impl Action {
    /// Returns the desired count after the action.
    pub fn to(&self) -> u32 {
        match self {
            Action::ScaleOut { to, .. } | Action::ScaleIn { to, .. } => *to,
        }
    }
}

/// Target-tracking controller over requests per instance.
#[derive(Clone, Debug)]
pub struct Controller {
    min: u32,
    max: u32,
    target: u32,
    scale_in_cooldown: Duration,
    scale_out_cooldown: Duration,
    desired: u32,
    blocked_until: Option<Duration>,
}

impl Controller {
    /// Creates a controller; `desired` is clamped into `[min, max]`.
    ///
    /// # Panics
    ///
    /// Panics if `min` is zero, `max < min`, or `target` is zero.
    pub fn new(
        min: u32,
        max: u32,
        target: u32,
        scale_in_cooldown: Duration,
        scale_out_cooldown: Duration,
        desired: u32,
    ) -> Self {
        assert!(min >= 1 && max >= min, "invalid bounds [{min}, {max}]");
        assert!(target > 0, "target must be positive");
        Self {
            min,
            max,
            target,
            scale_in_cooldown,
            scale_out_cooldown,
            desired: desired.clamp(min, max),
            blocked_until: None,
        }
    }

    /// Current desired count.
    pub fn desired(&self) -> u32 {
        self.desired
    }

    /// Count that would bring requests per instance to the target, within bounds.
    pub fn ideal(&self, total_requests: u64) -> u32 {
        let ideal = total_requests.div_ceil(u64::from(self.target));
        ideal.clamp(u64::from(self.min), u64::from(self.max)) as u32
    }

    /// Observes `total_requests` across all targets at `now` and returns the action taken.
    pub fn observe(&mut self, now: Duration, total_requests: u64) -> Option<Action> {
        let ideal = self.ideal(total_requests);
        if ideal == self.desired {
            return None;
        }
        if let Some(until) = self.blocked_until {
            if now < until {
                warn!(
                    desired = self.desired,
                    ideal,
                    remaining = ?(until - now),
                    "scaling held by cooldown"
                );
                return None;
            }
        }
        let from = self.desired;
        let (action, cooldown) = if ideal > from {
            (Action::ScaleOut { from, to: ideal }, self.scale_out_cooldown)
        } else {
            (Action::ScaleIn { from, to: ideal }, self.scale_in_cooldown)
        };
        self.desired = ideal;
        self.blocked_until = Some(now.saturating_add(cooldown));
        debug!(?action, "scaled");
        Some(action)
    }
}
