//! Expose the service through an internet-facing application load balancer.
//!
//! Targets are registered by service, not by address: the orchestrator adds and removes task
//! addresses as tasks start and stop, so membership tracks autoscaling without a fixed list.

use crate::{
    compute::ComputeService,
    naming::{name, ResourceKind},
    network::NetworkTopology,
    provision::{Handle, Provisioner, Resource, TargetHealthCheck},
    security::SecurityBoundary,
    Error,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Scheme of every load balancer built here.
pub const SCHEME: &str = "internet-facing";

/// Health-check policy of the target group (durations in seconds).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthCheckConfig {
    pub path: String,
    pub interval: u64,
    pub timeout: u64,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/health".into(),
            interval: 30,
            timeout: 5,
            healthy_threshold: 2,
            unhealthy_threshold: 2,
        }
    }
}

impl HealthCheckConfig {
    /// Ensures the policy is one the load balancer accepts.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.path.starts_with('/') {
            return Err(Error::InvalidHealthCheck(format!(
                "path {} must start with '/'",
                self.path
            )));
        }
        if !(5..=300).contains(&self.interval) {
            return Err(Error::InvalidHealthCheck(format!(
                "interval {}s must be between 5s and 300s",
                self.interval
            )));
        }
        if !(2..=120).contains(&self.timeout) || self.timeout >= self.interval {
            return Err(Error::InvalidHealthCheck(format!(
                "timeout {}s must be between 2s and 120s and below the interval",
                self.timeout
            )));
        }
        for threshold in [self.healthy_threshold, self.unhealthy_threshold] {
            if !(2..=10).contains(&threshold) {
                return Err(Error::InvalidHealthCheck(format!(
                    "threshold {threshold} must be between 2 and 10"
                )));
            }
        }
        Ok(())
    }

    fn policy(&self) -> TargetHealthCheck {
        TargetHealthCheck {
            path: self.path.clone(),
            interval: Duration::from_secs(self.interval),
            timeout: Duration::from_secs(self.timeout),
            healthy_threshold: self.healthy_threshold,
            unhealthy_threshold: self.unhealthy_threshold,
        }
    }
}

/// The created target group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetGroup {
    pub handle: Handle,
    pub port: u16,
    pub health_check: TargetHealthCheck,
    /// Services whose tasks are registered (exactly one in this topology).
    pub members: Vec<Handle>,
}

/// What a listener does with matching traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Send `weight` percent of traffic to the target group.
    Forward { target_group: Handle, weight: u8 },
}

/// The created listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listener {
    pub handle: Handle,
    pub port: u16,
    pub protocol: &'static str,
    pub default_action: Action,
}

/// The created load balancer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancer {
    pub handle: Handle,
    pub scheme: &'static str,
    pub subnets: Vec<Handle>,
    pub security_group: Handle,
    pub listeners: Vec<Listener>,
    /// Public DNS name issued by the engine.
    pub address: String,
}

/// Everything created by [build].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancing {
    pub load_balancer: LoadBalancer,
    pub target_group: TargetGroup,
}

/// Creates the target group, the load balancer, and its listener, then registers the service.
pub fn build<P: Provisioner>(
    engine: &mut P,
    environment: &str,
    network: &NetworkTopology,
    security: &SecurityBoundary,
    compute: &ComputeService,
    published_port: u16,
    health_check: &HealthCheckConfig,
) -> Result<LoadBalancing, Error> {
    health_check.validate()?;
    if published_port == 0 {
        return Err(Error::InvalidPort(published_port));
    }
    let policy = health_check.policy();

    // Create target group of task addresses
    let target_group = engine.create(
        &name(ResourceKind::TargetGroup, environment),
        Resource::TargetGroup {
            vpc: network.id.clone(),
            port: compute.port,
            health_check: policy.clone(),
        },
    )?;
    info!(
        target_group = target_group.id(),
        path = policy.path.as_str(),
        "created target group"
    );

    // Create load balancer in the public subnets behind the edge group
    let subnets = network.public_subnets();
    let load_balancer = engine.create(
        &name(ResourceKind::LoadBalancer, environment),
        Resource::LoadBalancer {
            subnets: subnets.clone(),
            security_groups: vec![security.edge.clone()],
        },
    )?;
    let address = engine.address(&load_balancer)?;
    info!(
        load_balancer = load_balancer.id(),
        address = address.as_str(),
        "created load balancer"
    );

    // Forward all traffic on the published port
    let listener = engine.create(
        &name(ResourceKind::Listener, environment),
        Resource::Listener {
            load_balancer: load_balancer.clone(),
            port: published_port,
            target_group: target_group.clone(),
        },
    )?;
    info!(
        listener = listener.id(),
        port = published_port,
        "created listener"
    );

    // Register the service's tasks
    engine.create(
        &name(ResourceKind::TargetRegistration, environment),
        Resource::TargetRegistration {
            target_group: target_group.clone(),
            service: compute.service.clone(),
            container: compute.container.clone(),
            port: compute.port,
            grace_period: compute.readiness.start_period,
        },
    )?;
    info!(
        target_group = target_group.id(),
        service = compute.service.id(),
        "registered service with target group"
    );

    Ok(LoadBalancing {
        load_balancer: LoadBalancer {
            handle: load_balancer,
            scheme: SCHEME,
            subnets,
            security_group: security.edge.clone(),
            listeners: vec![Listener {
                handle: listener,
                port: published_port,
                protocol: "HTTP",
                default_action: Action::Forward {
                    target_group: target_group.clone(),
                    weight: 100,
                },
            }],
            address,
        },
        target_group: TargetGroup {
            handle: target_group,
            port: compute.port,
            health_check: policy,
            members: vec![compute.service.clone()],
        },
    })
}
