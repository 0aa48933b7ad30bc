//! Run the workload as a Fargate service in the private subnets.
//!
//! The workload itself is opaque: the image, its port, and the command that proves it is ready
//! come from the caller. Whatever the workload does for its own telemetry is attached through the
//! subnets and security group chosen here, not through this module.

use crate::{
    naming::{name, ResourceKind},
    network::NetworkTopology,
    provision::{Container, Handle, Provisioner, Readiness, Resource},
    security::SecurityBoundary,
    Error,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};
use tracing::info;

/// Returns whether Fargate accepts `memory` MiB alongside `cpu` units.
fn fargate_supports(cpu: u32, memory: u32) -> bool {
    let gib = |range: std::ops::RangeInclusive<u32>| range.contains(&memory) && memory % 1024 == 0;
    match cpu {
        256 => matches!(memory, 512 | 1024 | 2048),
        512 => gib(1024..=4096),
        1024 => gib(2048..=8192),
        2048 => gib(4096..=16384),
        4096 => gib(8192..=30720),
        _ => false,
    }
}

fn default_name() -> String {
    "app".into()
}

fn default_interval() -> u64 {
    30
}

fn default_timeout() -> u64 {
    5
}

fn default_retries() -> u32 {
    3
}

fn default_start_period() -> u64 {
    10
}

fn default_cpu() -> u32 {
    256
}

fn default_memory() -> u32 {
    512
}

/// Description of the application container, supplied by an external build step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadSpec {
    /// Container name (also used when registering with the target group).
    #[serde(default = "default_name")]
    pub name: String,
    /// Image reference (e.g. `registry/repository:tag`).
    pub image: String,
    /// Port the container listens on.
    pub port: u16,
    /// Command the orchestrator runs to decide the container is healthy.
    pub health_check_command: Vec<String>,
    /// Seconds between health checks.
    #[serde(default = "default_interval")]
    pub health_check_interval: u64,
    /// Seconds before a health check is considered failed.
    #[serde(default = "default_timeout")]
    pub health_check_timeout: u64,
    /// Consecutive failures before the container is unhealthy.
    #[serde(default = "default_retries")]
    pub health_check_retries: u32,
    /// Seconds after start during which failed checks are not counted.
    #[serde(default = "default_start_period")]
    pub start_period: u64,
    /// Fargate CPU units.
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    /// Fargate memory (MiB).
    #[serde(default = "default_memory")]
    pub memory: u32,
    /// Plain environment variables passed to the container.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl WorkloadSpec {
    /// Creates a spec with default sizing and health-check timings.
    pub fn new(image: impl Into<String>, port: u16, health_check_command: Vec<String>) -> Self {
        Self {
            name: default_name(),
            image: image.into(),
            port,
            health_check_command,
            health_check_interval: default_interval(),
            health_check_timeout: default_timeout(),
            health_check_retries: default_retries(),
            start_period: default_start_period(),
            cpu: default_cpu(),
            memory: default_memory(),
            environment: BTreeMap::new(),
        }
    }

    fn readiness(&self) -> Readiness {
        Readiness {
            command: self.health_check_command.clone(),
            interval: Duration::from_secs(self.health_check_interval),
            timeout: Duration::from_secs(self.health_check_timeout),
            retries: self.health_check_retries,
            start_period: Duration::from_secs(self.start_period),
        }
    }
}

/// Ensures a workload was supplied and can be run on Fargate.
pub fn validate(workload: Option<&WorkloadSpec>) -> Result<&WorkloadSpec, Error> {
    let Some(workload) = workload else {
        return Err(Error::InvalidWorkloadSpec("no workload supplied".into()));
    };
    if workload.port == 0 {
        return Err(Error::InvalidWorkloadSpec("container port is zero".into()));
    }
    if workload.image.trim().is_empty() {
        return Err(Error::InvalidWorkloadSpec("image reference is empty".into()));
    }
    if workload.name.trim().is_empty() {
        return Err(Error::InvalidWorkloadSpec("container name is empty".into()));
    }
    if workload.health_check_command.is_empty() {
        return Err(Error::InvalidWorkloadSpec(
            "health check command is empty".into(),
        ));
    }
    if !(5..=300).contains(&workload.health_check_interval)
        || !(2..=60).contains(&workload.health_check_timeout)
        || !(1..=10).contains(&workload.health_check_retries)
        || workload.start_period > 300
    {
        return Err(Error::InvalidWorkloadSpec(format!(
            "health check interval {}s (5-300), timeout {}s (2-60), retries {} (1-10) or start period {}s (0-300) out of range",
            workload.health_check_interval,
            workload.health_check_timeout,
            workload.health_check_retries,
            workload.start_period
        )));
    }
    if workload.health_check_timeout >= workload.health_check_interval {
        return Err(Error::InvalidWorkloadSpec(format!(
            "health check timeout {}s must be below interval {}s",
            workload.health_check_timeout, workload.health_check_interval
        )));
    }
    if !fargate_supports(workload.cpu, workload.memory) {
        return Err(Error::InvalidWorkloadSpec(format!(
            "{} MiB with {} cpu units is not a supported Fargate size",
            workload.memory, workload.cpu
        )));
    }
    Ok(workload)
}

/// The created cluster and service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComputeService {
    pub cluster: Handle,
    pub cluster_name: String,
    pub service: Handle,
    pub service_name: String,
    pub task_definition: Handle,
    pub desired_count: u32,
    pub security_group: Handle,
    pub subnets: Vec<Handle>,
    pub container: String,
    pub port: u16,
    /// Readiness contract: no task is healthy until this check passes.
    pub readiness: Readiness,
    /// Instance bounds, set once a scaling policy is attached.
    pub bounds: Option<(u32, u32)>,
}

/// Creates the cluster, task definition, and service.
pub fn build<P: Provisioner>(
    engine: &mut P,
    environment: &str,
    network: &NetworkTopology,
    security: &SecurityBoundary,
    workload: Option<&WorkloadSpec>,
    desired_count: u32,
) -> Result<ComputeService, Error> {
    let workload = validate(workload)?;
    let readiness = workload.readiness();

    // Create cluster
    let cluster_name = name(ResourceKind::Cluster, environment);
    let cluster = engine.create(&cluster_name, Resource::Cluster)?;
    info!(cluster = cluster.id(), "created cluster");

    // Register task definition
    let task_definition = engine.create(
        &name(ResourceKind::TaskDefinition, environment),
        Resource::TaskDefinition {
            cpu: workload.cpu,
            memory: workload.memory,
            container: Container {
                name: workload.name.clone(),
                image: workload.image.clone(),
                port: workload.port,
                readiness: readiness.clone(),
                environment: workload.environment.clone(),
            },
        },
    )?;
    info!(
        task_definition = task_definition.id(),
        image = workload.image.as_str(),
        "registered task definition"
    );

    // Place service in the private subnets behind the service group
    let subnets = network.private_subnets();
    let service_name = name(ResourceKind::Service, environment);
    let service = engine.create(
        &service_name,
        Resource::Service {
            cluster: cluster.clone(),
            task_definition: task_definition.clone(),
            desired_count,
            subnets: subnets.clone(),
            security_groups: vec![security.service.clone()],
        },
    )?;
    info!(
        service = service.id(),
        cluster = cluster.id(),
        desired_count,
        "created service"
    );

    Ok(ComputeService {
        cluster,
        cluster_name,
        service,
        service_name,
        task_definition,
        desired_count,
        security_group: security.service.clone(),
        subnets,
        container: workload.name.clone(),
        port: workload.port,
        readiness,
        bounds: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn workload() -> WorkloadSpec {
        WorkloadSpec::new(
            "public.ecr.aws/nginx/nginx:latest",
            80,
            vec!["CMD-SHELL".into(), "curl -f http://localhost/ || exit 1".into()],
        )
    }

    #[test]
    fn test_absent_workload() {
        assert!(matches!(validate(None), Err(Error::InvalidWorkloadSpec(_))));
    }

    #[test]
    fn test_zero_port() {
        let mut workload = workload();
        workload.port = 0;
        assert!(matches!(
            validate(Some(&workload)),
            Err(Error::InvalidWorkloadSpec(_))
        ));
    }

    #[test]
    fn test_empty_command() {
        let mut workload = workload();
        workload.health_check_command.clear();
        assert!(matches!(
            validate(Some(&workload)),
            Err(Error::InvalidWorkloadSpec(_))
        ));
    }

    #[test_case(|w: &mut WorkloadSpec| w.start_period = 300, true; "longest start period")]
    #[test_case(|w: &mut WorkloadSpec| w.start_period = 301, false; "start period too long")]
    #[test_case(|w: &mut WorkloadSpec| w.health_check_interval = 4, false; "interval too short")]
    #[test_case(|w: &mut WorkloadSpec| w.health_check_interval = u64::MAX, false; "interval too long")]
    #[test_case(|w: &mut WorkloadSpec| w.health_check_timeout = 1, false; "timeout too short")]
    #[test_case(|w: &mut WorkloadSpec| w.health_check_retries = 0, false; "no retries")]
    #[test_case(|w: &mut WorkloadSpec| w.health_check_retries = 11, false; "too many retries")]
    fn test_health_check_limits(mutate: fn(&mut WorkloadSpec), valid: bool) {
        let mut workload = workload();
        mutate(&mut workload);
        assert_eq!(validate(Some(&workload)).is_ok(), valid);
    }

    #[test_case(256, 512, true; "smallest")]
    #[test_case(256, 2048, true; "smallest cpu largest memory")]
    #[test_case(256, 4096, false; "too much memory")]
    #[test_case(256, 1536, false; "unsupported quarter vcpu memory")]
    #[test_case(512, 1536, false; "off step")]
    #[test_case(1024, 8192, true; "one vcpu")]
    #[test_case(4096, 30720, true; "largest")]
    #[test_case(300, 1024, false; "unsupported cpu")]
    fn test_fargate_sizes(cpu: u32, memory: u32, valid: bool) {
        let mut workload = workload();
        workload.cpu = cpu;
        workload.memory = memory;
        assert_eq!(validate(Some(&workload)).is_ok(), valid);
    }

    #[test]
    fn test_deserialize_defaults() {
        let workload: WorkloadSpec = serde_yaml::from_str(
            r#"
image: example/app:1.0
port: 8080
health_check_command: ["CMD", "/healthcheck"]
"#,
        )
        .unwrap();
        assert_eq!(workload.name, "app");
        assert_eq!(workload.start_period, 10);
        assert_eq!(workload.cpu, 256);
        assert_eq!(workload.memory, 512);
        validate(Some(&workload)).unwrap();
    }
}
