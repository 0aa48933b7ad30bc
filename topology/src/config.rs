//! Deployment configuration.
//!
//! A [Config] is usually loaded from YAML. Only `environment` and `workload` have no default.

use crate::{
    balancer::HealthCheckConfig, compute::WorkloadSpec, naming, network::NetworkConfig,
    scaling::ScalingConfig, Error,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Region used when none is configured.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Port published by the load balancer when none is configured.
pub const DEFAULT_PUBLISHED_PORT: u16 = 80;

fn default_region() -> String {
    DEFAULT_REGION.into()
}

fn default_published_port() -> u16 {
    DEFAULT_PUBLISHED_PORT
}

fn default_desired_count() -> u32 {
    1
}

/// Everything needed to assemble one environment's topology.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Environment name, embedded verbatim in every resource name.
    pub environment: String,
    /// Region (site) to deploy into.
    #[serde(default = "default_region")]
    pub region: String,
    /// Availability zones to place subnets in (defaults to `<region>a`, `<region>b`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<String>>,
    /// Port the load balancer listens on.
    #[serde(default = "default_published_port")]
    pub published_port: u16,
    /// Number of tasks to start with.
    #[serde(default = "default_desired_count")]
    pub desired_count: u32,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Container to run; supplied by an external build step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<WorkloadSpec>,
}

impl Config {
    /// Creates a configuration with defaults everywhere but the environment and workload.
    pub fn new(environment: impl Into<String>, workload: WorkloadSpec) -> Self {
        Self {
            environment: environment.into(),
            region: default_region(),
            zones: None,
            published_port: default_published_port(),
            desired_count: default_desired_count(),
            scaling: ScalingConfig::default(),
            network: NetworkConfig::default(),
            health_check: HealthCheckConfig::default(),
            workload: Some(workload),
        }
    }

    /// Returns the configured zones, or derives `<region>a`, `<region>b`, ... (one per
    /// availability zone requested).
    pub fn zones(&self) -> Vec<String> {
        match &self.zones {
            Some(zones) => zones.clone(),
            None => default_zones(&self.region, self.network.availability_zones),
        }
    }

    /// Returns the environment parameters the assembler is keyed on.
    pub fn environment_config(&self) -> EnvironmentConfig {
        EnvironmentConfig {
            environment: self.environment.clone(),
            min_instances: self.scaling.min_instances,
            max_instances: self.scaling.max_instances,
            requests_per_instance_target: self.scaling.requests_per_instance_target,
            desired_count: self.desired_count,
            scale_in_cooldown: self.scaling.scale_in_cooldown(),
            scale_out_cooldown: self.scaling.scale_out_cooldown(),
        }
    }
}

/// Derives zone names the way AWS names them (`us-east-1a`, `us-east-1b`, ...).
pub fn default_zones(region: &str, count: usize) -> Vec<String> {
    (b'a'..=b'z')
        .take(count)
        .map(|suffix| format!("{region}{}", suffix as char))
        .collect()
}

/// Environment name, scaling bounds, and target ratio.
///
/// Derived from a [Config] by the assembler and handed to the scaling stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub environment: String,
    pub min_instances: u32,
    pub max_instances: u32,
    pub requests_per_instance_target: u32,
    pub desired_count: u32,
    pub scale_in_cooldown: Duration,
    pub scale_out_cooldown: Duration,
}

impl EnvironmentConfig {
    /// Ensures the name can be embedded in resource names and the scaling parameters hold.
    pub fn validate(&self) -> Result<(), Error> {
        naming::validate_environment(&self.environment)?;
        ScalingConfig {
            min_instances: self.min_instances,
            max_instances: self.max_instances,
            requests_per_instance_target: self.requests_per_instance_target,
            scale_in_cooldown: self.scale_in_cooldown.as_secs(),
            scale_out_cooldown: self.scale_out_cooldown.as_secs(),
        }
        .validate(self.desired_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml() {
        let config: Config = serde_yaml::from_str(
            r#"
environment: dev
workload:
  image: example/app:1.0
  port: 80
  health_check_command: ["CMD-SHELL", "curl -f http://localhost/health || exit 1"]
"#,
        )
        .unwrap();
        assert_eq!(config.environment, "dev");
        assert_eq!(config.region, DEFAULT_REGION);
        assert_eq!(config.published_port, 80);
        assert_eq!(config.desired_count, 1);
        assert_eq!(config.scaling, ScalingConfig::default());
        assert_eq!(config.scaling.max_instances, 10);
        assert_eq!(config.scaling.requests_per_instance_target, 1000);
        assert_eq!(config.network, NetworkConfig::default());
        assert_eq!(config.network.cidr.to_string(), "10.0.0.0/16");
        assert_eq!(config.health_check, HealthCheckConfig::default());
        assert_eq!(config.zones(), vec!["us-east-1a", "us-east-1b"]);
        assert_eq!(config.workload.unwrap().port, 80);
    }

    #[test]
    fn test_full_yaml() {
        let config: Config = serde_yaml::from_str(
            r#"
environment: staging
region: eu-west-1
zones: [eu-west-1b, eu-west-1c]
published_port: 8080
desired_count: 2
scaling:
  min_instances: 2
  max_instances: 4
  requests_per_instance_target: 500
  scale_in_cooldown: 300
network:
  cidr: 10.20.0.0/16
  availability_zones: 2
health_check:
  path: /ready
workload:
  image: example/app:1.0
  port: 8080
  health_check_command: ["CMD", "/bin/ready"]
  environment:
    DD_ENV: staging
"#,
        )
        .unwrap();
        assert_eq!(config.zones(), vec!["eu-west-1b", "eu-west-1c"]);
        assert_eq!(config.scaling.scale_in_cooldown, 300);
        assert_eq!(config.scaling.scale_out_cooldown, 60);
        assert_eq!(config.network.cidr.to_string(), "10.20.0.0/16");
        assert_eq!(config.health_check.path, "/ready");
        assert_eq!(config.health_check.interval, 30);
        let environment = config.environment_config();
        assert_eq!(environment.min_instances, 2);
        assert_eq!(environment.requests_per_instance_target, 500);
        assert_eq!(environment.desired_count, 2);
        assert_eq!(environment.scale_in_cooldown, Duration::from_secs(300));
        environment.validate().unwrap();
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let result = serde_yaml::from_str::<Config>("environment: dev\nreplicas: 3\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_bad_cidr() {
        let result = serde_yaml::from_str::<Config>("environment: dev\nnetwork:\n  cidr: 10.0.0.1/16\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_environment_config_validate() {
        let mut environment = EnvironmentConfig {
            environment: "dev".into(),
            min_instances: 1,
            max_instances: 10,
            requests_per_instance_target: 1000,
            desired_count: 1,
            scale_in_cooldown: Duration::from_secs(60),
            scale_out_cooldown: Duration::from_secs(60),
        };
        environment.validate().unwrap();
        environment.environment = String::new();
        assert!(matches!(
            environment.validate(),
            Err(Error::InvalidEnvironment(_))
        ));
        environment.environment = "dev".into();
        environment.desired_count = 11;
        assert!(matches!(
            environment.validate(),
            Err(Error::InvalidScalingBounds(_))
        ));
        environment.desired_count = 1;
        environment.max_instances = 0;
        assert!(matches!(
            environment.validate(),
            Err(Error::InvalidScalingBounds(_))
        ));
    }
}
