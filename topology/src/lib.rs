//! Assemble a load-balanced, autoscaled Fargate service topology.
//!
//! A single [Config] deterministically derives a named graph of infrastructure: a VPC with a
//! public and a private subnet per availability zone (private egress through shared NAT
//! gateways), an edge and a service security group, an ECS cluster and Fargate service running
//! an externally supplied [compute::WorkloadSpec], an internet-facing application load balancer
//! forwarding to the service's target group, and a target-tracking scaling policy keyed on
//! requests per target.
//!
//! Resources are created through a [provision::Provisioner] that the caller passes in. The
//! [assembler] runs every stage in dependency order and either returns the four public
//! identifiers (see [assembler::Outputs]) or a single [StageFailure] naming the stage that
//! failed.
//!
//! # Engines
//!
//! * [provision::memory::Memory] records every request and issues deterministic identifiers
//!   (useful for tests and dry runs).
//! * [provision::template::Template] synthesizes an AWS CloudFormation template.
//!
//! # Status
//!
//! `sidecar-topology` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

use thiserror::Error;

pub mod assembler;
pub use assembler::{assemble, Outputs, Topology};
pub mod balancer;
pub mod compute;
pub mod config;
pub use config::{Config, EnvironmentConfig};
pub mod naming;
pub mod network;
pub mod provision;
pub mod scaling;
pub mod security;

cfg_if::cfg_if! {
    if #[cfg(feature = "aws")] {
        pub mod aws;
    }
}

/// Errors that can occur while planning or provisioning a topology.
#[derive(Debug, Error)]
pub enum Error {
    #[error("capacity exceeded: {requested} /{prefix} subnets requested but {cidr} holds {available}")]
    CapacityExceeded {
        cidr: network::Ipv4Block,
        prefix: u8,
        requested: u64,
        available: u64,
    },
    #[error("invalid workload spec: {0}")]
    InvalidWorkloadSpec(String),
    #[error("invalid scaling bounds: {0}")]
    InvalidScalingBounds(String),
    #[error("invalid environment name: {0}")]
    InvalidEnvironment(String),
    #[error("invalid port: {0}")]
    InvalidPort(u16),
    #[error("invalid health check: {0}")]
    InvalidHealthCheck(String),
    #[error("invalid network: {0}")]
    InvalidNetwork(String),
    #[error("provisioning failed: {0}")]
    Provision(#[from] provision::Error),
}

/// A stage of topology assembly, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Network,
    Security,
    Compute,
    LoadBalancing,
    Scaling,
}

impl Stage {
    /// Returns the stage's name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Network => "network",
            Stage::Security => "security",
            Stage::Compute => "compute",
            Stage::LoadBalancing => "load-balancing",
            Stage::Scaling => "scaling",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The first stage to fail during assembly and why.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {error}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub error: Error,
}

impl StageFailure {
    /// Attributes an error to a stage.
    pub fn new(stage: Stage, error: Error) -> Self {
        Self { stage, error }
    }
}
