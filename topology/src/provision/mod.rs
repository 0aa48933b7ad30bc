//! Hand resource declarations to an external provisioning engine.
//!
//! Builders never talk to a cloud directly. They describe each resource as a [Resource] and pass
//! it to a [Provisioner], which returns a [Handle] that later resources use to reference it.
//! Because a [Handle] only exists once its resource was created, a resource can never reference
//! something that does not exist yet.
//!
//! The engine is always passed explicitly (there is no global client), so independent assemblies
//! never share state and tests can inject [memory::Memory].

use crate::network::Ipv4Block;
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;

pub mod memory;
pub mod template;

/// Errors returned by a [Provisioner].
#[derive(Debug, Error)]
pub enum Error {
    #[error("resource already exists: {0}")]
    AlreadyExists(String),
    #[error("reference to unknown resource: {0}")]
    UnknownReference(String),
    #[error("not a load balancer: {0}")]
    NotALoadBalancer(String),
    #[error("engine rejected {name}: {reason}")]
    Rejected { name: String, reason: String },
}

/// Reference to a resource created by a [Provisioner].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    name: String,
    id: String,
}

impl Handle {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }

    /// Name derived by the naming policy.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier issued by the engine.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Engine that creates resources on behalf of the assembler.
///
/// Calls are synchronous: each either succeeds, returning a [Handle], or fails. Retry and rollback
/// are the engine's concern.
pub trait Provisioner {
    /// Creates `resource` under `name`.
    fn create(&mut self, name: &str, resource: Resource) -> Result<Handle, Error>;

    /// Returns the public address of a load balancer created by this engine.
    fn address(&self, load_balancer: &Handle) -> Result<String, Error>;
}

/// Tier of a subnet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Routes directly to the internet gateway.
    Public,
    /// Egresses through a NAT gateway.
    Private,
}

/// Next hop of a route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteTarget {
    InternetGateway(Handle),
    NatGateway(Handle),
}

impl RouteTarget {
    /// Returns the gateway the route sends traffic to.
    pub fn gateway(&self) -> &Handle {
        match self {
            RouteTarget::InternetGateway(handle) | RouteTarget::NatGateway(handle) => handle,
        }
    }
}

/// Origin of traffic admitted by an ingress rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    /// Any address within the block.
    Cidr(Ipv4Block),
    /// Any network interface attached to the group.
    Group(Handle),
}

/// Command the orchestrator runs to decide whether a container is ready.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Readiness {
    pub command: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

/// Container run by a task definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub port: u16,
    pub readiness: Readiness,
    pub environment: BTreeMap<String, String>,
}

/// Health check a target group runs against its members.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetHealthCheck {
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

/// Declaration of a single resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resource {
    Vpc {
        cidr: Ipv4Block,
    },
    InternetGateway,
    GatewayAttachment {
        vpc: Handle,
        gateway: Handle,
    },
    Subnet {
        vpc: Handle,
        cidr: Ipv4Block,
        zone: String,
        tier: Tier,
    },
    ElasticIp,
    NatGateway {
        subnet: Handle,
        address: Handle,
    },
    RouteTable {
        vpc: Handle,
    },
    Route {
        table: Handle,
        destination: Ipv4Block,
        target: RouteTarget,
    },
    RouteTableAssociation {
        table: Handle,
        subnet: Handle,
    },
    /// Security group allowing all outbound traffic and, until rules are added, no inbound.
    SecurityGroup {
        vpc: Handle,
        description: String,
    },
    IngressRule {
        group: Handle,
        port: u16,
        source: Source,
        description: String,
    },
    Cluster,
    TaskDefinition {
        cpu: u32,
        memory: u32,
        container: Container,
    },
    Service {
        cluster: Handle,
        task_definition: Handle,
        desired_count: u32,
        subnets: Vec<Handle>,
        security_groups: Vec<Handle>,
    },
    TargetGroup {
        vpc: Handle,
        port: u16,
        health_check: TargetHealthCheck,
    },
    /// Internet-facing application load balancer.
    LoadBalancer {
        subnets: Vec<Handle>,
        security_groups: Vec<Handle>,
    },
    /// Listener forwarding all traffic on `port` to `target_group`.
    Listener {
        load_balancer: Handle,
        port: u16,
        target_group: Handle,
    },
    /// Registers the tasks of `service` with `target_group` as they start and stop.
    TargetRegistration {
        target_group: Handle,
        service: Handle,
        container: String,
        port: u16,
        grace_period: Duration,
    },
    ScalableTarget {
        service: Handle,
        cluster: String,
        service_name: String,
        min: u32,
        max: u32,
    },
    /// Target tracking policy on requests per target.
    ScalingPolicy {
        target: Handle,
        load_balancer: Handle,
        target_group: Handle,
        requests_per_target: u32,
        scale_in_cooldown: Duration,
        scale_out_cooldown: Duration,
    },
}

impl Resource {
    /// Returns the resource's type name.
    pub fn kind(&self) -> &'static str {
        match self {
            Resource::Vpc { .. } => "vpc",
            Resource::InternetGateway => "internet-gateway",
            Resource::GatewayAttachment { .. } => "gateway-attachment",
            Resource::Subnet { .. } => "subnet",
            Resource::ElasticIp => "elastic-ip",
            Resource::NatGateway { .. } => "nat-gateway",
            Resource::RouteTable { .. } => "route-table",
            Resource::Route { .. } => "route",
            Resource::RouteTableAssociation { .. } => "route-table-association",
            Resource::SecurityGroup { .. } => "security-group",
            Resource::IngressRule { .. } => "ingress-rule",
            Resource::Cluster => "cluster",
            Resource::TaskDefinition { .. } => "task-definition",
            Resource::Service { .. } => "service",
            Resource::TargetGroup { .. } => "target-group",
            Resource::LoadBalancer { .. } => "load-balancer",
            Resource::Listener { .. } => "listener",
            Resource::TargetRegistration { .. } => "target-registration",
            Resource::ScalableTarget { .. } => "scalable-target",
            Resource::ScalingPolicy { .. } => "scaling-policy",
        }
    }

    /// Returns every resource this one references.
    pub fn references(&self) -> Vec<&Handle> {
        match self {
            Resource::Vpc { .. }
            | Resource::InternetGateway
            | Resource::ElasticIp
            | Resource::Cluster
            | Resource::TaskDefinition { .. } => Vec::new(),
            Resource::GatewayAttachment { vpc, gateway } => vec![vpc, gateway],
            Resource::Subnet { vpc, .. }
            | Resource::RouteTable { vpc }
            | Resource::SecurityGroup { vpc, .. }
            | Resource::TargetGroup { vpc, .. } => vec![vpc],
            Resource::NatGateway { subnet, address } => vec![subnet, address],
            Resource::Route { table, target, .. } => vec![table, target.gateway()],
            Resource::RouteTableAssociation { table, subnet } => vec![table, subnet],
            Resource::IngressRule { group, source, .. } => match source {
                Source::Cidr(_) => vec![group],
                Source::Group(source) => vec![group, source],
            },
            Resource::Service {
                cluster,
                task_definition,
                subnets,
                security_groups,
                ..
            } => {
                let mut references = vec![cluster, task_definition];
                references.extend(subnets);
                references.extend(security_groups);
                references
            }
            Resource::LoadBalancer {
                subnets,
                security_groups,
            } => subnets.iter().chain(security_groups).collect(),
            Resource::Listener {
                load_balancer,
                target_group,
                ..
            } => vec![load_balancer, target_group],
            Resource::TargetRegistration {
                target_group,
                service,
                ..
            } => vec![target_group, service],
            Resource::ScalableTarget { service, .. } => vec![service],
            Resource::ScalingPolicy {
                target,
                load_balancer,
                target_group,
                ..
            } => vec![target, load_balancer, target_group],
        }
    }
}
