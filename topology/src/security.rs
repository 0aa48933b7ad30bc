//! Create the edge and service security groups.
//!
//! The edge group fronts the load balancer and admits the published port from anywhere. The
//! service group fronts the tasks and admits the service port only from the edge group. The
//! service rule names the edge group rather than an address range, so it stays valid however
//! the load balancer's addresses change.

use crate::{
    naming::{name, ResourceKind},
    network::{Ipv4Block, NetworkTopology},
    provision::{Handle, Provisioner, Resource, Source},
    Error,
};
use tracing::info;

/// An inbound rule attached to a security group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressRule {
    pub group: Handle,
    pub port: u16,
    pub source: Source,
}

/// The two trust boundaries of the topology and the rules between them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityBoundary {
    pub edge: Handle,
    pub service: Handle,
    pub rules: Vec<IngressRule>,
}

impl SecurityBoundary {
    /// Returns the inbound rules of `group`.
    pub fn rules_for<'a>(&'a self, group: &'a Handle) -> impl Iterator<Item = &'a IngressRule> {
        self.rules.iter().filter(move |rule| &rule.group == group)
    }
}

/// Ensures both ports can be used in a rule.
pub fn validate(published_port: u16, service_port: u16) -> Result<(), Error> {
    for port in [published_port, service_port] {
        if port == 0 {
            return Err(Error::InvalidPort(port));
        }
    }
    Ok(())
}

/// Creates the edge group, then the service group trusting it.
pub fn build<P: Provisioner>(
    engine: &mut P,
    environment: &str,
    network: &NetworkTopology,
    published_port: u16,
    service_port: u16,
) -> Result<SecurityBoundary, Error> {
    validate(published_port, service_port)?;
    let mut rules = Vec::with_capacity(2);

    // Create edge group open to the internet on the published port
    let edge = engine.create(
        &name(ResourceKind::EdgeSecurityGroup, environment),
        Resource::SecurityGroup {
            vpc: network.id.clone(),
            description: format!("load balancer ingress for {environment}"),
        },
    )?;
    engine.create(
        &name(ResourceKind::EdgeIngress, environment),
        Resource::IngressRule {
            group: edge.clone(),
            port: published_port,
            source: Source::Cidr(Ipv4Block::ANY),
            description: "internet".into(),
        },
    )?;
    rules.push(IngressRule {
        group: edge.clone(),
        port: published_port,
        source: Source::Cidr(Ipv4Block::ANY),
    });
    info!(sg = edge.id(), port = published_port, "created edge security group");

    // Create service group reachable only from the edge group
    let service = engine.create(
        &name(ResourceKind::ServiceSecurityGroup, environment),
        Resource::SecurityGroup {
            vpc: network.id.clone(),
            description: format!("service ingress for {environment}"),
        },
    )?;
    engine.create(
        &name(ResourceKind::ServiceIngress, environment),
        Resource::IngressRule {
            group: service.clone(),
            port: service_port,
            source: Source::Group(edge.clone()),
            description: "load balancer".into(),
        },
    )?;
    rules.push(IngressRule {
        group: service.clone(),
        port: service_port,
        source: Source::Group(edge.clone()),
    });
    info!(
        sg = service.id(),
        source = edge.id(),
        port = service_port,
        "created service security group"
    );

    Ok(SecurityBoundary {
        edge,
        service,
        rules,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        network::{self, NetworkConfig},
        provision::memory::Memory,
    };

    fn network(engine: &mut Memory) -> NetworkTopology {
        let zones = vec!["us-east-1a".to_string(), "us-east-1b".to_string()];
        let plan = network::plan(&NetworkConfig::default(), &zones).unwrap();
        network::build(engine, "dev", &plan).unwrap()
    }

    #[test]
    fn test_edge_open_service_restricted() {
        let mut engine = Memory::new("us-east-1");
        let network = network(&mut engine);
        let boundary = build(&mut engine, "dev", &network, 80, 80).unwrap();

        let edge: Vec<_> = boundary.rules_for(&boundary.edge).collect();
        assert_eq!(edge.len(), 1);
        assert_eq!(edge[0].port, 80);
        assert_eq!(edge[0].source, Source::Cidr(Ipv4Block::ANY));

        let service: Vec<_> = boundary.rules_for(&boundary.service).collect();
        assert_eq!(service.len(), 1);
        assert_eq!(service[0].port, 80);
        assert_eq!(service[0].source, Source::Group(boundary.edge.clone()));
        assert_eq!(engine.count("security-group"), 2);
    }

    #[test]
    fn test_service_port_follows_workload() {
        let mut engine = Memory::new("us-east-1");
        let network = network(&mut engine);
        let boundary = build(&mut engine, "dev", &network, 80, 8080).unwrap();
        let service: Vec<_> = boundary.rules_for(&boundary.service).collect();
        assert_eq!(service[0].port, 8080);
    }

    #[test]
    fn test_zero_port_rejected_before_creation() {
        let mut engine = Memory::new("us-east-1");
        let network = network(&mut engine);
        let before = engine.requests().len();
        assert!(matches!(
            build(&mut engine, "dev", &network, 0, 80),
            Err(Error::InvalidPort(0))
        ));
        assert_eq!(engine.requests().len(), before);
    }
}
