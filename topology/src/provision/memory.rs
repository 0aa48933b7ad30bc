//! In-memory [Provisioner] for tests and dry runs.
//!
//! Issues AWS-shaped identifiers deterministically (the `n`-th resource of a run always gets the
//! same identifier), rejects duplicate names and references to handles it did not issue, and
//! records every accepted request in order. Failures can be injected by resource kind or after a
//! number of accepted requests.

use super::{Error, Handle, Provisioner, Resource};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

/// Account embedded in issued ARNs.
const ACCOUNT: &str = "000000000000";

/// A fake engine that keeps every created resource in memory.
#[derive(Clone, Debug)]
pub struct Memory {
    region: String,
    next: u64,
    issued: HashSet<Handle>,
    names: BTreeMap<String, usize>,
    requests: Vec<(Handle, Resource)>,
    fail_on: BTreeSet<String>,
    fail_after: Option<usize>,
}

impl Memory {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            next: 0,
            issued: HashSet::new(),
            names: BTreeMap::new(),
            requests: Vec::new(),
            fail_on: BTreeSet::new(),
            fail_after: None,
        }
    }

    /// Rejects every later request for resources of `kind` (see [Resource::kind]).
    pub fn fail_on(&mut self, kind: &str) {
        self.fail_on.insert(kind.to_string());
    }

    /// Rejects every request once `accepted` requests have succeeded.
    pub fn fail_after(&mut self, accepted: usize) {
        self.fail_after = Some(accepted);
    }

    /// Accepted requests, in the order they were made.
    pub fn requests(&self) -> &[(Handle, Resource)] {
        &self.requests
    }

    /// Number of accepted requests for resources of `kind`.
    pub fn count(&self, kind: &str) -> usize {
        self.requests
            .iter()
            .filter(|(_, resource)| resource.kind() == kind)
            .count()
    }

    /// Returns the resource created under `name`.
    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.names.get(name).map(|idx| &self.requests[*idx].1)
    }

    /// Returns the resources of `kind`, in creation order.
    pub fn resources<'a>(
        &'a self,
        kind: &'a str,
    ) -> impl Iterator<Item = &'a (Handle, Resource)> + 'a {
        self.requests
            .iter()
            .filter(move |(_, resource)| resource.kind() == kind)
    }

    fn identifier(&mut self, name: &str, resource: &Resource) -> String {
        self.next += 1;
        let n = self.next;
        let region = &self.region;
        match resource {
            Resource::Vpc { .. } => format!("vpc-{n:017x}"),
            Resource::InternetGateway => format!("igw-{n:017x}"),
            Resource::GatewayAttachment { .. } => format!("igw-attach-{n:017x}"),
            Resource::Subnet { .. } => format!("subnet-{n:017x}"),
            Resource::ElasticIp => format!("eipalloc-{n:017x}"),
            Resource::NatGateway { .. } => format!("nat-{n:017x}"),
            Resource::RouteTable { .. } => format!("rtb-{n:017x}"),
            Resource::Route { .. } => format!("r-rtb-{n:017x}"),
            Resource::RouteTableAssociation { .. } => format!("rtbassoc-{n:017x}"),
            Resource::SecurityGroup { .. } => format!("sg-{n:017x}"),
            Resource::IngressRule { .. } => format!("sgr-{n:017x}"),
            Resource::Cluster => format!("arn:aws:ecs:{region}:{ACCOUNT}:cluster/{name}"),
            Resource::TaskDefinition { .. } => {
                format!("arn:aws:ecs:{region}:{ACCOUNT}:task-definition/{name}:1")
            }
            Resource::Service { .. } => format!("arn:aws:ecs:{region}:{ACCOUNT}:service/{name}"),
            Resource::TargetGroup { .. } => format!(
                "arn:aws:elasticloadbalancing:{region}:{ACCOUNT}:targetgroup/{name}/{n:016x}"
            ),
            Resource::LoadBalancer { .. } => format!(
                "arn:aws:elasticloadbalancing:{region}:{ACCOUNT}:loadbalancer/app/{name}/{n:016x}"
            ),
            Resource::Listener { .. } => format!(
                "arn:aws:elasticloadbalancing:{region}:{ACCOUNT}:listener/app/{name}/{n:016x}"
            ),
            Resource::TargetRegistration { .. } => format!("registration-{n:017x}"),
            Resource::ScalableTarget {
                cluster,
                service_name,
                ..
            } => format!("service/{cluster}/{service_name}"),
            Resource::ScalingPolicy { .. } => format!(
                "arn:aws:autoscaling:{region}:{ACCOUNT}:scalingPolicy:{n:016x}:policyName/{name}"
            ),
        }
    }
}

impl Provisioner for Memory {
    fn create(&mut self, name: &str, resource: Resource) -> Result<Handle, Error> {
        if self.names.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        if let Some(unknown) = resource
            .references()
            .into_iter()
            .find(|handle| !self.issued.contains(*handle))
        {
            return Err(Error::UnknownReference(unknown.name().to_string()));
        }
        if self.fail_on.contains(resource.kind()) {
            return Err(Error::Rejected {
                name: name.to_string(),
                reason: format!("injected failure for {}", resource.kind()),
            });
        }
        if matches!(self.fail_after, Some(accepted) if self.requests.len() >= accepted) {
            return Err(Error::Rejected {
                name: name.to_string(),
                reason: format!("injected failure after {} requests", self.requests.len()),
            });
        }

        let handle = Handle::new(name, self.identifier(name, &resource));
        debug!(
            kind = resource.kind(),
            name,
            id = handle.id(),
            "created resource"
        );
        self.issued.insert(handle.clone());
        self.names.insert(name.to_string(), self.requests.len());
        self.requests.push((handle.clone(), resource));
        Ok(handle)
    }

    fn address(&self, load_balancer: &Handle) -> Result<String, Error> {
        if !self.issued.contains(load_balancer) {
            return Err(Error::UnknownReference(load_balancer.name().to_string()));
        }
        match self.get(load_balancer.name()) {
            Some(Resource::LoadBalancer { .. }) => {
                // Suffix is the numeric part of the issued identifier
                let suffix = load_balancer
                    .id()
                    .rsplit('/')
                    .next()
                    .and_then(|hex| u64::from_str_radix(hex, 16).ok())
                    .unwrap_or_default();
                Ok(format!(
                    "{}-{suffix}.{}.elb.amazonaws.com",
                    load_balancer.name(),
                    self.region
                ))
            }
            _ => Err(Error::NotALoadBalancer(load_balancer.name().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Ipv4Block;

    fn vpc() -> Resource {
        Resource::Vpc {
            cidr: "10.0.0.0/16".parse().unwrap(),
        }
    }

    #[test]
    fn test_identifiers_are_deterministic() {
        let mut a = Memory::new("us-east-1");
        let mut b = Memory::new("us-east-1");
        let first = a.create("sidecar-vpc-dev", vpc()).unwrap();
        let second = b.create("sidecar-vpc-dev", vpc()).unwrap();
        assert_eq!(first, second);
        assert!(first.id().starts_with("vpc-"));
        let cluster = a.create("sidecar-cluster-dev", Resource::Cluster).unwrap();
        assert_eq!(
            cluster.id(),
            "arn:aws:ecs:us-east-1:000000000000:cluster/sidecar-cluster-dev"
        );
    }

    #[test]
    fn test_rejects_duplicate_name() {
        let mut engine = Memory::new("us-east-1");
        engine.create("sidecar-vpc-dev", vpc()).unwrap();
        assert!(matches!(
            engine.create("sidecar-vpc-dev", vpc()),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(engine.requests().len(), 1);
    }

    #[test]
    fn test_rejects_unknown_reference() {
        let mut engine = Memory::new("us-east-1");
        let mut other = Memory::new("us-east-1");
        let foreign = other.create("sidecar-vpc-dev", vpc()).unwrap();
        let result = engine.create(
            "sidecar-publicrt-dev",
            Resource::RouteTable { vpc: foreign },
        );
        assert!(matches!(result, Err(Error::UnknownReference(_))));
        assert!(engine.requests().is_empty());
    }

    #[test]
    fn test_fail_on_kind() {
        let mut engine = Memory::new("us-east-1");
        engine.fail_on("internet-gateway");
        engine.create("sidecar-vpc-dev", vpc()).unwrap();
        assert!(matches!(
            engine.create("sidecar-igw-dev", Resource::InternetGateway),
            Err(Error::Rejected { .. })
        ));
        assert_eq!(engine.count("vpc"), 1);
        assert_eq!(engine.count("internet-gateway"), 0);
    }

    #[test]
    fn test_fail_after() {
        let mut engine = Memory::new("us-east-1");
        engine.fail_after(1);
        engine.create("sidecar-vpc-dev", vpc()).unwrap();
        assert!(matches!(
            engine.create("sidecar-igw-dev", Resource::InternetGateway),
            Err(Error::Rejected { .. })
        ));
    }

    #[test]
    fn test_address() {
        let mut engine = Memory::new("eu-west-1");
        let vpc = engine.create("sidecar-vpc-dev", vpc()).unwrap();
        let subnet = engine
            .create(
                "sidecar-publicsubnet-0-dev",
                Resource::Subnet {
                    vpc: vpc.clone(),
                    cidr: Ipv4Block::new([10, 0, 0, 0].into(), 24).unwrap(),
                    zone: "eu-west-1a".into(),
                    tier: crate::provision::Tier::Public,
                },
            )
            .unwrap();
        let lb = engine
            .create(
                "sidecar-lb-dev",
                Resource::LoadBalancer {
                    subnets: vec![subnet],
                    security_groups: Vec::new(),
                },
            )
            .unwrap();
        assert_eq!(
            engine.address(&lb).unwrap(),
            "sidecar-lb-dev-3.eu-west-1.elb.amazonaws.com"
        );
        assert!(matches!(
            engine.address(&vpc),
            Err(Error::NotALoadBalancer(_))
        ));
        assert!(matches!(
            engine.address(&Handle::new("sidecar-lb-prod", "lb-1")),
            Err(Error::UnknownReference(_))
        ));
    }
}
