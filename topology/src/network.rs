//! Allocate the VPC, its subnets, and egress.
//!
//! The VPC's address block is partitioned into equally sized blocks. Blocks are handed out in
//! order, alternating tiers, so zone `z` receives block `2z` as its public subnet and block
//! `2z + 1` as its private subnet. Public subnets share one route table with a default route to
//! the internet gateway. Each private subnet gets its own route table whose only default route
//! points at a NAT gateway (zone `z` uses NAT `z % nat_gateways`), and NAT gateways live in the
//! public subnets of the first zones.

use crate::{
    naming::{indexed, name, ResourceKind},
    provision::{Handle, Provisioner, Resource, RouteTarget, Tier},
    Error,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt, net::Ipv4Addr, str::FromStr};
use tracing::{debug, info};

/// Smallest subnet AWS allows.
pub const MAX_SUBNET_PREFIX: u8 = 28;

/// IPv4 address block in CIDR notation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Block {
    address: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Block {
    /// The unrestricted internet range (`0.0.0.0/0`).
    pub const ANY: Ipv4Block = Ipv4Block {
        address: Ipv4Addr::UNSPECIFIED,
        prefix: 0,
    };

    /// Creates a block, rejecting prefixes above 32 and addresses with host bits set.
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self, Error> {
        if prefix > 32 {
            return Err(Error::InvalidNetwork(format!("invalid prefix /{prefix}")));
        }
        if u32::from(address) & !mask(prefix) != 0 {
            return Err(Error::InvalidNetwork(format!(
                "{address}/{prefix} has host bits set"
            )));
        }
        Ok(Self { address, prefix })
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of `/prefix` blocks this block can be partitioned into.
    pub fn capacity(&self, prefix: u8) -> u64 {
        if prefix < self.prefix || prefix > 32 {
            return 0;
        }
        1u64 << (prefix - self.prefix)
    }

    /// Returns the `index`-th `/prefix` block within this block.
    pub fn subnet(&self, prefix: u8, index: u64) -> Option<Ipv4Block> {
        if index >= self.capacity(prefix) {
            return None;
        }
        let size = 1u64 << (32 - prefix);
        let start = u64::from(u32::from(self.address)) + index * size;
        Some(Ipv4Block {
            address: Ipv4Addr::from(start as u32),
            prefix,
        })
    }

    /// Returns whether `other` lies entirely within this block.
    pub fn contains(&self, other: &Ipv4Block) -> bool {
        other.prefix >= self.prefix
            && u32::from(other.address) & mask(self.prefix) == u32::from(self.address)
    }

    /// Returns whether the two blocks share any address.
    pub fn overlaps(&self, other: &Ipv4Block) -> bool {
        self.contains(other) || other.contains(self)
    }
}

fn mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        prefix => u32::MAX << (32 - u32::from(prefix)),
    }
}

impl fmt::Display for Ipv4Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl FromStr for Ipv4Block {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidNetwork(format!("{s} is not in CIDR notation")))?;
        let address = address
            .parse::<Ipv4Addr>()
            .map_err(|_| Error::InvalidNetwork(format!("invalid address in {s}")))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|_| Error::InvalidNetwork(format!("invalid prefix in {s}")))?;
        Ipv4Block::new(address, prefix)
    }
}

impl TryFrom<String> for Ipv4Block {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Block> for String {
    fn from(value: Ipv4Block) -> Self {
        value.to_string()
    }
}

/// Shape of the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Address block of the whole VPC.
    pub cidr: Ipv4Block,
    /// Number of availability zones to spread subnets across.
    pub availability_zones: usize,
    /// Prefix length of every subnet.
    pub subnet_prefix: u8,
    /// Number of NAT gateways shared by the private subnets.
    pub nat_gateways: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cidr: Ipv4Block {
                address: Ipv4Addr::new(10, 0, 0, 0),
                prefix: 16,
            },
            availability_zones: 2,
            subnet_prefix: 24,
            nat_gateways: 1,
        }
    }
}

/// Address blocks assigned to one availability zone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZonePlan {
    pub zone: String,
    pub public: Ipv4Block,
    pub private: Ipv4Block,
}

/// Validated address layout, computed before anything is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkPlan {
    pub cidr: Ipv4Block,
    pub zones: Vec<ZonePlan>,
    pub nat_gateways: usize,
}

/// Validates `config` against the zones offered and assigns every subnet its address block.
pub fn plan(config: &NetworkConfig, zones: &[String]) -> Result<NetworkPlan, Error> {
    if config.availability_zones == 0 {
        return Err(Error::InvalidNetwork(
            "at least one availability zone is required".into(),
        ));
    }
    if config.subnet_prefix < config.cidr.prefix() || config.subnet_prefix > MAX_SUBNET_PREFIX {
        return Err(Error::InvalidNetwork(format!(
            "subnet prefix /{} must be between /{} and /{MAX_SUBNET_PREFIX}",
            config.subnet_prefix,
            config.cidr.prefix()
        )));
    }
    let requested = (config.availability_zones as u64).saturating_mul(2);
    let available = config.cidr.capacity(config.subnet_prefix);
    if requested > available {
        return Err(Error::CapacityExceeded {
            cidr: config.cidr,
            prefix: config.subnet_prefix,
            requested,
            available,
        });
    }
    if zones.len() < config.availability_zones {
        return Err(Error::InvalidNetwork(format!(
            "{} availability zones requested but only {} available",
            config.availability_zones,
            zones.len()
        )));
    }
    let mut seen = HashSet::new();
    if let Some(repeated) = zones
        .iter()
        .take(config.availability_zones)
        .find(|zone| !seen.insert(zone.as_str()))
    {
        return Err(Error::InvalidNetwork(format!(
            "availability zone {repeated} listed more than once"
        )));
    }
    if config.nat_gateways == 0 || config.nat_gateways > config.availability_zones {
        return Err(Error::InvalidNetwork(format!(
            "{} NAT gateways requested for {} availability zones",
            config.nat_gateways, config.availability_zones
        )));
    }

    let zones = zones
        .iter()
        .take(config.availability_zones)
        .enumerate()
        .map(|(idx, zone)| {
            let idx = idx as u64;
            // Capacity was checked above
            let public = config.cidr.subnet(config.subnet_prefix, 2 * idx);
            let private = config.cidr.subnet(config.subnet_prefix, 2 * idx + 1);
            match (public, private) {
                (Some(public), Some(private)) => Ok(ZonePlan {
                    zone: zone.clone(),
                    public,
                    private,
                }),
                _ => Err(Error::CapacityExceeded {
                    cidr: config.cidr,
                    prefix: config.subnet_prefix,
                    requested,
                    available,
                }),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    debug!(cidr = %config.cidr, zones = zones.len(), "planned network");
    Ok(NetworkPlan {
        cidr: config.cidr,
        zones,
        nat_gateways: config.nat_gateways,
    })
}

/// A created subnet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnetRef {
    pub handle: Handle,
    pub cidr: Ipv4Block,
    pub zone: String,
}

/// The public and private subnet of one availability zone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnetPair {
    pub public: SubnetRef,
    pub private: SubnetRef,
}

/// A created route table, its default route, and the subnets it serves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteTableRef {
    pub handle: Handle,
    pub default_route: RouteTarget,
    pub subnets: Vec<Handle>,
}

/// The created network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkTopology {
    pub id: Handle,
    pub cidr: Ipv4Block,
    pub internet_gateway: Handle,
    pub subnets: Vec<SubnetPair>,
    pub nat_gateways: Vec<Handle>,
    pub route_tables: Vec<RouteTableRef>,
}

impl NetworkTopology {
    pub fn availability_zone_count(&self) -> usize {
        self.subnets.len()
    }

    pub fn public_subnets(&self) -> Vec<Handle> {
        self.subnets.iter().map(|p| p.public.handle.clone()).collect()
    }

    pub fn private_subnets(&self) -> Vec<Handle> {
        self.subnets
            .iter()
            .map(|p| p.private.handle.clone())
            .collect()
    }

    /// Returns the default route of the table `subnet` is associated with.
    pub fn egress(&self, subnet: &Handle) -> Option<&RouteTarget> {
        self.route_tables
            .iter()
            .find(|table| table.subnets.contains(subnet))
            .map(|table| &table.default_route)
    }
}

/// Creates the network described by `plan`.
pub fn build<P: Provisioner>(
    engine: &mut P,
    environment: &str,
    plan: &NetworkPlan,
) -> Result<NetworkTopology, Error> {
    if plan.zones.is_empty() || plan.nat_gateways == 0 || plan.nat_gateways > plan.zones.len() {
        return Err(Error::InvalidNetwork(format!(
            "{} NAT gateways cannot serve {} availability zones",
            plan.nat_gateways,
            plan.zones.len()
        )));
    }

    // Create VPC and attach an internet gateway
    let vpc = engine.create(
        &name(ResourceKind::Network, environment),
        Resource::Vpc { cidr: plan.cidr },
    )?;
    info!(vpc = vpc.id(), cidr = %plan.cidr, "created VPC");
    let igw = engine.create(
        &name(ResourceKind::InternetGateway, environment),
        Resource::InternetGateway,
    )?;
    engine.create(
        &name(ResourceKind::GatewayAttachment, environment),
        Resource::GatewayAttachment {
            vpc: vpc.clone(),
            gateway: igw.clone(),
        },
    )?;
    info!(igw = igw.id(), vpc = vpc.id(), "created and attached IGW");

    // Create a subnet pair in each zone
    let mut subnets = Vec::with_capacity(plan.zones.len());
    for (idx, zone) in plan.zones.iter().enumerate() {
        let public = engine.create(
            &indexed(ResourceKind::PublicSubnet, environment, idx),
            Resource::Subnet {
                vpc: vpc.clone(),
                cidr: zone.public,
                zone: zone.zone.clone(),
                tier: Tier::Public,
            },
        )?;
        let private = engine.create(
            &indexed(ResourceKind::PrivateSubnet, environment, idx),
            Resource::Subnet {
                vpc: vpc.clone(),
                cidr: zone.private,
                zone: zone.zone.clone(),
                tier: Tier::Private,
            },
        )?;
        info!(
            public = public.id(),
            private = private.id(),
            az = zone.zone.as_str(),
            "created subnets"
        );
        subnets.push(SubnetPair {
            public: SubnetRef {
                handle: public,
                cidr: zone.public,
                zone: zone.zone.clone(),
            },
            private: SubnetRef {
                handle: private,
                cidr: zone.private,
                zone: zone.zone.clone(),
            },
        });
    }

    // Route public subnets to the internet gateway
    let public_table = engine.create(
        &name(ResourceKind::PublicRouteTable, environment),
        Resource::RouteTable { vpc: vpc.clone() },
    )?;
    let internet = RouteTarget::InternetGateway(igw.clone());
    engine.create(
        &name(ResourceKind::PublicRoute, environment),
        Resource::Route {
            table: public_table.clone(),
            destination: Ipv4Block::ANY,
            target: internet.clone(),
        },
    )?;
    for (idx, pair) in subnets.iter().enumerate() {
        engine.create(
            &indexed(ResourceKind::PublicRouteAssociation, environment, idx),
            Resource::RouteTableAssociation {
                table: public_table.clone(),
                subnet: pair.public.handle.clone(),
            },
        )?;
    }
    info!(route_table = public_table.id(), "created public route table");
    let mut route_tables = vec![RouteTableRef {
        handle: public_table,
        default_route: internet,
        subnets: subnets.iter().map(|p| p.public.handle.clone()).collect(),
    }];

    // Create NAT gateways in the public subnets of the first zones
    let mut nat_gateways = Vec::with_capacity(plan.nat_gateways);
    for (idx, pair) in subnets.iter().take(plan.nat_gateways).enumerate() {
        let address = engine.create(
            &indexed(ResourceKind::NatAddress, environment, idx),
            Resource::ElasticIp,
        )?;
        let nat = engine.create(
            &indexed(ResourceKind::NatGateway, environment, idx),
            Resource::NatGateway {
                subnet: pair.public.handle.clone(),
                address,
            },
        )?;
        info!(
            nat = nat.id(),
            subnet = pair.public.handle.id(),
            "created NAT gateway"
        );
        nat_gateways.push(nat);
    }

    // Route each private subnet through its NAT gateway
    for (idx, pair) in subnets.iter().enumerate() {
        let table = engine.create(
            &indexed(ResourceKind::PrivateRouteTable, environment, idx),
            Resource::RouteTable { vpc: vpc.clone() },
        )?;
        let egress = RouteTarget::NatGateway(nat_gateways[idx % nat_gateways.len()].clone());
        engine.create(
            &indexed(ResourceKind::PrivateRoute, environment, idx),
            Resource::Route {
                table: table.clone(),
                destination: Ipv4Block::ANY,
                target: egress.clone(),
            },
        )?;
        engine.create(
            &indexed(ResourceKind::PrivateRouteAssociation, environment, idx),
            Resource::RouteTableAssociation {
                table: table.clone(),
                subnet: pair.private.handle.clone(),
            },
        )?;
        info!(
            route_table = table.id(),
            nat = egress.gateway().id(),
            az = pair.private.zone.as_str(),
            "created private route table"
        );
        route_tables.push(RouteTableRef {
            handle: table,
            default_route: egress,
            subnets: vec![pair.private.handle.clone()],
        });
    }

    Ok(NetworkTopology {
        id: vpc,
        cidr: plan.cidr,
        internet_gateway: igw,
        subnets,
        nat_gateways,
        route_tables,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::memory::Memory;
    use proptest::prelude::*;

    fn zones(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("us-east-1{}", (b'a' + i as u8) as char)).collect()
    }

    #[test]
    fn test_parse_block() {
        let block: Ipv4Block = "10.0.0.0/16".parse().unwrap();
        assert_eq!(block.address(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(block.prefix(), 16);
        assert_eq!(block.to_string(), "10.0.0.0/16");
        assert!("10.0.0.1/16".parse::<Ipv4Block>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Block>().is_err());
        assert!("10.0.0.0".parse::<Ipv4Block>().is_err());
        assert!("10.0.0/16".parse::<Ipv4Block>().is_err());
    }

    #[test]
    fn test_subnet() {
        let block: Ipv4Block = "10.0.0.0/16".parse().unwrap();
        assert_eq!(block.capacity(24), 256);
        assert_eq!(block.capacity(8), 0);
        assert_eq!(block.subnet(24, 0).unwrap().to_string(), "10.0.0.0/24");
        assert_eq!(block.subnet(24, 3).unwrap().to_string(), "10.0.3.0/24");
        assert_eq!(block.subnet(24, 255).unwrap().to_string(), "10.0.255.0/24");
        assert!(block.subnet(24, 256).is_none());
        assert!(Ipv4Block::ANY.contains(&block));
        assert!(!block.contains(&Ipv4Block::ANY));
    }

    #[test]
    fn test_plan_alternates_tiers() {
        let plan = plan(&NetworkConfig::default(), &zones(3)).unwrap();
        assert_eq!(plan.zones.len(), 2);
        assert_eq!(plan.zones[0].zone, "us-east-1a");
        assert_eq!(plan.zones[0].public.to_string(), "10.0.0.0/24");
        assert_eq!(plan.zones[0].private.to_string(), "10.0.1.0/24");
        assert_eq!(plan.zones[1].zone, "us-east-1b");
        assert_eq!(plan.zones[1].public.to_string(), "10.0.2.0/24");
        assert_eq!(plan.zones[1].private.to_string(), "10.0.3.0/24");
    }

    #[test]
    fn test_plan_capacity_exceeded() {
        let config = NetworkConfig {
            cidr: "10.0.0.0/23".parse().unwrap(),
            availability_zones: 2,
            ..Default::default()
        };
        let err = plan(&config, &zones(2)).unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded {
                requested: 4,
                available: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_plan_rejects_invalid() {
        let config = NetworkConfig {
            availability_zones: 0,
            ..Default::default()
        };
        assert!(matches!(plan(&config, &zones(2)), Err(Error::InvalidNetwork(_))));

        let config = NetworkConfig {
            availability_zones: 3,
            ..Default::default()
        };
        assert!(matches!(plan(&config, &zones(2)), Err(Error::InvalidNetwork(_))));

        let config = NetworkConfig {
            nat_gateways: 3,
            ..Default::default()
        };
        assert!(matches!(plan(&config, &zones(2)), Err(Error::InvalidNetwork(_))));

        let config = NetworkConfig {
            subnet_prefix: 29,
            ..Default::default()
        };
        assert!(matches!(plan(&config, &zones(2)), Err(Error::InvalidNetwork(_))));

        let config = NetworkConfig {
            subnet_prefix: 12,
            ..Default::default()
        };
        assert!(matches!(plan(&config, &zones(2)), Err(Error::InvalidNetwork(_))));
    }

    #[test]
    fn test_plan_rejects_repeated_zones() {
        let repeated = vec!["us-east-1a".to_string(), "us-east-1a".to_string()];
        let err = plan(&NetworkConfig::default(), &repeated).unwrap_err();
        assert!(matches!(err, Error::InvalidNetwork(reason) if reason.contains("us-east-1a")));

        // Only the zones actually used must be distinct
        let zones = vec![
            "us-east-1a".to_string(),
            "us-east-1b".to_string(),
            "us-east-1a".to_string(),
        ];
        assert!(plan(&NetworkConfig::default(), &zones).is_ok());
    }

    #[test]
    fn test_plan_capacity_checked_before_zone_count() {
        let config = NetworkConfig {
            availability_zones: 200,
            ..Default::default()
        };
        let err = plan(&config, &zones(26)).unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded {
                requested: 400,
                available: 256,
                ..
            }
        ));
    }

    #[test]
    fn test_build_routes_private_subnets_through_nat() {
        let mut engine = Memory::new("us-east-1");
        let plan = plan(&NetworkConfig::default(), &zones(2)).unwrap();
        let network = build(&mut engine, "dev", &plan).unwrap();

        assert_eq!(network.availability_zone_count(), 2);
        assert_eq!(network.nat_gateways.len(), 1);
        for subnet in network.private_subnets() {
            match network.egress(&subnet) {
                Some(RouteTarget::NatGateway(nat)) => assert_eq!(nat, &network.nat_gateways[0]),
                other => panic!("private subnet egress: {other:?}"),
            }
        }
        for subnet in network.public_subnets() {
            assert_eq!(
                network.egress(&subnet),
                Some(&RouteTarget::InternetGateway(network.internet_gateway.clone()))
            );
        }
        assert_eq!(engine.count("subnet"), 4);
        assert_eq!(engine.count("nat-gateway"), 1);
    }

    #[test]
    fn test_build_spreads_nat_gateways() {
        let mut engine = Memory::new("us-east-1");
        let config = NetworkConfig {
            availability_zones: 3,
            nat_gateways: 2,
            ..Default::default()
        };
        let plan = plan(&config, &zones(3)).unwrap();
        let network = build(&mut engine, "dev", &plan).unwrap();
        let egress: Vec<_> = network
            .private_subnets()
            .iter()
            .map(|s| network.egress(s).unwrap().gateway().clone())
            .collect();
        assert_eq!(egress[0], network.nat_gateways[0]);
        assert_eq!(egress[1], network.nat_gateways[1]);
        assert_eq!(egress[2], network.nat_gateways[0]);
    }

    proptest! {
        #[test]
        fn planned_subnets_never_overlap(
            vpc_prefix in 8u8..=20,
            extra in 1u8..=8,
            availability_zones in 1usize..=6,
        ) {
            let config = NetworkConfig {
                cidr: Ipv4Block::new(Ipv4Addr::new(10, 0, 0, 0), vpc_prefix).unwrap(),
                availability_zones,
                subnet_prefix: (vpc_prefix + extra).min(MAX_SUBNET_PREFIX),
                nat_gateways: 1,
            };
            match plan(&config, &zones(6)) {
                Ok(plan) => {
                    let blocks: Vec<_> = plan
                        .zones
                        .iter()
                        .flat_map(|z| [z.public, z.private])
                        .collect();
                    prop_assert_eq!(blocks.len(), 2 * availability_zones);
                    for (i, a) in blocks.iter().enumerate() {
                        prop_assert!(config.cidr.contains(a));
                        for b in &blocks[i + 1..] {
                            prop_assert!(!a.overlaps(b));
                        }
                    }
                }
                Err(Error::CapacityExceeded { requested, available, .. }) => {
                    prop_assert!(requested > available);
                }
                Err(e) => prop_assert!(false, "unexpected error: {}", e),
            }
        }
    }
}
