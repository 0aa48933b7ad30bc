//! Derive deterministic, environment-scoped resource names.
//!
//! Every resource is named `<prefix>-<slug>-<environment>` (or `<prefix>-<slug>-<zone>-<environment>`
//! for resources repeated per availability zone or rule). Slugs never contain `-` and environment
//! names must start with a letter, so a name can be split back into exactly one
//! `(kind, zone, environment)` triple: names never collide across kinds, zones, or environments.

use crate::Error;

/// Prefix shared by every resource name.
pub const PREFIX: &str = "sidecar";

/// Maximum length of an environment name.
///
/// Load balancer and target group names are limited to 32 characters, so the longest
/// name built from those slugs must fit.
pub const MAX_ENVIRONMENT_LEN: usize = 20;

/// Maximum length AWS accepts for load balancer and target group names.
const MAX_BALANCER_NAME_LEN: usize = 32;

/// Kind of resource being named.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Stack,
    Network,
    InternetGateway,
    GatewayAttachment,
    PublicSubnet,
    PrivateSubnet,
    NatAddress,
    NatGateway,
    PublicRouteTable,
    PublicRoute,
    PublicRouteAssociation,
    PrivateRouteTable,
    PrivateRoute,
    PrivateRouteAssociation,
    EdgeSecurityGroup,
    EdgeIngress,
    ServiceSecurityGroup,
    ServiceIngress,
    Cluster,
    TaskDefinition,
    Service,
    TargetGroup,
    LoadBalancer,
    Listener,
    TargetRegistration,
    ScalableTarget,
    ScalingPolicy,
}

impl ResourceKind {
    /// Every kind used by one assembly.
    pub const ALL: [ResourceKind; 27] = [
        ResourceKind::Stack,
        ResourceKind::Network,
        ResourceKind::InternetGateway,
        ResourceKind::GatewayAttachment,
        ResourceKind::PublicSubnet,
        ResourceKind::PrivateSubnet,
        ResourceKind::NatAddress,
        ResourceKind::NatGateway,
        ResourceKind::PublicRouteTable,
        ResourceKind::PublicRoute,
        ResourceKind::PublicRouteAssociation,
        ResourceKind::PrivateRouteTable,
        ResourceKind::PrivateRoute,
        ResourceKind::PrivateRouteAssociation,
        ResourceKind::EdgeSecurityGroup,
        ResourceKind::EdgeIngress,
        ResourceKind::ServiceSecurityGroup,
        ResourceKind::ServiceIngress,
        ResourceKind::Cluster,
        ResourceKind::TaskDefinition,
        ResourceKind::Service,
        ResourceKind::TargetGroup,
        ResourceKind::LoadBalancer,
        ResourceKind::Listener,
        ResourceKind::TargetRegistration,
        ResourceKind::ScalableTarget,
        ResourceKind::ScalingPolicy,
    ];

    /// Returns the slug embedded in names of this kind (never contains `-`).
    pub fn slug(&self) -> &'static str {
        match self {
            ResourceKind::Stack => "stack",
            ResourceKind::Network => "vpc",
            ResourceKind::InternetGateway => "igw",
            ResourceKind::GatewayAttachment => "igwattachment",
            ResourceKind::PublicSubnet => "publicsubnet",
            ResourceKind::PrivateSubnet => "privatesubnet",
            ResourceKind::NatAddress => "nateip",
            ResourceKind::NatGateway => "nat",
            ResourceKind::PublicRouteTable => "publicrt",
            ResourceKind::PublicRoute => "publicroute",
            ResourceKind::PublicRouteAssociation => "publicrta",
            ResourceKind::PrivateRouteTable => "privatert",
            ResourceKind::PrivateRoute => "privateroute",
            ResourceKind::PrivateRouteAssociation => "privaterta",
            ResourceKind::EdgeSecurityGroup => "edgesg",
            ResourceKind::EdgeIngress => "edgeingress",
            ResourceKind::ServiceSecurityGroup => "servicesg",
            ResourceKind::ServiceIngress => "serviceingress",
            ResourceKind::Cluster => "cluster",
            ResourceKind::TaskDefinition => "task",
            ResourceKind::Service => "service",
            ResourceKind::TargetGroup => "tg",
            ResourceKind::LoadBalancer => "lb",
            ResourceKind::Listener => "listener",
            ResourceKind::TargetRegistration => "registration",
            ResourceKind::ScalableTarget => "scalabletarget",
            ResourceKind::ScalingPolicy => "scalingpolicy",
        }
    }
}

/// Returns the name of the single resource of `kind` in `environment`.
pub fn name(kind: ResourceKind, environment: &str) -> String {
    format!("{PREFIX}-{}-{environment}", kind.slug())
}

/// Returns the name of the `index`-th resource of `kind` in `environment`.
pub fn indexed(kind: ResourceKind, environment: &str, index: usize) -> String {
    format!("{PREFIX}-{}-{index}-{environment}", kind.slug())
}

/// Ensures `environment` can be embedded in every resource name.
pub fn validate_environment(environment: &str) -> Result<(), Error> {
    let Some(first) = environment.chars().next() else {
        return Err(Error::InvalidEnvironment("name is empty".into()));
    };
    if !first.is_ascii_lowercase() {
        return Err(Error::InvalidEnvironment(format!(
            "{environment} must start with a lowercase letter"
        )));
    }
    if let Some(c) = environment
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(Error::InvalidEnvironment(format!(
            "{environment} contains invalid character {c:?}"
        )));
    }
    if environment.ends_with('-') || environment.contains("--") {
        return Err(Error::InvalidEnvironment(format!(
            "{environment} has a dangling or repeated '-'"
        )));
    }
    if environment.len() > MAX_ENVIRONMENT_LEN {
        return Err(Error::InvalidEnvironment(format!(
            "{environment} is longer than {MAX_ENVIRONMENT_LEN} characters"
        )));
    }
    for kind in [ResourceKind::LoadBalancer, ResourceKind::TargetGroup] {
        let derived = name(kind, environment);
        if derived.len() > MAX_BALANCER_NAME_LEN {
            return Err(Error::InvalidEnvironment(format!(
                "{derived} exceeds {MAX_BALANCER_NAME_LEN} characters"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use test_case::test_case;

    #[test_case(ResourceKind::Cluster, "dev", "sidecar-cluster-dev"; "cluster")]
    #[test_case(ResourceKind::Service, "dev", "sidecar-service-dev"; "service")]
    #[test_case(ResourceKind::LoadBalancer, "staging", "sidecar-lb-staging"; "load balancer")]
    #[test_case(ResourceKind::Network, "prod-eu", "sidecar-vpc-prod-eu"; "hyphenated environment")]
    fn test_name(kind: ResourceKind, environment: &str, expected: &str) {
        assert_eq!(name(kind, environment), expected);
    }

    #[test]
    fn test_indexed() {
        assert_eq!(
            indexed(ResourceKind::PublicSubnet, "dev", 1),
            "sidecar-publicsubnet-1-dev"
        );
    }

    #[test]
    fn test_slugs_have_no_separator() {
        let mut seen = HashSet::new();
        for kind in ResourceKind::ALL {
            assert!(!kind.slug().contains('-'), "{kind:?}");
            assert!(seen.insert(kind.slug()), "duplicate slug for {kind:?}");
        }
    }

    #[test_case(""; "empty")]
    #[test_case("1dev"; "leading digit")]
    #[test_case("Dev"; "uppercase")]
    #[test_case("dev_1"; "underscore")]
    #[test_case("dev-"; "trailing separator")]
    #[test_case("dev--1"; "repeated separator")]
    #[test_case("abcdefghijklmnopqrstu"; "too long")]
    fn test_invalid_environment(environment: &str) {
        assert!(matches!(
            validate_environment(environment),
            Err(Error::InvalidEnvironment(_))
        ));
    }

    #[test]
    fn test_longest_environment_fits_balancer_names() {
        let environment = "a".repeat(MAX_ENVIRONMENT_LEN);
        validate_environment(&environment).unwrap();
        assert!(name(ResourceKind::LoadBalancer, &environment).len() <= MAX_BALANCER_NAME_LEN);
        assert!(name(ResourceKind::TargetGroup, &environment).len() <= MAX_BALANCER_NAME_LEN);
    }

    fn environment() -> impl Strategy<Value = String> {
        "[a-z]([a-z0-9]{0,3}(-[a-z0-9]{1,3}){0,2})?"
    }

    proptest! {
        #[test]
        fn names_are_injective_across_kinds(environment in environment()) {
            prop_assume!(validate_environment(&environment).is_ok());
            let mut names = HashSet::new();
            for kind in ResourceKind::ALL {
                prop_assert!(names.insert(name(kind, &environment)));
                for index in 0..4 {
                    prop_assert!(names.insert(indexed(kind, &environment, index)));
                }
            }
        }

        #[test]
        fn names_never_collide_across_environments(a in environment(), b in environment()) {
            prop_assume!(a != b);
            prop_assume!(validate_environment(&a).is_ok() && validate_environment(&b).is_ok());
            let mut names = HashSet::new();
            for environment in [&a, &b] {
                for kind in ResourceKind::ALL {
                    prop_assert!(names.insert(name(kind, environment)));
                    for index in 0..4 {
                        prop_assert!(names.insert(indexed(kind, environment, index)));
                    }
                }
            }
        }

        #[test]
        fn names_are_stable(environment in environment()) {
            for kind in ResourceKind::ALL {
                prop_assert_eq!(name(kind, &environment), name(kind, &environment));
            }
        }
    }
}
