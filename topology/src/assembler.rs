//! Compose every builder in dependency order.
//!
//! Assembly has two phases. First, every stage's inputs are validated without touching the
//! engine, so a bad configuration never leaves partially created resources behind. Then the
//! stages run in a fixed order (network, security, compute, load balancing, scaling), each
//! consuming the outputs of the ones before it. The first failure stops assembly and is returned
//! as a [StageFailure] naming the stage.
//!
//! The order is fixed because the shape is fixed (one network, one service, one load balancer).
//! Supporting several services or load balancers would call for an explicit dependency graph.

use crate::{
    balancer::{self, LoadBalancing},
    compute::{self, ComputeService},
    config::Config,
    naming,
    network::{self, NetworkTopology},
    provision::Provisioner,
    scaling::{self, ScalingPolicy},
    security::{self, SecurityBoundary},
    Error, Stage, StageFailure,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Public identifiers of an assembled topology.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outputs {
    pub load_balancer_address: String,
    pub cluster_name: String,
    pub service_name: String,
    pub network_id: String,
}

/// Everything created by [assemble].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub network: NetworkTopology,
    pub security: SecurityBoundary,
    pub compute: ComputeService,
    pub balancing: LoadBalancing,
    pub scaling: ScalingPolicy,
    pub outputs: Outputs,
}

/// Attributes an error to `stage`.
fn at(stage: Stage) -> impl FnOnce(Error) -> StageFailure {
    move |error| StageFailure::new(stage, error)
}

/// Validates `config` and creates its topology through `engine`.
pub fn assemble<P: Provisioner>(engine: &mut P, config: &Config) -> Result<Topology, StageFailure> {
    let parameters = config.environment_config();
    let environment = parameters.environment.as_str();

    // Validate every stage before creating anything
    naming::validate_environment(environment).map_err(at(Stage::Network))?;
    let zones = config.zones();
    let plan = network::plan(&config.network, &zones).map_err(at(Stage::Network))?;
    let workload = compute::validate(config.workload.as_ref()).map_err(at(Stage::Compute))?;
    security::validate(config.published_port, workload.port).map_err(at(Stage::Security))?;
    config
        .health_check
        .validate()
        .map_err(at(Stage::LoadBalancing))?;
    parameters.validate().map_err(at(Stage::Scaling))?;
    info!(environment, region = config.region.as_str(), "validated configuration");

    // Create resources in dependency order
    let network = network::build(engine, environment, &plan).map_err(at(Stage::Network))?;
    let security = security::build(
        engine,
        environment,
        &network,
        config.published_port,
        workload.port,
    )
    .map_err(at(Stage::Security))?;
    let mut compute = compute::build(
        engine,
        environment,
        &network,
        &security,
        Some(workload),
        parameters.desired_count,
    )
    .map_err(at(Stage::Compute))?;
    let balancing = balancer::build(
        engine,
        environment,
        &network,
        &security,
        &compute,
        config.published_port,
        &config.health_check,
    )
    .map_err(at(Stage::LoadBalancing))?;
    let scaling = scaling::build(engine, &parameters, &mut compute, &balancing)
        .map_err(at(Stage::Scaling))?;

    let outputs = Outputs {
        load_balancer_address: balancing.load_balancer.address.clone(),
        cluster_name: compute.cluster_name.clone(),
        service_name: compute.service_name.clone(),
        network_id: network.id.id().to_string(),
    };
    info!(
        environment,
        address = outputs.load_balancer_address.as_str(),
        cluster = outputs.cluster_name.as_str(),
        service = outputs.service_name.as_str(),
        network = outputs.network_id.as_str(),
        "assembled topology"
    );
    Ok(Topology {
        network,
        security,
        compute,
        balancing,
        scaling,
        outputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compute::WorkloadSpec, provision::memory::Memory};

    fn config() -> Config {
        Config::new(
            "dev",
            WorkloadSpec::new(
                "example/app:1.0",
                80,
                vec!["CMD-SHELL".into(), "true".into()],
            ),
        )
    }

    #[test]
    fn test_assemble_defaults() {
        let mut engine = Memory::new("us-east-1");
        let topology = assemble(&mut engine, &config()).unwrap();
        assert_eq!(topology.outputs.cluster_name, "sidecar-cluster-dev");
        assert_eq!(topology.outputs.service_name, "sidecar-service-dev");
        assert_eq!(topology.outputs.network_id, topology.network.id.id());
        assert_eq!(topology.compute.bounds, Some((1, 10)));
    }

    #[test]
    fn test_validation_failures_create_nothing() {
        let cases: Vec<(Box<dyn Fn(&mut Config)>, Stage)> = vec![
            (Box::new(|c: &mut Config| c.environment = "Dev".into()), Stage::Network),
            (Box::new(|c: &mut Config| c.network.availability_zones = 30), Stage::Network),
            (Box::new(|c: &mut Config| c.workload = None), Stage::Compute),
            (Box::new(|c: &mut Config| c.published_port = 0), Stage::Security),
            (Box::new(|c: &mut Config| c.health_check.path = "health".into()), Stage::LoadBalancing),
            (Box::new(|c: &mut Config| c.scaling.max_instances = 0), Stage::Scaling),
            (Box::new(|c: &mut Config| c.scaling.scale_in_cooldown = u64::MAX), Stage::Scaling),
            (Box::new(|c: &mut Config| c.desired_count = 11), Stage::Scaling),
        ];
        for (mutate, stage) in cases {
            let mut config = config();
            mutate(&mut config);
            let mut engine = Memory::new("us-east-1");
            let failure = assemble(&mut engine, &config).unwrap_err();
            assert_eq!(failure.stage, stage, "{failure}");
            assert!(engine.requests().is_empty());
        }
    }

    #[test]
    fn test_scaling_follows_environment_parameters() {
        let mut config = config();
        config.desired_count = 2;
        config.scaling.min_instances = 2;
        config.scaling.max_instances = 4;
        config.scaling.scale_in_cooldown = 300;
        let parameters = config.environment_config();
        let mut engine = Memory::new("us-east-1");
        let topology = assemble(&mut engine, &config).unwrap();
        assert_eq!(topology.scaling.min_instances, parameters.min_instances);
        assert_eq!(topology.scaling.max_instances, parameters.max_instances);
        assert_eq!(topology.scaling.scale_in_cooldown, parameters.scale_in_cooldown);
        assert_eq!(topology.compute.desired_count, parameters.desired_count);
    }

    #[test]
    fn test_engine_failure_stops_later_stages() {
        let mut engine = Memory::new("us-east-1");
        engine.fail_on("load-balancer");
        let failure = assemble(&mut engine, &config()).unwrap_err();
        assert_eq!(failure.stage, Stage::LoadBalancing);
        assert!(matches!(failure.error, Error::Provision(_)));
        assert_eq!(engine.count("scalable-target"), 0);
        assert_eq!(engine.count("scaling-policy"), 0);
    }
}
