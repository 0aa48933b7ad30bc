//! `inspect` subcommand for `aws`

use crate::{
    assembler::assemble,
    aws::{load_config, Error},
    provision::memory::Memory,
};
use std::path::Path;
use tracing::info;

/// Assembles the configuration against the in-memory engine and logs every resource
pub fn inspect(config: &Path) -> Result<(), Error> {
    let config = load_config(config)?;
    let mut engine = Memory::new(config.region.as_str());
    let topology = assemble(&mut engine, &config)?;
    for (handle, resource) in engine.requests() {
        info!(
            kind = resource.kind(),
            name = handle.name(),
            id = handle.id(),
            "resource"
        );
    }
    info!(
        environment = config.environment.as_str(),
        resources = engine.requests().len(),
        address = topology.outputs.load_balancer_address.as_str(),
        cluster = topology.outputs.cluster_name.as_str(),
        service = topology.outputs.service_name.as_str(),
        network = topology.outputs.network_id.as_str(),
        "assembled topology (nothing created)"
    );
    Ok(())
}
