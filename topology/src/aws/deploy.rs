//! `deploy` subcommand for `aws`

use crate::{
    aws::{
        cloudformation::{self, Operation},
        deployer_directory, ec2, load_config, save_metadata, Error, Metadata, CREATED_FILE_NAME,
        DESTROYED_FILE_NAME, METADATA_FILE_NAME,
    },
    naming::{name, ResourceKind},
    provision::template::Template,
};
use aws_config::Region;
use std::{
    fs::{self, File},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::info;

/// Clears the state left in `directory` by a deployment that was destroyed or never requested a
/// stack, and fails if it still holds a live deployment.
fn reclaim(directory: &Path, environment: &str) -> Result<(), Error> {
    if !directory.exists() {
        return Ok(());
    }
    let destroyed = directory.join(DESTROYED_FILE_NAME).exists();
    let requested = directory.join(METADATA_FILE_NAME).exists();
    if requested && !destroyed {
        return Err(Error::DeploymentAlreadyExists(environment.to_string()));
    }
    fs::remove_dir_all(directory)?;
    info!(path = ?directory, destroyed, "removed stale deployment state");
    Ok(())
}

/// Creates the topology's CloudFormation stack and waits for it to complete
pub async fn deploy(config: &Path) -> Result<(), Error> {
    // Load configuration from YAML file
    let mut config = load_config(config)?;
    let environment = config.environment.clone();
    info!(environment = environment.as_str(), "loaded configuration");

    // Refuse to deploy over a live deployment
    let directory = deployer_directory(Some(&environment));
    reclaim(&directory, &environment)?;

    // Resolve the region's zones unless pinned
    let region = Region::new(config.region.clone());
    if config.zones.is_none() {
        let client = ec2::create_client(region.clone()).await;
        let zones = ec2::available_zones(&client).await?;
        info!(region = config.region.as_str(), ?zones, "using available zones");
        config.zones = Some(zones);
    }

    // Synthesize before touching the account
    let (template, topology) = Template::synthesize(&config)?;
    let body = template.to_json()?;
    info!(
        resources = template.len(),
        cluster = topology.outputs.cluster_name.as_str(),
        service = topology.outputs.service_name.as_str(),
        "synthesized template"
    );

    // Request the stack (state is only written once a stack exists)
    let client = cloudformation::create_client(region).await;
    let stack_name = name(ResourceKind::Stack, &environment);
    let stack_id = cloudformation::create_stack(&client, &stack_name, &body, &environment).await?;
    fs::create_dir_all(&directory)?;

    // Persist deployment metadata early to enable `destroy` on failure
    let mut metadata = Metadata {
        environment: environment.clone(),
        region: config.region.clone(),
        stack_name: stack_name.clone(),
        stack_id: stack_id.clone(),
        created_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default(),
        outputs: None,
    };
    save_metadata(&directory, &metadata)?;
    info!(path = ?directory, "persisted deployment metadata");

    // Wait for the stack and record its outputs
    let values = cloudformation::wait_for_stack(&client, &stack_id, Operation::Create).await?;
    let outputs = cloudformation::outputs(&stack_name, &values)?;
    metadata.outputs = Some(outputs.clone());
    save_metadata(&directory, &metadata)?;
    File::create(directory.join(CREATED_FILE_NAME))?;
    info!(
        environment = environment.as_str(),
        stack = stack_name.as_str(),
        address = outputs.load_balancer_address.as_str(),
        cluster = outputs.cluster_name.as_str(),
        service = outputs.service_name.as_str(),
        network = outputs.network_id.as_str(),
        "deployment complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!("sidecar_topology_{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_reclaim_missing_directory() {
        reclaim(&scratch(), "dev").unwrap();
    }

    #[test]
    fn test_reclaim_removes_state_without_stack() {
        let directory = scratch();
        fs::create_dir_all(&directory).unwrap();
        reclaim(&directory, "dev").unwrap();
        assert!(!directory.exists());
    }

    #[test]
    fn test_reclaim_removes_destroyed_deployment() {
        let directory = scratch();
        fs::create_dir_all(&directory).unwrap();
        File::create(directory.join(METADATA_FILE_NAME)).unwrap();
        File::create(directory.join(DESTROYED_FILE_NAME)).unwrap();
        reclaim(&directory, "dev").unwrap();
        assert!(!directory.exists());
    }

    #[test]
    fn test_reclaim_refuses_live_deployment() {
        let directory = scratch();
        fs::create_dir_all(&directory).unwrap();
        File::create(directory.join(METADATA_FILE_NAME)).unwrap();
        assert!(matches!(
            reclaim(&directory, "dev"),
            Err(Error::DeploymentAlreadyExists(environment)) if environment == "dev"
        ));
        assert!(directory.exists());
        fs::remove_dir_all(&directory).unwrap();
    }
}
