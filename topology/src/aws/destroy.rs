//! `destroy` subcommand for `aws`

use crate::aws::{
    cloudformation::{self, Operation},
    deployer_directory, load_config, load_metadata, Error, DESTROYED_FILE_NAME,
    METADATA_FILE_NAME,
};
use aws_config::Region;
use std::{fs::File, path::Path};
use tracing::info;

/// Deletes the stack of a deployment, identified by its configuration or environment name
pub async fn destroy(config: Option<&Path>, environment: Option<&str>) -> Result<(), Error> {
    let environment = match (config, environment) {
        (Some(config), _) => load_config(config)?.environment,
        (None, Some(environment)) => environment.to_string(),
        (None, None) => return Err(Error::DeploymentDoesNotExist(String::new())),
    };

    // Check deployment state
    let directory = deployer_directory(Some(&environment));
    if !directory.exists() {
        return Err(Error::DeploymentDoesNotExist(environment));
    }
    if directory.join(DESTROYED_FILE_NAME).exists() {
        return Err(Error::DeploymentAlreadyDestroyed(environment));
    }
    if !directory.join(METADATA_FILE_NAME).exists() {
        return Err(Error::DeploymentNotComplete(environment));
    }
    let metadata = load_metadata(&directory)?;
    info!(
        environment = environment.as_str(),
        stack = metadata.stack_name.as_str(),
        region = metadata.region.as_str(),
        "loaded deployment metadata"
    );

    // Delete the stack and wait for it to disappear
    let client = cloudformation::create_client(Region::new(metadata.region.clone())).await;
    cloudformation::delete_stack(&client, &metadata.stack_id).await?;
    cloudformation::wait_for_stack(&client, &metadata.stack_id, Operation::Delete).await?;
    File::create(directory.join(DESTROYED_FILE_NAME))?;
    info!(
        environment = environment.as_str(),
        stack = metadata.stack_name.as_str(),
        "destroyed deployment"
    );
    Ok(())
}
