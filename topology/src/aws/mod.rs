//! Deploy a topology to AWS as a CloudFormation stack.
//!
//! # Subcommands
//!
//! * `synth`: write the CloudFormation template for a configuration
//! * `inspect`: assemble against the in-memory engine and log every resource (dry run)
//! * `deploy`: create the stack, wait for it to complete, and record its outputs
//! * `destroy`: delete the stack of a deployment
//! * `list`: list deployments that were created and not destroyed
//!
//! # Persistence
//!
//! Each environment's deployment state lives in `$HOME/.sidecar_topology/<environment>/`:
//!
//! * `metadata.yaml`: region, stack identifiers, creation time, and (once complete) outputs
//! * `created`: written once the stack reaches `CREATE_COMPLETE`
//! * `destroyed`: written once the stack is deleted
//!
//! # Example Configuration
//!
//! ```yaml
//! environment: dev
//! region: us-east-1
//! published_port: 80
//! scaling:
//!   min_instances: 1
//!   max_instances: 4
//!   requests_per_instance_target: 1000
//! workload:
//!   image: public.ecr.aws/nginx/nginx:latest
//!   port: 80
//!   health_check_command: ["CMD-SHELL", "curl -f http://localhost/ || exit 1"]
//! ```

use crate::{assembler::Outputs, config::Config, StageFailure};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub mod cloudformation;
mod deploy;
pub use deploy::deploy;
mod destroy;
pub use destroy::destroy;
pub mod ec2;
mod inspect;
pub use inspect::inspect;
mod list;
pub use list::list;
mod synth;
pub use synth::{synth, Format};

/// Directory (under `$HOME`) holding deployment state.
const DEPLOYER_DIRECTORY: &str = ".sidecar_topology";

/// File name of the marker written once a stack is created.
pub const CREATED_FILE_NAME: &str = "created";

/// File name of the marker written once a stack is deleted.
pub const DESTROYED_FILE_NAME: &str = "destroyed";

/// File name of the persisted deployment metadata.
pub const METADATA_FILE_NAME: &str = "metadata.yaml";

pub const CMD: &str = "aws";
pub const SYNTH_CMD: &str = "synth";
pub const INSPECT_CMD: &str = "inspect";
pub const DEPLOY_CMD: &str = "deploy";
pub const DESTROY_CMD: &str = "destroy";
pub const LIST_CMD: &str = "list";

/// Errors that can occur while deploying a topology.
#[derive(Error, Debug)]
pub enum Error {
    #[error("AWS EC2 error: {0}")]
    AwsEc2(#[from] Box<aws_sdk_ec2::Error>),
    #[error("AWS CloudFormation error: {0}")]
    AwsCloudFormation(#[from] Box<aws_sdk_cloudformation::Error>),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("topology error: {0}")]
    Topology(#[from] StageFailure),
    #[error("stack {stack} reached {status}: {reason}")]
    StackFailed {
        stack: String,
        status: String,
        reason: String,
    },
    #[error("timed out waiting for stack {0}")]
    StackTimeout(String),
    #[error("stack {stack} is missing output {output}")]
    MissingOutput { stack: String, output: String },
    #[error("deployment already exists: {0}")]
    DeploymentAlreadyExists(String),
    #[error("deployment does not exist: {0}")]
    DeploymentDoesNotExist(String),
    #[error("deployment never requested a stack: {0}")]
    DeploymentNotComplete(String),
    #[error("deployment already destroyed: {0}")]
    DeploymentAlreadyDestroyed(String),
}

/// State persisted for each deployment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub environment: String,
    pub region: String,
    pub stack_name: String,
    pub stack_id: String,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
}

/// Returns the deployment state directory, or the directory of `environment` within it.
pub fn deployer_directory(environment: Option<&str>) -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let path = home.join(DEPLOYER_DIRECTORY);
    match environment {
        Some(environment) => path.join(environment),
        None => path,
    }
}

/// Loads a [Config] from a YAML file.
pub fn load_config(path: &Path) -> Result<Config, Error> {
    let file = File::open(path)?;
    Ok(serde_yaml::from_reader(file)?)
}

/// Reads the metadata persisted in `directory`.
fn load_metadata(directory: &Path) -> Result<Metadata, Error> {
    let file = File::open(directory.join(METADATA_FILE_NAME))?;
    Ok(serde_yaml::from_reader(file)?)
}

/// Writes `metadata` to `directory`, replacing any earlier copy.
fn save_metadata(directory: &Path, metadata: &Metadata) -> Result<(), Error> {
    let file = File::create(directory.join(METADATA_FILE_NAME))?;
    serde_yaml::to_writer(file, metadata)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployer_directory() {
        let root = deployer_directory(None);
        assert!(root.ends_with(DEPLOYER_DIRECTORY));
        assert_eq!(deployer_directory(Some("dev")), root.join("dev"));
    }

    #[test]
    fn test_metadata_roundtrip_on_disk() {
        let directory = std::env::temp_dir().join(format!("sidecar_topology_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&directory).unwrap();
        let metadata = Metadata {
            environment: "dev".into(),
            region: "us-east-1".into(),
            stack_name: "sidecar-stack-dev".into(),
            stack_id: "arn:aws:cloudformation:us-east-1:000000000000:stack/sidecar-stack-dev/1".into(),
            created_at: 1,
            outputs: None,
        };
        save_metadata(&directory, &metadata).unwrap();
        assert_eq!(load_metadata(&directory).unwrap(), metadata);
        std::fs::remove_dir_all(&directory).unwrap();
    }
}
