//! `list` subcommand for `aws`

use crate::aws::{
    deployer_directory, load_metadata, Error, Metadata, CREATED_FILE_NAME, DESTROYED_FILE_NAME,
};
use std::{fs, path::Path};
use tracing::info;

/// Returns the deployments under `root` whose stack completed and was never deleted,
/// newest first.
fn active_in(root: &Path) -> Result<Vec<Metadata>, Error> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut deployments = Vec::new();
    for entry in fs::read_dir(root)? {
        let directory = entry?.path();
        let live = directory.join(CREATED_FILE_NAME).exists()
            && !directory.join(DESTROYED_FILE_NAME).exists();
        if !directory.is_dir() || !live {
            continue;
        }
        deployments.push(load_metadata(&directory)?);
    }
    deployments.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.environment.cmp(&b.environment))
    });
    Ok(deployments)
}

/// Lists all active deployments (created but not destroyed)
pub fn list() -> Result<(), Error> {
    let deployments = active_in(&deployer_directory(None))?;
    if deployments.is_empty() {
        info!("no active deployments");
        return Ok(());
    }
    for deployment in &deployments {
        let address = deployment
            .outputs
            .as_ref()
            .map(|outputs| outputs.load_balancer_address.as_str())
            .unwrap_or_default();
        info!(
            environment = deployment.environment.as_str(),
            region = deployment.region.as_str(),
            stack = deployment.stack_name.as_str(),
            created_at = deployment.created_at,
            address,
            "active deployment"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::save_metadata;
    use std::path::PathBuf;

    fn deployment(root: &Path, environment: &str, created_at: u64, markers: &[&str]) -> PathBuf {
        let directory = root.join(environment);
        fs::create_dir_all(&directory).unwrap();
        let metadata = Metadata {
            environment: environment.into(),
            region: "us-east-1".into(),
            stack_name: format!("sidecar-stack-{environment}"),
            stack_id: format!("stack/{environment}"),
            created_at,
            outputs: None,
        };
        save_metadata(&directory, &metadata).unwrap();
        for marker in markers {
            fs::write(directory.join(marker), b"").unwrap();
        }
        directory
    }

    #[test]
    fn test_active_in() {
        let root = std::env::temp_dir().join(format!("sidecar_topology_{}", uuid::Uuid::new_v4()));
        assert!(active_in(&root).unwrap().is_empty());

        deployment(&root, "dev", 10, &[CREATED_FILE_NAME]);
        deployment(&root, "prod", 30, &[CREATED_FILE_NAME]);
        deployment(&root, "staging", 20, &[CREATED_FILE_NAME, DESTROYED_FILE_NAME]);
        deployment(&root, "qa", 40, &[]);

        let environments: Vec<_> = active_in(&root)
            .unwrap()
            .into_iter()
            .map(|metadata| metadata.environment)
            .collect();
        assert_eq!(environments, vec!["prod", "dev"]);
        fs::remove_dir_all(&root).unwrap();
    }
}
