//! AWS CloudFormation SDK function wrappers

use super::Error;
use crate::assembler::Outputs;
use aws_config::{retry::RetryConfig, BehaviorVersion, Region};
use aws_sdk_cloudformation::Client as CloudFormationClient;
use std::{collections::HashMap, time::Duration};
use tracing::{debug, info};

/// Interval between stack status checks.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum time to wait for a stack to settle.
const STACK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Creates a CloudFormation client for the specified AWS region
pub async fn create_client(region: Region) -> CloudFormationClient {
    let retry = RetryConfig::adaptive()
        .with_max_attempts(10)
        .with_initial_backoff(Duration::from_millis(500))
        .with_max_backoff(Duration::from_secs(30));
    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(region)
        .retry_config(retry)
        .load()
        .await;
    CloudFormationClient::new(&config)
}

/// Operation a stack is settling from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    Delete,
}

/// Where a stack is relative to the end of an [Operation].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Complete,
    Failed,
}

/// Classifies a stack status reported during `operation`.
pub fn progress(operation: Operation, status: &str) -> Progress {
    match (operation, status) {
        (Operation::Create, "CREATE_COMPLETE") | (Operation::Delete, "DELETE_COMPLETE") => {
            Progress::Complete
        }
        (Operation::Create, "CREATE_IN_PROGRESS") | (Operation::Delete, "DELETE_IN_PROGRESS") => {
            Progress::Pending
        }
        // Rolling back after a failed create is not done yet but can no longer succeed
        _ => Progress::Failed,
    }
}

/// Requests creation of `stack_name` from `template` and returns the stack ID
pub async fn create_stack(
    client: &CloudFormationClient,
    stack_name: &str,
    template: &str,
    environment: &str,
) -> Result<String, Error> {
    let token = uuid::Uuid::new_v4().to_string();
    let resp = client
        .create_stack()
        .stack_name(stack_name)
        .template_body(template)
        .client_request_token(&token)
        .send()
        .await
        .map_err(|e| Box::new(aws_sdk_cloudformation::Error::from(e)))?;
    let stack_id = resp.stack_id().unwrap_or(stack_name).to_string();
    info!(
        stack = stack_name,
        stack_id = stack_id.as_str(),
        environment,
        token = token.as_str(),
        "requested stack creation"
    );
    Ok(stack_id)
}

/// Requests deletion of the stack
pub async fn delete_stack(client: &CloudFormationClient, stack_id: &str) -> Result<(), Error> {
    let token = uuid::Uuid::new_v4().to_string();
    client
        .delete_stack()
        .stack_name(stack_id)
        .client_request_token(&token)
        .send()
        .await
        .map_err(|e| Box::new(aws_sdk_cloudformation::Error::from(e)))?;
    info!(stack_id, token = token.as_str(), "requested stack deletion");
    Ok(())
}

/// Polls the stack until `operation` completes, returning its outputs
pub async fn wait_for_stack(
    client: &CloudFormationClient,
    stack_id: &str,
    operation: Operation,
) -> Result<HashMap<String, String>, Error> {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let start = std::time::Instant::now();
    loop {
        interval.tick().await;
        if start.elapsed() > STACK_TIMEOUT {
            return Err(Error::StackTimeout(stack_id.to_string()));
        }

        let resp = client
            .describe_stacks()
            .stack_name(stack_id)
            .send()
            .await
            .map_err(|e| Box::new(aws_sdk_cloudformation::Error::from(e)))?;
        let Some(stack) = resp.stacks().first() else {
            // A deleted stack described by name is no longer listed
            if operation == Operation::Delete {
                return Ok(HashMap::new());
            }
            continue;
        };
        let status = stack
            .stack_status()
            .map(|status| status.as_str())
            .unwrap_or_default();
        debug!(
            stack_id,
            status,
            elapsed_secs = start.elapsed().as_secs(),
            "stack status"
        );
        match progress(operation, status) {
            Progress::Pending => continue,
            Progress::Failed => {
                return Err(Error::StackFailed {
                    stack: stack_id.to_string(),
                    status: status.to_string(),
                    reason: stack.stack_status_reason().unwrap_or_default().to_string(),
                });
            }
            Progress::Complete => {
                info!(
                    stack_id,
                    status,
                    elapsed_secs = start.elapsed().as_secs(),
                    "stack settled"
                );
                return Ok(stack
                    .outputs()
                    .iter()
                    .filter_map(|output| {
                        Some((
                            output.output_key()?.to_string(),
                            output.output_value()?.to_string(),
                        ))
                    })
                    .collect());
            }
        }
    }
}

/// Extracts the topology's public identifiers from stack outputs
pub fn outputs(stack: &str, values: &HashMap<String, String>) -> Result<Outputs, Error> {
    let get = |key: &str| {
        values.get(key).cloned().ok_or_else(|| Error::MissingOutput {
            stack: stack.to_string(),
            output: key.to_string(),
        })
    };
    Ok(Outputs {
        load_balancer_address: get("LoadBalancerAddress")?,
        cluster_name: get("ClusterName")?,
        service_name: get("ServiceName")?,
        network_id: get("NetworkId")?,
    })
}
