//! AWS EC2 SDK function wrappers

use super::Error;
use aws_config::{retry::RetryConfig, BehaviorVersion, Region};
use aws_sdk_ec2::{types::Filter, Client as Ec2Client};
use std::time::Duration;
use tracing::debug;

/// Creates an EC2 client for the specified AWS region
pub async fn create_client(region: Region) -> Ec2Client {
    let retry = RetryConfig::adaptive()
        .with_max_attempts(10)
        .with_initial_backoff(Duration::from_millis(500))
        .with_max_backoff(Duration::from_secs(30));
    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(region)
        .retry_config(retry)
        .load()
        .await;
    Ec2Client::new(&config)
}

/// Returns the names of the region's available zones (local and wavelength zones excluded),
/// sorted
pub async fn available_zones(client: &Ec2Client) -> Result<Vec<String>, Error> {
    let resp = client
        .describe_availability_zones()
        .filters(Filter::builder().name("state").values("available").build())
        .filters(
            Filter::builder()
                .name("zone-type")
                .values("availability-zone")
                .build(),
        )
        .send()
        .await
        .map_err(|e| Box::new(aws_sdk_ec2::Error::from(e)))?;
    let mut zones: Vec<String> = resp
        .availability_zones()
        .iter()
        .filter_map(|zone| zone.zone_name().map(String::from))
        .collect();
    zones.sort();
    debug!(?zones, "resolved availability zones");
    Ok(zones)
}
