//! Sidecar Topology CLI

use clap::{Arg, ArgAction, Command};
use sidecar_topology::aws::{self, Format};
use std::path::PathBuf;
use tracing::error;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

fn config_arg(required: bool) -> Arg {
    Arg::new("config")
        .long("config")
        .required(required)
        .help("Path to YAML config file")
        .value_parser(clap::value_parser!(PathBuf))
}

/// Entrypoint for the Sidecar Topology CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let matches = Command::new("topology")
        .version(crate_version())
        .about("Assemble a load-balanced, autoscaled Fargate service topology.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(aws::CMD)
                .about("Deploy the topology to AWS as a CloudFormation stack.")
                .subcommand(
                    Command::new(aws::SYNTH_CMD)
                        .about("Write the CloudFormation template for a YAML configuration file.")
                        .arg(config_arg(true))
                        .arg(
                            Arg::new("output")
                                .long("output")
                                .help("Path to write the template to (stdout if omitted)")
                                .value_parser(clap::value_parser!(PathBuf)),
                        )
                        .arg(
                            Arg::new("format")
                                .long("format")
                                .default_value(Format::YAML)
                                .help("Template serialization")
                                .value_parser([Format::YAML, Format::JSON]),
                        ),
                )
                .subcommand(
                    Command::new(aws::INSPECT_CMD)
                        .about("Assemble the topology without creating anything and log every resource.")
                        .arg(config_arg(true)),
                )
                .subcommand(
                    Command::new(aws::DEPLOY_CMD)
                        .about("Create the topology's stack and wait for it to complete.")
                        .arg(config_arg(true)),
                )
                .subcommand(
                    Command::new(aws::DESTROY_CMD)
                        .about("Delete the stack of a given deployment.")
                        .arg(config_arg(false))
                        .arg(
                            Arg::new("environment")
                                .long("environment")
                                .help("Environment name (uses persisted metadata)")
                                .value_parser(clap::value_parser!(String)),
                        )
                        .group(
                            clap::ArgGroup::new("target")
                                .args(["config", "environment"])
                                .required(true),
                        ),
                )
                .subcommand(
                    Command::new(aws::LIST_CMD)
                        .about("List all active deployments (created but not destroyed)."),
                ),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Parse subcommands
    if let Some(aws_matches) = matches.subcommand_matches(aws::CMD) {
        let result = match aws_matches.subcommand() {
            Some((aws::SYNTH_CMD, matches)) => {
                let Some(config_path) = matches.get_one::<PathBuf>("config") else {
                    error!("missing config");
                    return std::process::ExitCode::FAILURE;
                };
                let output = matches.get_one::<PathBuf>("output");
                let format = matches
                    .get_one::<String>("format")
                    .and_then(|name| Format::parse(name))
                    .unwrap_or(Format::Yaml);
                aws::synth(config_path, output.map(PathBuf::as_path), format)
                    .inspect_err(|e| error!(error=?e, "failed to synthesize template"))
            }
            Some((aws::INSPECT_CMD, matches)) => {
                let Some(config_path) = matches.get_one::<PathBuf>("config") else {
                    error!("missing config");
                    return std::process::ExitCode::FAILURE;
                };
                aws::inspect(config_path)
                    .inspect_err(|e| error!(error=?e, "failed to inspect topology"))
            }
            Some((aws::DEPLOY_CMD, matches)) => {
                let Some(config_path) = matches.get_one::<PathBuf>("config") else {
                    error!("missing config");
                    return std::process::ExitCode::FAILURE;
                };
                aws::deploy(config_path)
                    .await
                    .inspect_err(|e| error!(error=?e, "failed to deploy topology"))
            }
            Some((aws::DESTROY_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config");
                let environment = matches.get_one::<String>("environment");
                aws::destroy(
                    config_path.map(PathBuf::as_path),
                    environment.map(String::as_str),
                )
                .await
                .inspect_err(|e| error!(error=?e, "failed to destroy deployment"))
            }
            Some((aws::LIST_CMD, _)) => {
                aws::list().inspect_err(|e| error!(error=?e, "failed to list deployments"))
            }
            Some((cmd, _)) => {
                error!(cmd, "invalid subcommand");
                return std::process::ExitCode::FAILURE;
            }
            None => {
                error!("no subcommand provided");
                return std::process::ExitCode::FAILURE;
            }
        };
        if result.is_ok() {
            return std::process::ExitCode::SUCCESS;
        }
    } else if let Some(cmd) = matches.subcommand_name() {
        error!(cmd, "invalid subcommand");
    } else {
        error!("no subcommand provided");
    }
    std::process::ExitCode::FAILURE
}
