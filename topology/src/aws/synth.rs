//! `synth` subcommand for `aws`

use crate::{
    aws::{load_config, Error},
    provision::template::Template,
};
use std::{fs, io::Write, path::Path};
use tracing::info;

/// Serialization of a synthesized template.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    pub const YAML: &'static str = "yaml";
    pub const JSON: &'static str = "json";

    /// Parses a format name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            Self::YAML => Some(Format::Yaml),
            Self::JSON => Some(Format::Json),
            _ => None,
        }
    }
}

/// Writes the CloudFormation template of the configuration to `output` (or stdout)
pub fn synth(config: &Path, output: Option<&Path>, format: Format) -> Result<(), Error> {
    let config = load_config(config)?;
    let (template, topology) = Template::synthesize(&config)?;
    let body = match format {
        Format::Yaml => template.to_yaml()?,
        Format::Json => template.to_json()?,
    };
    info!(
        environment = config.environment.as_str(),
        resources = template.len(),
        cluster = topology.outputs.cluster_name.as_str(),
        service = topology.outputs.service_name.as_str(),
        "synthesized template"
    );
    match output {
        Some(path) => {
            fs::write(path, body)?;
            info!(path = ?path, "wrote template");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(body.as_bytes())?;
            stdout.flush()?;
        }
    }
    Ok(())
}
