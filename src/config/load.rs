//! Loading run specifications from YAML

use super::schema::PgadSpec;
use super::validate::validate_config;
use crate::error::{Error, Result};
use std::fs;
use std::path::Path;
use tracing::info;

/// Parse and validate a run specification from YAML text
pub fn parse_config(yaml: &str) -> Result<PgadSpec> {
    let spec: PgadSpec = serde_yaml::from_str(yaml)
        .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {}", e)))?;

    validate_config(&spec).map_err(|e| Error::ConfigError(format!("Invalid config: {}", e)))?;

    Ok(spec)
}

/// Load a run specification from a YAML file
///
/// # Example
///
/// ```no_run
/// use destilar::config::load_config;
///
/// let spec = load_config("pgad.yaml")?;
/// println!("distillation: {}", spec.distill.mode);
/// # Ok::<(), destilar::Error>(())
/// ```
pub fn load_config<P: AsRef<Path>>(config_path: P) -> Result<PgadSpec> {
    let yaml_content = fs::read_to_string(config_path.as_ref()).map_err(|e| {
        Error::ConfigError(format!(
            "Failed to read config file {}: {}",
            config_path.as_ref().display(),
            e
        ))
    })?;

    let spec = parse_config(&yaml_content)?;
    info!(
        path = %config_path.as_ref().display(),
        distill = %spec.distill.mode,
        prune = %spec.prune.mode,
        epochs = spec.training.epochs,
        "loaded run config"
    );
    Ok(spec)
}

/// Write a run specification as YAML
pub fn save_config<P: AsRef<Path>>(spec: &PgadSpec, path: P) -> Result<()> {
    let yaml = serde_yaml::to_string(spec).map_err(|e| Error::Serialization(e.to_string()))?;
    fs::write(path, yaml)?;
    Ok(())
}
