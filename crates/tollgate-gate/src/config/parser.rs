use crate::config::schema::{GateConfig, TaskKind};
use crate::error::GateError;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Config file names, in lookup order.
pub const CONFIG_FILES: [&str; 2] = [".tollgate.yml", ".tollgate.yaml"];

/// First config file found in `root`, if any.
pub fn find_config(root: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| root.join(name))
        .find(|p| p.is_file())
}

/// Load the project's config. `Ok(None)` when the project has none.
pub fn load_config(root: &Path) -> Result<Option<GateConfig>> {
    let Some(path) = find_config(root) else {
        return Ok(None);
    };
    let content =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let config = parse_config(&content).with_context(|| format!("in {}", path.display()))?;
    Ok(Some(config))
}

/// Parse and validate a config from a YAML string.
pub fn parse_config(yaml: &str) -> Result<GateConfig> {
    if yaml.trim().is_empty() {
        return Ok(GateConfig::default());
    }
    let config: GateConfig = serde_yaml::from_str(yaml).context("config schema validation failed")?;
    validate_config(&config)?;
    tollgate_churn::SourceFilter::new(&config.sources)?;
    Ok(config)
}

fn validate_config(config: &GateConfig) -> Result<(), GateError> {
    for entries in config.hooks.values() {
        for entry in entries {
            if let Some(pattern) = &entry.matcher {
                regex::Regex::new(pattern).map_err(|e| GateError::BadMatcher {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
            }

            let mut seen = HashSet::new();
            for task in &entry.tasks {
                if !seen.insert(task.name.as_str()) {
                    return Err(GateError::DuplicateTask(task.name.clone()));
                }
                let (field, present) = match task.kind {
                    TaskKind::Script => ("command", task.command.as_deref()),
                    TaskKind::Agent => ("prompt", task.prompt.as_deref()),
                };
                if present.map_or(true, |s| s.trim().is_empty()) {
                    return Err(GateError::MissingField {
                        task: task.name.clone(),
                        field,
                    });
                }
            }
        }
    }
    Ok(())
}
