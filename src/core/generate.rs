//! Generated chart artifacts.
//!
//! Per group, `<out>/<group>/` holds an umbrella `Chart.yaml` with one
//! dependency per unit, a `values.yaml` for the umbrella chart, and one
//! `<unit>.yaml` values file per unit used by per-unit releases. The group
//! directory is replaced wholesale on every run.

use super::error::GenerateError;
use super::types::{Config, Dependency};
use super::value::{Map, Value};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CHART_API_VERSION: &str = "v2";
const CHART_TYPE: &str = "application";
const DEFAULT_CHART_VERSION: &str = "0.1.0";

/// Umbrella `Chart.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UmbrellaChart {
    pub api_version: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub chart_type: String,
    pub version: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
}

/// Paths written for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedGroup {
    pub group: String,
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Values file of one unit under `output_root`.
pub fn unit_values_path(output_root: &Path, group: &str, unit: &str) -> PathBuf {
    output_root.join(group).join(format!("{unit}.yaml"))
}

/// Check that a group or unit name is a single plain path component.
pub fn check_name(kind: &'static str, name: &str) -> Result<(), GenerateError> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !Path::new(name).is_absolute();
    if plain {
        Ok(())
    } else {
        Err(GenerateError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

/// Write the artifacts of every group in `config`.
///
/// Every group and unit name is checked before anything on disk changes.
/// Local chart repositories are rewritten to absolute `file://` paths,
/// resolved against `project_root`, so the umbrella chart works from its
/// own directory.
pub fn generate(config: &Config, project_root: &Path, output_root: &Path) -> Result<Vec<GeneratedGroup>, GenerateError> {
    for (group, units) in &config.groups {
        check_name("group", group)?;
        for unit in units.keys() {
            check_name("unit", unit)?;
        }
    }

    let mut generated = Vec::new();
    for (group, units) in &config.groups {
        let dir = output_root.join(group);
        if dir.parent() != Some(output_root) {
            return Err(GenerateError::InvalidName {
                kind: "group",
                name: group.clone(),
            });
        }
        reset_dir(&dir)?;

        let mut chart = UmbrellaChart {
            api_version: CHART_API_VERSION.into(),
            name: group.clone(),
            description: format!("Umbrella chart for group {group}"),
            chart_type: CHART_TYPE.into(),
            version: if config.version.is_empty() {
                DEFAULT_CHART_VERSION.into()
            } else {
                config.version.clone()
            },
            dependencies: Vec::new(),
        };
        let mut umbrella_values = Map::new();
        if !config.global.is_empty() {
            umbrella_values.insert("global".into(), Value::Map(config.global.clone()));
        }

        let mut unit_files = Vec::new();
        for (name, unit) in units {
            let mut dep = unit.chart.clone();
            dep.alias = name.clone();
            dep.schema.clear();
            if let Some(local) = unit.chart.local_path() {
                let abs = std::path::absolute(project_root.join(local)).map_err(|source| GenerateError::Io {
                    path: project_root.join(local),
                    source,
                })?;
                dep.repository = format!("file://{}", abs.display());
            }
            chart.dependencies.push(dep);
            umbrella_values.insert(name.clone(), Value::Map(unit.values.clone()));

            let path = unit_values_path(output_root, group, name);
            write_yaml(&path, &unit.values_with(&config.global, &config.vars), name)?;
            unit_files.push(path);
        }

        let chart_path = dir.join("Chart.yaml");
        write_yaml(&chart_path, &chart, "Chart.yaml")?;
        let values_path = dir.join("values.yaml");
        write_yaml(&values_path, &umbrella_values, "values.yaml")?;
        let files: Vec<PathBuf> = [chart_path, values_path].into_iter().chain(unit_files).collect();

        debug!(group = %group, files = files.len(), "generated group");
        generated.push(GeneratedGroup {
            group: group.clone(),
            dir,
            files,
        });
    }
    info!(groups = generated.len(), out = %output_root.display(), "generated charts");
    Ok(generated)
}

fn reset_dir(dir: &Path) -> Result<(), GenerateError> {
    let io = |source| GenerateError::Io {
        path: dir.to_path_buf(),
        source,
    };
    if dir.exists() {
        std::fs::remove_dir_all(dir).map_err(io)?;
    }
    std::fs::create_dir_all(dir).map_err(io)
}

fn write_yaml<T: Serialize>(path: &Path, value: &T, what: &str) -> Result<(), GenerateError> {
    let text = serde_yaml_ng::to_string(value).map_err(|source| GenerateError::Encode {
        what: what.to_string(),
        source,
    })?;
    std::fs::write(path, text).map_err(|source| GenerateError::Io {
        path: path.to_path_buf(),
        source,
    })
}
