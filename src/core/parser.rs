//! Loading config layers from disk.
//!
//! Each file becomes a document tree. Charts given as a path string are
//! resolved against the chart's own `Chart.yaml` before merging, so later
//! layers see the same dependency shape whatever form the earlier one used.

use super::error::LoadError;
use super::value::{Map, Value};
use crate::template::{Mode, TemplateEngine, Vars};
use std::path::Path;
use tracing::debug;

/// Manifest file read from a local chart directory.
pub const CHART_MANIFEST: &str = "Chart.yaml";

/// Values schema a local chart may ship next to its manifest.
pub const CHART_SCHEMA: &str = "values.schema.json";

const LOCAL_SCHEME: &str = "file://";

/// Parse one config layer from disk.
pub fn load_file(path: &Path, engine: &TemplateEngine) -> Result<Value, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    load_str(&text, path, engine)
}

/// Parse one config layer. `path` is used for error messages only.
pub fn load_str(text: &str, path: &Path, engine: &TemplateEngine) -> Result<Value, LoadError> {
    let mut doc = read_mapping(text, path)?;
    resolve_charts(&mut doc, engine)?;
    debug!(path = %path.display(), "loaded layer");
    Ok(doc)
}

fn read_mapping(text: &str, path: &Path) -> Result<Value, LoadError> {
    let doc: Value = serde_yaml_ng::from_str(text).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    match doc {
        // an empty file is an empty layer
        Value::Null => Ok(Value::Map(Map::new())),
        Value::Map(_) => Ok(doc),
        other => Err(LoadError::NotAMapping {
            path: path.to_path_buf(),
            found: other.type_name(),
        }),
    }
}

/// Replace every shorthand `chart:` string with its dependency mapping.
pub fn resolve_charts(doc: &mut Value, engine: &TemplateEngine) -> Result<(), LoadError> {
    let Some(groups) = doc.as_map_mut().and_then(|m| m.get_mut("groups")).and_then(Value::as_map_mut) else {
        return Ok(());
    };
    for (group, units) in groups.iter_mut() {
        let Some(units) = units.as_map_mut() else { continue };
        for (unit, body) in units.iter_mut() {
            let Some(chart) = body.as_map_mut().and_then(|m| m.get_mut("chart")) else {
                continue;
            };
            let resolved = match chart {
                Value::Null | Value::Map(_) => continue,
                Value::String(path) => resolve_local_chart(path, engine)?,
                other => {
                    return Err(LoadError::InvalidChart {
                        group: group.clone(),
                        unit: unit.clone(),
                        found: other.type_name(),
                    })
                }
            };
            *chart = resolved;
        }
    }
    Ok(())
}

/// Build a dependency mapping from a local chart directory.
///
/// The path may contain template expressions and is rendered strictly with
/// no variables. It is kept relative in `repository`; the manifest is read
/// relative to the engine's base directory.
pub fn resolve_local_chart(path: &str, engine: &TemplateEngine) -> Result<Value, LoadError> {
    let rendered = engine
        .render(path, &Vars::new(), Mode::Strict)
        .map_err(|source| LoadError::ChartPath {
            path: path.to_string(),
            source: Box::new(source),
        })?;
    let rendered = rendered.trim().trim_end_matches('/').to_string();
    let dir = engine.base_dir().join(&rendered);
    let manifest_path = dir.join(CHART_MANIFEST);
    let manifest = std::fs::read_to_string(&manifest_path)
        .map_err(|source| LoadError::Read {
            path: manifest_path.clone(),
            source,
        })
        .and_then(|text| read_mapping(&text, &manifest_path))
        .map_err(|source| LoadError::ChartManifest {
            path: manifest_path.clone(),
            source: Box::new(source),
        })?;

    let field = |key: &str| manifest.get_path(&[key]).map(Value::to_text).unwrap_or_default();
    let mut dep = Map::new();
    dep.insert("name".into(), Value::String(field("name")));
    dep.insert("version".into(), Value::String(field("version")));
    dep.insert("repository".into(), Value::String(format!("{LOCAL_SCHEME}{rendered}")));
    if dir.join(CHART_SCHEMA).is_file() {
        dep.insert("schema".into(), Value::String(format!("{rendered}/{CHART_SCHEMA}")));
    }
    debug!(chart = %rendered, name = %field("name"), "resolved local chart");
    Ok(Value::Map(dep))
}
