//! Core pipeline: load, merge, select, render, generate, run.
//!
//! Each stage is a plain function over owned values; the CLI chains them.

pub mod codegen;
pub mod error;
pub mod executor;
pub mod generate;
pub mod merger;
pub mod parser;
pub mod selector;
pub mod types;
pub mod value;

use crate::template::{TemplateEngine, Vars};
use error::{Error, LoadError, TemplateError};
use selector::Selection;
use std::path::Path;
use tracing::info;
use types::Config;
use value::Value;

/// Load every layer in order. Paths are resolved as given.
pub fn load<P: AsRef<Path>>(files: &[P], engine: &TemplateEngine) -> Result<Vec<Value>, Error> {
    let docs = files
        .iter()
        .map(|f| parser::load_file(f.as_ref(), engine))
        .collect::<Result<Vec<_>, _>>()?;
    info!(files = docs.len(), "loaded config layers");
    Ok(docs)
}

/// Fold layers into one config, last layer winning.
pub fn merge(docs: Vec<Value>) -> Result<Config, Error> {
    let merged = merger::merge_documents(docs)?;
    let config: Config = merged.decode().map_err(LoadError::Decode)?;
    info!(groups = config.groups.len(), units = config.unit_count(), "merged config");
    Ok(config)
}

/// Load and merge in one step.
pub fn load_config<P: AsRef<Path>>(files: &[P], engine: &TemplateEngine) -> Result<Config, Error> {
    merge(load(files, engine)?)
}

pub fn select(config: Config, selection: &Selection) -> Result<Config, Error> {
    let selected = selector::select(config, selection)?;
    info!(groups = selected.groups.len(), units = selected.unit_count(), "selected units");
    Ok(selected)
}

/// Run the merged config through the two-pass template protocol.
///
/// `vars` sit beneath the reserved `Global`, `Vars` and `Groups` keys the
/// document itself provides.
pub fn render(config: &Config, vars: &Vars, engine: &TemplateEngine) -> Result<Config, Error> {
    let text = serde_yaml_ng::to_string(config).map_err(TemplateError::Encode)?;
    let rendered = engine.render_document(&text, vars)?;
    let doc: Value = serde_yaml_ng::from_str(&rendered).map_err(TemplateError::Document)?;
    let config: Config = doc.decode().map_err(LoadError::Decode)?;
    info!(units = config.unit_count(), "rendered config");
    Ok(config)
}
