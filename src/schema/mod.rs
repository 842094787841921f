//! JSON schema for config files, extended with per-unit values schemas.
//!
//! The base document describes the `Config` shape. Each registered unit
//! schema lands in `$defs` under a key derived from its source, and the
//! unit's entry under `groups` is narrowed so editors validate its
//! `values` against the chart's own schema.

use crate::core::error::SchemaError;
use crate::core::types::Config;
use schemars::gen::SchemaSettings;
use serde_json::{json, Map as JsonMap, Value as Json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Identifier of the built-in base schema.
pub const SCHEMA_ID: &str = "https://github.com/flotilla-rs/flotilla/schema/config";

const DEFS: &str = "$defs";
const GROUPS_KEY: &str = "groups";
const UNIT_REF: &str = "#/$defs/Unit";

/// Base schema generated from the `Config` types.
pub fn builtin() -> Result<Json, SchemaError> {
    let settings = SchemaSettings::draft2019_09();
    let meta = settings.meta_schema.clone().unwrap_or_default();
    let root = settings.into_generator().into_root_schema_for::<Config>();

    let mut defs = JsonMap::new();
    for (name, schema) in root.definitions {
        defs.insert(name, serde_json::to_value(schema).map_err(SchemaError::Encode)?);
    }
    let config = serde_json::to_value(root.schema).map_err(SchemaError::Encode)?;
    defs.insert("Config".into(), strip_root_keys(config));

    Ok(json!({
        "$schema": meta,
        "$id": SCHEMA_ID,
        "$ref": "#/$defs/Config",
        "$defs": defs,
    }))
}

fn strip_root_keys(mut schema: Json) -> Json {
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    schema
}

/// `$defs` key for a schema source.
///
/// The scheme and leading separators are dropped, remaining separators
/// become `-`, and the result is lowercased.
pub fn reference_key(source: &str) -> String {
    let rest = source.split_once("://").map_or(source, |(_, rest)| rest);
    rest.trim_start_matches(['/', '\\', '.'])
        .split(['/', '\\'])
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

/// Builds one composed schema document.
#[derive(Debug)]
pub struct SchemaComposer {
    base_dir: PathBuf,
    base: Option<Json>,
    fetched: BTreeMap<String, Json>,
}

impl SchemaComposer {
    /// Local sources resolve against `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            base: None,
            fetched: BTreeMap::new(),
        }
    }

    /// Use the schema generated from the `Config` types as the base.
    pub fn load_builtin(&mut self) -> Result<(), SchemaError> {
        self.base = Some(builtin()?);
        Ok(())
    }

    /// Fetch the base schema from a URL or a local path.
    pub fn load_base(&mut self, source: &str) -> Result<(), SchemaError> {
        let doc = self.fetch(source)?;
        info!(source, "loaded base schema");
        self.base = Some(doc);
        Ok(())
    }

    pub fn document(&self) -> Option<&Json> {
        self.base.as_ref()
    }

    /// Attach the values schema at `source` to one unit.
    ///
    /// Registering the same source again reuses the existing `$defs` entry.
    pub fn register_unit_schema(&mut self, group: &str, unit: &str, source: &str) -> Result<(), SchemaError> {
        let key = reference_key(source);
        let has_def = self
            .base
            .as_ref()
            .ok_or(SchemaError::NoBase)?
            .get(DEFS)
            .and_then(|d| d.get(&key))
            .is_some();

        let fragment = if has_def {
            None
        } else {
            let mut fragment = self.fetch(source)?;
            if let Some(obj) = fragment.as_object_mut() {
                obj.remove("$schema");
                obj.remove("$id");
            }
            Some(fragment)
        };

        let base = self.base.as_mut().ok_or(SchemaError::NoBase)?;
        let defs = ensure(&mut base[DEFS], json!({}));
        if let Some(fragment) = fragment {
            defs[key.as_str()] = fragment;
        }
        let config = ensure(&mut defs["Config"], json!({}));
        let properties = ensure(&mut config["properties"], json!({}));
        let groups = ensure(&mut properties[GROUPS_KEY], json!({"type": "object"}));
        let group_props = ensure(&mut groups["properties"], json!({}));
        let group_schema = ensure(
            &mut group_props[group],
            json!({
                "type": "object",
                "additionalProperties": {"$ref": UNIT_REF},
            }),
        );
        let unit_props = ensure(&mut group_schema["properties"], json!({}));
        unit_props[unit] = json!({
            "anyOf": [
                {"$ref": UNIT_REF},
                {
                    "type": "object",
                    "properties": {"values": {"$ref": format!("#/$defs/{key}")}},
                },
            ],
        });
        debug!(group, unit, key = %key, "registered unit schema");
        Ok(())
    }

    /// Register the values schema of every unit whose chart declares one.
    ///
    /// Loads the built-in base first when none is loaded.
    pub fn compose(&mut self, config: &Config) -> Result<(), SchemaError> {
        if self.base.is_none() {
            self.load_builtin()?;
        }
        for (group, unit, spec) in config.units() {
            if !spec.chart.schema.is_empty() {
                self.register_unit_schema(group, unit, &spec.chart.schema)?;
            }
        }
        Ok(())
    }

    /// The composed document as JSON text.
    pub fn serialize(&self, pretty: bool) -> Result<String, SchemaError> {
        let base = self.base.as_ref().ok_or(SchemaError::NoBase)?;
        let out = if pretty {
            serde_json::to_string_pretty(base)
        } else {
            serde_json::to_string(base)
        };
        out.map_err(SchemaError::Encode)
    }

    fn fetch(&mut self, source: &str) -> Result<Json, SchemaError> {
        if let Some(doc) = self.fetched.get(source) {
            return Ok(doc.clone());
        }
        let text = if source.starts_with("http://") || source.starts_with("https://") {
            fetch_url(source)?
        } else {
            let path = self.base_dir.join(Path::new(source));
            std::fs::read_to_string(&path).map_err(|e| SchemaError::Fetch {
                source_ref: source.to_string(),
                source: Box::new(e),
            })?
        };
        let doc: Json = serde_json::from_str(&text).map_err(|e| SchemaError::Parse {
            source_ref: source.to_string(),
            source: Some(e),
        })?;
        if !doc.is_object() {
            return Err(SchemaError::Parse {
                source_ref: source.to_string(),
                source: None,
            });
        }
        debug!(source, "fetched schema");
        self.fetched.insert(source.to_string(), doc.clone());
        Ok(doc)
    }
}

fn fetch_url(url: &str) -> Result<String, SchemaError> {
    let fetch_err = |e: reqwest::Error| SchemaError::Fetch {
        source_ref: url.to_string(),
        source: Box::new(e),
    };
    reqwest::blocking::get(url)
        .and_then(reqwest::blocking::Response::error_for_status)
        .and_then(reqwest::blocking::Response::text)
        .map_err(fetch_err)
}

/// `slot`, replaced by `initial` unless it already holds an object.
///
/// Indexing into the returned value by key never panics.
fn ensure(slot: &mut Json, initial: Json) -> &mut Json {
    if !slot.is_object() {
        *slot = initial;
    }
    slot
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAGMENT: &str = r#"{
  "$schema": "https://json-schema.org/draft/2020-12/schema",
  "type": "object",
  "properties": {"replicas": {"type": "integer"}}
}"#;

    fn composer_with_fragment() -> (tempfile::TempDir, SchemaComposer) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("charts/api")).unwrap();
        std::fs::write(dir.path().join("charts/api/values.schema.json"), FRAGMENT).unwrap();
        let mut composer = SchemaComposer::new(dir.path());
        composer.load_builtin().unwrap();
        (dir, composer)
    }

    #[test]
    fn test_reference_key() {
        assert_eq!(
            reference_key("https://raw.githubusercontent.com/Foo/helm-charts/main/charts/namespace/values.schema.json"),
            "raw.githubusercontent.com-foo-helm-charts-main-charts-namespace-values.schema.json"
        );
        assert_eq!(reference_key("./charts/API/values.schema.json"), "charts-api-values.schema.json");
        assert_eq!(reference_key("/abs//path.json"), "abs-path.json");
    }

    #[test]
    fn test_builtin_layout() {
        let doc = builtin().unwrap();
        assert_eq!(doc["$id"], SCHEMA_ID);
        assert_eq!(doc["$ref"], "#/$defs/Config");
        assert!(doc["$schema"].as_str().unwrap().contains("2019-09"));
        for def in ["Config", "Unit", "Dependency", "Build"] {
            assert!(doc["$defs"][def].is_object(), "missing $defs/{def}");
        }
        assert!(doc["$defs"]["Config"]["properties"]["groups"].is_object());
    }

    #[test]
    fn test_register_unit_schema_patches_unit() {
        let (_dir, mut composer) = composer_with_fragment();
        composer
            .register_unit_schema("site", "api", "charts/api/values.schema.json")
            .unwrap();
        let doc = composer.document().unwrap();
        let key = "charts-api-values.schema.json";

        assert_eq!(doc["$defs"][key]["properties"]["replicas"]["type"], "integer");
        assert!(doc["$defs"][key].get("$schema").is_none());

        let group = &doc["$defs"]["Config"]["properties"]["groups"]["properties"]["site"];
        assert_eq!(group["additionalProperties"]["$ref"], UNIT_REF);
        let unit = &group["properties"]["api"]["anyOf"];
        assert_eq!(unit[0]["$ref"], UNIT_REF);
        assert_eq!(unit[1]["properties"]["values"]["$ref"], format!("#/$defs/{key}"));
    }

    #[test]
    fn test_register_twice_is_idempotent() {
        let (dir, mut composer) = composer_with_fragment();
        let source = "charts/api/values.schema.json";
        composer.register_unit_schema("site", "api", source).unwrap();
        let first = composer.serialize(false).unwrap();

        // a changed file must not replace the registered entry
        std::fs::write(dir.path().join(source), r#"{"type": "string"}"#).unwrap();
        composer.register_unit_schema("site", "api", source).unwrap();
        assert_eq!(composer.serialize(false).unwrap(), first);

        let defs = composer.document().unwrap()["$defs"].as_object().unwrap();
        assert_eq!(defs.keys().filter(|k| k.starts_with("charts-api")).count(), 1);
    }

    #[test]
    fn test_load_base_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("base.json"), r#"{"$id": "x", "$defs": {}}"#).unwrap();
        let mut composer = SchemaComposer::new(dir.path());
        composer.load_base("base.json").unwrap();
        assert_eq!(composer.serialize(false).unwrap(), r#"{"$defs":{},"$id":"x"}"#);
    }

    #[test]
    fn test_fetch_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("list.json"), "[1]").unwrap();
        std::fs::write(dir.path().join("bad.json"), "{").unwrap();
        let mut composer = SchemaComposer::new(dir.path());

        assert!(matches!(composer.load_base("missing.json"), Err(SchemaError::Fetch { .. })));
        assert!(matches!(
            composer.load_base("list.json"),
            Err(SchemaError::Parse { source: None, .. })
        ));
        assert!(matches!(
            composer.load_base("bad.json"),
            Err(SchemaError::Parse { source: Some(_), .. })
        ));
    }

    #[test]
    fn test_register_needs_base() {
        let mut composer = SchemaComposer::new(".");
        let err = composer.register_unit_schema("g", "u", "x.json").unwrap_err();
        assert!(matches!(err, SchemaError::NoBase));
        assert!(matches!(composer.serialize(true), Err(SchemaError::NoBase)));
    }

    #[test]
    fn test_compose_uses_chart_schemas() {
        let (dir, _) = composer_with_fragment();
        let config: Config = serde_yaml_ng::from_str(
            "groups:\n  site:\n    api:\n      chart: {name: api, schema: charts/api/values.schema.json}\n    web:\n      chart: {name: web}\n",
        )
        .unwrap();
        let mut composer = SchemaComposer::new(dir.path());
        composer.compose(&config).unwrap();
        let doc = composer.document().unwrap();
        let units = &doc["$defs"]["Config"]["properties"]["groups"]["properties"]["site"]["properties"];
        assert!(units["api"]["anyOf"].is_array());
        assert!(units.get("web").is_none());
    }
}
