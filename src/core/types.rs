//! Typed configuration model.
//!
//! Defines the YAML shape of a flotilla file: groups of units, each unit
//! backed by a chart dependency, optional builds, and free-form values.
//! All map-valued fields are `BTreeMap`, so every listing is key-sorted.

use super::error::LoadError;
use super::value::{Map, Value};
use schemars::gen::SchemaGenerator;
use schemars::schema::{Schema, SchemaObject, SubschemaValidation};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A mapping whose iteration order is the lexicographic order of its keys.
pub type OrderedMap<V> = BTreeMap<String, V>;

/// The units of one group, keyed by unit name.
pub type Group = OrderedMap<Unit>;

// ============================================================================
// Top-level flotilla.yaml
// ============================================================================

/// Root configuration after merging every layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Schema version of the file
    #[serde(
        default,
        skip_serializing_if = "String::is_empty",
        deserialize_with = "lenient_string"
    )]
    pub version: String,

    /// Variables available to templates as `.Vars`
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub vars: Map,

    /// Values injected into every unit as `global`
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub global: Map,

    /// Shared builds that unit builds may name in `dependencies`
    #[serde(
        default,
        skip_serializing_if = "OrderedMap::is_empty",
        deserialize_with = "build_map"
    )]
    #[schemars(schema_with = "build_map_schema")]
    pub builds: OrderedMap<Build>,

    /// Group definitions
    #[serde(default, skip_serializing_if = "OrderedMap::is_empty")]
    pub groups: OrderedMap<Group>,
}

impl Config {
    /// Group names, sorted.
    pub fn group_names(&self) -> Vec<&str> {
        self.groups.keys().map(String::as_str).collect()
    }

    /// Every unit as `(group, unit, definition)`, ordered by group then unit.
    pub fn units(&self) -> impl Iterator<Item = (&str, &str, &Unit)> {
        self.groups.iter().flat_map(|(group, units)| {
            units
                .iter()
                .map(move |(name, unit)| (group.as_str(), name.as_str(), unit))
        })
    }

    /// Total number of units across all groups.
    pub fn unit_count(&self) -> usize {
        self.groups.values().map(|g| g.len()).sum()
    }

    /// Shared builds referenced by any unit build's `dependencies`.
    pub fn build_dependencies(&self) -> Result<OrderedMap<Build>, LoadError> {
        let mut deps = OrderedMap::new();
        for (group, name, unit) in self.units() {
            for build in unit.builds.values() {
                for dep in &build.dependencies {
                    let shared = self.builds.get(dep).ok_or_else(|| {
                        LoadError::MissingBuildDependency {
                            group: group.to_string(),
                            unit: name.to_string(),
                            name: dep.clone(),
                        }
                    })?;
                    deps.insert(dep.clone(), shared.clone());
                }
            }
        }
        Ok(deps)
    }
}

// ============================================================================
// Units
// ============================================================================

/// The smallest deployable entity: one chart plus builds and values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Unit {
    /// Chart to install, as a mapping or a local chart path
    #[serde(default)]
    #[schemars(schema_with = "chart_schema")]
    pub chart: Dependency,

    /// Selection labels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,

    /// Container builds, keyed by build name
    #[serde(
        default,
        skip_serializing_if = "OrderedMap::is_empty",
        deserialize_with = "build_map"
    )]
    #[schemars(schema_with = "build_map_schema")]
    pub builds: OrderedMap<Build>,

    /// Kustomization directory applied to rendered manifests as a post-renderer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kustomize: String,

    /// Chart value overrides
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub values: Map,
}

impl Unit {
    /// Values as installed: `global` and `vars` are injected unless the unit
    /// already defines them.
    pub fn values_with(&self, global: &Map, vars: &Map) -> Map {
        let mut values = self.values.clone();
        if !global.is_empty() {
            values
                .entry("global".to_string())
                .or_insert_with(|| Value::Map(global.clone()));
        }
        if !vars.is_empty() {
            values
                .entry("vars".to_string())
                .or_insert_with(|| Value::Map(vars.clone()));
        }
        values
    }

    /// Build names, sorted.
    pub fn build_names(&self) -> Vec<&str> {
        self.builds.keys().map(String::as_str).collect()
    }

    /// Whether any tag of this unit has the given name.
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.as_str() == name)
    }
}

// ============================================================================
// Chart dependency
// ============================================================================

/// A reference to a packaged chart.
///
/// Local charts given in shorthand form are resolved by the loader; by the
/// time a `Dependency` is decoded it is always a mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Dependency {
    /// Chart name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Chart repository URL, `file://` for local charts
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,

    /// Chart version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Alias inside an umbrella chart
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,

    /// Location of the chart's values schema
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schema: String,
}

impl Dependency {
    /// Directory of a local chart, if this is one.
    pub fn local_path(&self) -> Option<&str> {
        self.repository.strip_prefix("file://")
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.name, self.version)
    }
}

// ============================================================================
// Builds
// ============================================================================

/// A container image build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Build {
    /// Build context directory
    #[serde(skip_serializing_if = "String::is_empty")]
    pub context: String,

    /// Custom host-to-IP mappings (`host:ip`)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub add_host: Vec<String>,

    /// Extra privileged entitlements
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,

    /// Attestation parameters
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attest: Vec<String>,

    /// Build-time variables
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub build_arg: Vec<String>,

    /// Additional named build contexts
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub build_context: Vec<String>,

    /// Builder instance override
    #[serde(skip_serializing_if = "String::is_empty")]
    pub builder: String,

    /// External cache source
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cache_from: String,

    /// Cache export destination
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cache_to: String,

    /// Dockerfile name
    #[serde(skip_serializing_if = "String::is_empty")]
    pub file: String,

    /// Write the image ID to this file
    #[serde(skip_serializing_if = "String::is_empty")]
    pub iidfile: String,

    /// Image metadata labels
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub label: Vec<String>,

    /// Load the result into the local image store
    #[serde(skip_serializing_if = "is_false")]
    pub load: bool,

    /// Write build metadata to this file
    #[serde(skip_serializing_if = "String::is_empty")]
    pub metadata_file: String,

    /// Networking mode for RUN instructions
    #[serde(skip_serializing_if = "String::is_empty")]
    pub network: String,

    /// Build without cache
    #[serde(skip_serializing_if = "is_false")]
    pub no_cache: bool,

    /// Stages never cached
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub no_cache_filter: Vec<String>,

    /// Output destination
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,

    /// Target platform
    #[serde(skip_serializing_if = "String::is_empty")]
    pub platform: String,

    /// Secrets exposed to the build
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secret: Vec<String>,

    /// Size of /dev/shm
    #[serde(skip_serializing_if = "String::is_empty")]
    pub shm_size: String,

    /// SSH agent socket or keys
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ssh: String,

    /// Image tag
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tag: String,

    /// Image name
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// Target build stage
    #[serde(skip_serializing_if = "String::is_empty")]
    pub target: String,

    /// Ulimit options
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ulimit: String,

    /// Names of shared builds this build relies on
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Suppress build output
    #[serde(skip_serializing_if = "is_false")]
    pub quiet: bool,

    /// Always pull referenced images
    #[serde(skip_serializing_if = "is_false")]
    pub pull: bool,

    /// Push the result to the registry
    #[serde(skip_serializing_if = "is_false")]
    pub push: bool,
}

impl Build {
    /// `image:tag`, or just the image when no tag is set.
    pub fn image_ref(&self) -> String {
        if self.tag.is_empty() {
            self.image.clone()
        } else {
            format!("{}:{}", self.image, self.tag)
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Accepts either a full build mapping or a bare context string.
#[derive(Deserialize)]
#[serde(untagged)]
enum BuildNode {
    Context(String),
    Spec(Build),
}

fn build_map<'de, D: Deserializer<'de>>(d: D) -> Result<OrderedMap<Build>, D::Error> {
    let nodes = Option::<OrderedMap<BuildNode>>::deserialize(d)?.unwrap_or_default();
    Ok(nodes
        .into_iter()
        .map(|(name, node)| {
            let build = match node {
                BuildNode::Context(context) => Build {
                    context,
                    ..Build::default()
                },
                BuildNode::Spec(build) => build,
            };
            (name, build)
        })
        .collect())
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Value::deserialize(d)?.to_text())
}

// ============================================================================
// Tags
// ============================================================================

/// A selection label. A leading `-` marks an exclusion term in filters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Tag(pub String);

impl Tag {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0.starts_with('-')
    }

    /// The label without its sign.
    pub fn name(&self) -> &str {
        self.0.strip_prefix('-').unwrap_or(&self.0)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Schema helpers
// ============================================================================

fn string_or<T: JsonSchema>(gen: &mut SchemaGenerator) -> Schema {
    SchemaObject {
        subschemas: Some(Box::new(SubschemaValidation {
            any_of: Some(vec![gen.subschema_for::<String>(), gen.subschema_for::<T>()]),
            ..Default::default()
        })),
        ..Default::default()
    }
    .into()
}

fn chart_schema(gen: &mut SchemaGenerator) -> Schema {
    string_or::<Dependency>(gen)
}

fn build_map_schema(gen: &mut SchemaGenerator) -> Schema {
    let item = string_or::<Build>(gen);
    let mut schema = gen.subschema_for::<OrderedMap<Value>>().into_object();
    schema.object().additional_properties = Some(Box::new(item));
    schema.into()
}
