//! Narrowing a config to the units an operation should touch.

use super::error::SelectionError;
use super::types::{Config, Tag, Unit};
use tracing::debug;

/// Which part of a config to keep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// One group, or every group when `None`
    pub group: Option<String>,
    /// Unit names to keep; empty keeps all
    pub units: Vec<String>,
    /// Include terms, and `-`-prefixed exclude terms
    pub tags: Vec<Tag>,
}

impl Selection {
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn units<S: Into<String>>(mut self, units: impl IntoIterator<Item = S>) -> Self {
        self.units = units.into_iter().map(Into::into).collect();
        self
    }

    pub fn tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags = tags.into_iter().map(Tag::new).collect();
        self
    }
}

/// Tag predicate split into include and exclude terms.
#[derive(Debug, Clone, Default)]
pub struct TagFilter<'a> {
    include: Vec<&'a str>,
    exclude: Vec<&'a str>,
}

impl<'a> TagFilter<'a> {
    pub fn new(terms: &'a [Tag]) -> Self {
        let (exclude, include): (Vec<&Tag>, Vec<&Tag>) = terms.iter().partition(|t| t.is_negative());
        Self {
            include: include.into_iter().map(Tag::name).collect(),
            exclude: exclude.into_iter().map(Tag::name).collect(),
        }
    }

    /// Excludes win over includes. With no include terms every unit not
    /// excluded passes, including untagged ones.
    pub fn matches(&self, unit: &Unit) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|t| unit.has_tag(t));
        included && !self.exclude.iter().any(|t| unit.has_tag(t))
    }
}

/// Apply `selection` to `config`.
///
/// Group and unit names are checked before the tag predicate runs, so a
/// misspelled name fails even when tags would have dropped it anyway.
pub fn select(mut config: Config, selection: &Selection) -> Result<Config, SelectionError> {
    if let Some(name) = &selection.group {
        let group = config
            .groups
            .remove(name)
            .ok_or_else(|| SelectionError::UnknownGroup(name.clone()))?;
        config.groups.clear();
        config.groups.insert(name.clone(), group);
    }

    if !selection.units.is_empty() {
        for unit in &selection.units {
            if !config.groups.values().any(|g| g.contains_key(unit)) {
                return Err(SelectionError::UnknownUnit {
                    unit: unit.clone(),
                    scope: match &selection.group {
                        Some(g) => format!("group `{g}`"),
                        None => "any group".to_string(),
                    },
                });
            }
        }
        for group in config.groups.values_mut() {
            group.retain(|name, _| selection.units.contains(name));
        }
    }

    let filter = TagFilter::new(&selection.tags);
    for group in config.groups.values_mut() {
        group.retain(|_, unit| filter.matches(unit));
    }
    config.groups.retain(|_, units| !units.is_empty());

    debug!(
        groups = config.groups.len(),
        units = config.unit_count(),
        "selected units"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> Config {
        serde_yaml_ng::from_str(
            r#"
groups:
  site:
    api: {chart: {name: api}, tags: [backend]}
    worker: {chart: {name: worker}, tags: [backend, skip]}
    web: {chart: {name: web}, tags: [frontend]}
    docs: {chart: {name: docs}}
  ops:
    prometheus: {chart: {name: prometheus}, tags: [monitoring]}
"#,
        )
        .unwrap()
    }

    fn names(config: &Config) -> Vec<String> {
        config.units().map(|(g, u, _)| format!("{g}/{u}")).collect()
    }

    #[test]
    fn test_select_everything() {
        let selected = select(config(), &Selection::default()).unwrap();
        assert_eq!(selected, config());
    }

    #[test]
    fn test_select_group() {
        let selected = select(config(), &Selection::default().group("ops")).unwrap();
        assert_eq!(names(&selected), ["ops/prometheus"]);
    }

    #[test]
    fn test_unknown_group() {
        let err = select(config(), &Selection::default().group("nope")).unwrap_err();
        assert!(matches!(err, SelectionError::UnknownGroup(ref g) if g == "nope"));
    }

    #[test]
    fn test_select_units() {
        let selected = select(config(), &Selection::default().units(["web", "prometheus"])).unwrap();
        assert_eq!(names(&selected), ["ops/prometheus", "site/web"]);
    }

    #[test]
    fn test_unknown_unit_in_group() {
        let selection = Selection::default().group("ops").units(["api"]);
        let err = select(config(), &selection).unwrap_err();
        assert_eq!(err.to_string(), "unknown unit `api` in group `ops`");
    }

    #[test]
    fn test_exclude_wins() {
        let selection = Selection::default().tags(["backend", "-skip"]);
        let selected = select(config(), &selection).unwrap();
        assert_eq!(names(&selected), ["site/api"]);
    }

    #[test]
    fn test_exclude_only_keeps_untagged() {
        let selection = Selection::default().group("site").tags(["-backend"]);
        let selected = select(config(), &selection).unwrap();
        assert_eq!(names(&selected), ["site/docs", "site/web"]);
    }

    #[test]
    fn test_include_drops_untagged() {
        let selection = Selection::default().group("site").tags(["frontend"]);
        let selected = select(config(), &selection).unwrap();
        assert_eq!(names(&selected), ["site/web"]);
    }

    #[test]
    fn test_empty_groups_removed_after_tags() {
        let selected = select(config(), &Selection::default().tags(["monitoring"])).unwrap();
        assert_eq!(selected.group_names(), ["ops"]);
    }

    proptest! {
        #[test]
        fn prop_excluded_tag_never_selected(tag in "[a-z]{1,4}", unit_tags in prop::collection::vec("[a-z]{1,4}", 0..4)) {
            let unit = Unit { tags: unit_tags.iter().map(|t| Tag::new(t.as_str())).collect(), ..Default::default() };
            let terms = [Tag::new(tag.as_str()), Tag::new(format!("-{tag}"))];
            let filter = TagFilter::new(&terms);
            prop_assert!(!(filter.matches(&unit) && unit.has_tag(&tag)));
        }
    }
}
