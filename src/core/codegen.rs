//! Command lines for the image builder and the chart tool.
//!
//! Everything here is pure: each function returns the argument vector an
//! `Executor` should run. Empty values never produce a flag.

use super::types::{Build, Dependency};
use std::path::Path;

/// Chart tool binary.
pub const HELM: &str = "helm";
/// Image builder binary.
pub const DOCKER: &str = "docker";
/// Manifest customization binary.
pub const KUSTOMIZE: &str = "kustomize";

/// Combined output of a chart tool call for a release that does not exist.
pub const RELEASE_NOT_FOUND: &str = "release: not found";

/// Argument vector builder that drops empty values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgList {
    args: Vec<String>,
}

impl ArgList {
    pub fn new(program: &str) -> Self {
        Self {
            args: vec![program.to_string()],
        }
    }

    /// Append each non-empty argument.
    pub fn args<S: AsRef<str>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args.extend(
            args.into_iter()
                .map(|a| a.as_ref().to_string())
                .filter(|a| !a.is_empty()),
        );
        self
    }

    /// `name value`, skipped when `value` is empty.
    pub fn arg(mut self, name: &str, value: &str) -> Self {
        if !name.is_empty() && !value.is_empty() {
            self.args.push(name.to_string());
            self.args.push(value.to_string());
        }
        self
    }

    /// Bare `name` when `on`.
    pub fn flag(mut self, name: &str, on: bool) -> Self {
        if on {
            self.args.push(name.to_string());
        }
        self
    }

    /// `name value` once per non-empty value.
    pub fn list(mut self, name: &str, values: &[String]) -> Self {
        for v in values.iter().filter(|v| !v.is_empty()) {
            self.args.push(name.to_string());
            self.args.push(v.clone());
        }
        self
    }

    pub fn into_vec(self) -> Vec<String> {
        self.args
    }
}

/// Whether the caller's extra arguments already set `flag`, as `flag` or `flag=value`.
fn overridden(flag: &str, extra: &[String]) -> bool {
    extra
        .iter()
        .any(|a| a == flag || a.strip_prefix(flag).is_some_and(|rest| rest.starts_with('=')))
}

/// Split caller-supplied arguments on whitespace.
pub fn split_args(raw: &[String]) -> Vec<String> {
    raw.iter()
        .flat_map(|a| a.split_whitespace())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Image builds
// ============================================================================

/// `docker buildx build .`, run with the build context as working directory.
///
/// Single-valued flags given in `extra` take precedence over the build spec.
pub fn docker_build(build: &Build, extra: &[String]) -> Vec<String> {
    let single = |list: ArgList, name: &str, value: &str| {
        if overridden(name, extra) {
            list
        } else {
            list.arg(name, value)
        }
    };
    let flag = |list: ArgList, name: &str, on: bool| list.flag(name, on && !overridden(name, extra));

    let mut list = ArgList::new(DOCKER)
        .args(["buildx", "build", "."])
        .list("--add-host", &build.add_host)
        .list("--allow", &build.allow)
        .list("--attest", &build.attest)
        .list("--build-arg", &build.build_arg)
        .list("--build-context", &build.build_context);
    list = single(list, "--builder", &build.builder);
    list = single(list, "--cache-from", &build.cache_from);
    list = single(list, "--cache-to", &build.cache_to);
    list = single(list, "--file", &build.file);
    list = single(list, "--iidfile", &build.iidfile);
    list = list.list("--label", &build.label);
    list = flag(list, "--load", build.load);
    list = single(list, "--metadata-file", &build.metadata_file);
    list = single(list, "--network", &build.network);
    list = flag(list, "--no-cache", build.no_cache);
    list = list.list("--no-cache-filter", &build.no_cache_filter);
    list = single(list, "--output", &build.output);
    list = single(list, "--platform", &build.platform);
    list = flag(list, "--push", build.push);
    list = flag(list, "--pull", build.pull);
    list = flag(list, "--quiet", build.quiet);
    list = list.list("--secret", &build.secret);
    list = single(list, "--shm-size", &build.shm_size);
    list = single(list, "--ssh", &build.ssh);
    if !build.image.is_empty() {
        list = single(list, "--tag", &build.image_ref());
    }
    list = single(list, "--target", &build.target);
    list = single(list, "--ulimit", &build.ulimit);
    list.args(extra).into_vec()
}

/// `docker push image:tag`.
pub fn docker_push(build: &Build, extra: &[String]) -> Vec<String> {
    ArgList::new(DOCKER)
        .args(["push".to_string(), build.image_ref()])
        .args(extra)
        .into_vec()
}

// ============================================================================
// Chart releases
// ============================================================================

/// Program helm runs as the post-renderer; must be on `PATH`.
pub const POST_RENDERER: &str = "flotilla";

/// Hidden subcommand the post-renderer is invoked with.
pub const POST_RENDERER_COMMAND: &str = "post-renderer";

/// Release name of a unit.
pub fn release_name(group: &str, unit: &str) -> String {
    format!("{group}-{unit}")
}

/// Who deployed what, recorded in the release description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployInfo {
    /// User running the deployment
    pub deployed_by: String,
    /// Version of this tool
    pub managed_by: String,
    /// Commit of the deployed configuration
    pub git_commit: String,
}

impl DeployInfo {
    pub fn description(&self) -> String {
        format!(
            "\nDeployed-By: {}\nManaged-By: flotilla {}\nGit-Commit: {}",
            self.deployed_by, self.managed_by, self.git_commit
        )
    }
}

/// One unit's release, as the chart tool sees it.
#[derive(Debug, Clone, Copy)]
pub struct Release<'a> {
    pub group: &'a str,
    pub unit: &'a str,
    pub chart: &'a Dependency,
    pub namespace: &'a str,
    /// Generated values file for this unit
    pub values_file: &'a Path,
    /// Kustomization directory, empty for none
    pub kustomize: &'a str,
}

impl Release<'_> {
    pub fn name(&self) -> String {
        release_name(self.group, self.unit)
    }

    /// Local chart path, or the chart name with its repository and version.
    fn chart_ref(&self, list: ArgList) -> ArgList {
        match self.chart.local_path() {
            Some(path) => list.args([path]),
            None => list
                .args([self.chart.name.as_str()])
                .arg("--repo", &self.chart.repository)
                .arg("--version", &self.chart.version),
        }
    }

    fn post_renderer(&self, list: ArgList) -> ArgList {
        if self.kustomize.is_empty() {
            return list;
        }
        list.arg("--post-renderer", POST_RENDERER)
            .arg("--post-renderer-args", POST_RENDERER_COMMAND)
            .arg("--post-renderer-args", self.kustomize)
    }

    /// `helm upgrade --install`, or its dry run when `info` is `None`.
    pub fn upgrade(&self, info: Option<&DeployInfo>, extra: &[String]) -> Vec<String> {
        let mut list = ArgList::new(HELM)
            .args(["upgrade".to_string(), self.name(), "--install".to_string()])
            .arg("--set", &format!("group={},unit={}", self.group, self.unit));
        list = match info {
            Some(info) => list.arg("--description", &info.description()),
            None => list.flag("--dry-run", true),
        };
        list = list
            .arg("--namespace", self.namespace)
            .flag("--dependency-update", info.is_some());
        list = self.post_renderer(list).arg("-f", &self.values_file.display().to_string());
        self.chart_ref(list).args(extra).into_vec()
    }

    /// `helm template`: render the unit's manifests locally.
    pub fn template(&self, extra: &[String]) -> Vec<String> {
        let mut list = ArgList::new(HELM)
            .args(["template".to_string(), self.name()])
            .flag("--dependency-update", true)
            .arg("--namespace", self.namespace)
            .flag("--debug", true)
            .arg("--set", &format!("group={},unit={}", self.group, self.unit));
        list = self.post_renderer(list).arg("-f", &self.values_file.display().to_string());
        self.chart_ref(list).args(extra).into_vec()
    }

    pub fn manifest(&self) -> Vec<String> {
        ArgList::new(HELM)
            .args(["get".to_string(), "manifest".to_string(), self.name()])
            .arg("--namespace", self.namespace)
            .into_vec()
    }

    pub fn status(&self, extra: &[String]) -> Vec<String> {
        ArgList::new(HELM)
            .args(["status".to_string(), self.name()])
            .arg("--namespace", self.namespace)
            .arg("--output", "json")
            .flag("--show-desc", true)
            .args(extra)
            .into_vec()
    }

    pub fn rollback(&self, revision: &str, extra: &[String]) -> Vec<String> {
        ArgList::new(HELM)
            .args(["rollback".to_string(), self.name(), revision.to_string()])
            .args(extra)
            .arg("--namespace", self.namespace)
            .into_vec()
    }

    pub fn uninstall(&self, extra: &[String]) -> Vec<String> {
        ArgList::new(HELM)
            .args(["uninstall".to_string(), self.name()])
            .arg("--namespace", self.namespace)
            .args(extra)
            .into_vec()
    }
}

/// File the post-renderer leaves the chart's manifests in, inside the
/// kustomization directory.
pub const POST_RENDER_INPUT: &str = ".chart.yaml";

/// `kustomize build dir`.
pub fn kustomize_build(dir: &Path) -> Vec<String> {
    ArgList::new(KUSTOMIZE)
        .args(["build".to_string(), dir.display().to_string()])
        .into_vec()
}

/// `helm dependency update`, run inside a local chart directory.
pub fn dependency_update() -> Vec<String> {
    ArgList::new(HELM).args(["dependency", "update"]).into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_arg_list_skips_empty() {
        let args = ArgList::new("x")
            .args(["a", "", "b"])
            .arg("--name", "")
            .arg("--set", "v")
            .flag("--on", true)
            .flag("--off", false)
            .list("--l", &strings(&["1", "", "2"]))
            .into_vec();
        assert_eq!(args, strings(&["x", "a", "b", "--set", "v", "--on", "--l", "1", "--l", "2"]));
    }

    #[test]
    fn test_docker_build() {
        let build = Build {
            image: "ghcr.io/acme/api".into(),
            tag: "1.0".into(),
            build_arg: strings(&["A=1", "B=2"]),
            platform: "linux/amd64".into(),
            no_cache: true,
            ..Default::default()
        };
        assert_eq!(
            docker_build(&build, &[]),
            strings(&[
                "docker",
                "buildx",
                "build",
                ".",
                "--build-arg",
                "A=1",
                "--build-arg",
                "B=2",
                "--no-cache",
                "--platform",
                "linux/amd64",
                "--tag",
                "ghcr.io/acme/api:1.0",
            ])
        );
    }

    #[test]
    fn test_docker_build_extra_overrides() {
        let build = Build {
            image: "api".into(),
            tag: "1".into(),
            platform: "linux/amd64".into(),
            push: true,
            ..Default::default()
        };
        let extra = split_args(&strings(&["--platform linux/arm64", "--push"]));
        let args = docker_build(&build, &extra);
        assert_eq!(args.iter().filter(|a| *a == "--platform").count(), 1);
        assert_eq!(args.iter().filter(|a| *a == "--push").count(), 1);
        assert!(args.ends_with(&strings(&["--platform", "linux/arm64", "--push"])));
    }

    #[test]
    fn test_docker_push() {
        let build = Build {
            image: "api".into(),
            tag: "2".into(),
            ..Default::default()
        };
        assert_eq!(docker_push(&build, &[]), strings(&["docker", "push", "api:2"]));
    }

    fn remote() -> Dependency {
        Dependency {
            name: "postgresql".into(),
            repository: "https://charts.example.com".into(),
            version: "12.1.0".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_upgrade_remote_chart() {
        let chart = remote();
        let release = Release {
            group: "site",
            unit: "db",
            chart: &chart,
            namespace: "prod",
            values_file: Path::new(".flotilla/site/db.yaml"),
            kustomize: "",
        };
        let info = DeployInfo {
            deployed_by: "ops".into(),
            managed_by: "0.1.0".into(),
            git_commit: "abc".into(),
        };
        assert_eq!(
            release.upgrade(Some(&info), &strings(&["--atomic"])),
            strings(&[
                "helm",
                "upgrade",
                "site-db",
                "--install",
                "--set",
                "group=site,unit=db",
                "--description",
                "\nDeployed-By: ops\nManaged-By: flotilla 0.1.0\nGit-Commit: abc",
                "--namespace",
                "prod",
                "--dependency-update",
                "-f",
                ".flotilla/site/db.yaml",
                "postgresql",
                "--repo",
                "https://charts.example.com",
                "--version",
                "12.1.0",
                "--atomic",
            ])
        );
    }

    #[test]
    fn test_dry_run_local_chart() {
        let chart = Dependency {
            name: "api".into(),
            repository: "file://charts/api".into(),
            ..Default::default()
        };
        let release = Release {
            group: "site",
            unit: "api",
            chart: &chart,
            namespace: "",
            values_file: Path::new("out/site/api.yaml"),
            kustomize: "",
        };
        let args = release.upgrade(None, &[]);
        assert!(args.contains(&"--dry-run".to_string()));
        assert!(!args.contains(&"--namespace".to_string()));
        assert!(!args.contains(&"--dependency-update".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("charts/api"));
    }

    #[test]
    fn test_repository_chart_without_repo_or_version() {
        let chart = Dependency {
            name: "bitnami/postgresql".into(),
            ..Default::default()
        };
        let release = Release {
            group: "site",
            unit: "db",
            chart: &chart,
            namespace: "prod",
            values_file: Path::new("v.yaml"),
            kustomize: "",
        };
        let args = release.upgrade(None, &[]);
        assert!(args.ends_with(&strings(&["-f", "v.yaml", "bitnami/postgresql"])));
        assert!(!args.contains(&"--repo".to_string()));
        assert!(!args.contains(&"--version".to_string()));

        let pinned = Dependency {
            version: "12.1.0".into(),
            ..chart.clone()
        };
        let release = Release { chart: &pinned, ..release };
        assert!(release
            .upgrade(None, &[])
            .ends_with(&strings(&["bitnami/postgresql", "--version", "12.1.0"])));
    }

    #[test]
    fn test_template_with_kustomize() {
        let chart = Dependency {
            name: "api".into(),
            repository: "file://charts/api".into(),
            ..Default::default()
        };
        let release = Release {
            group: "site",
            unit: "api",
            chart: &chart,
            namespace: "prod",
            values_file: Path::new("out/site/api.yaml"),
            kustomize: "overlays/prod",
        };
        assert_eq!(
            release.template(&strings(&["--skip-tests"])),
            strings(&[
                "helm",
                "template",
                "site-api",
                "--dependency-update",
                "--namespace",
                "prod",
                "--debug",
                "--set",
                "group=site,unit=api",
                "--post-renderer",
                "flotilla",
                "--post-renderer-args",
                "post-renderer",
                "--post-renderer-args",
                "overlays/prod",
                "-f",
                "out/site/api.yaml",
                "charts/api",
                "--skip-tests",
            ])
        );

        let upgrade = release.upgrade(None, &[]);
        let at = upgrade.iter().position(|a| a == "--post-renderer").unwrap();
        assert_eq!(upgrade[at + 1], "flotilla");
        assert_eq!(upgrade[at + 5], "overlays/prod");
    }

    #[test]
    fn test_override_needs_exact_flag() {
        let build = Build {
            no_cache: true,
            platform: "linux/amd64".into(),
            ..Default::default()
        };
        let args = docker_build(&build, &strings(&["--no-cache-filter", "stage", "--platform=linux/arm64"]));
        assert!(args.contains(&"--no-cache".to_string()));
        assert!(!args.contains(&"linux/amd64".to_string()));
        assert!(args.ends_with(&strings(&["--no-cache-filter", "stage", "--platform=linux/arm64"])));
    }

    #[test]
    fn test_release_queries() {
        let chart = remote();
        let release = Release {
            group: "g",
            unit: "u",
            chart: &chart,
            namespace: "ns",
            values_file: Path::new("v.yaml"),
            kustomize: "",
        };
        assert_eq!(release.manifest(), strings(&["helm", "get", "manifest", "g-u", "--namespace", "ns"]));
        assert_eq!(
            release.status(&[]),
            strings(&["helm", "status", "g-u", "--namespace", "ns", "--output", "json", "--show-desc"])
        );
        assert_eq!(release.rollback("", &[]), strings(&["helm", "rollback", "g-u", "--namespace", "ns"]));
        assert_eq!(
            release.rollback("3", &[]),
            strings(&["helm", "rollback", "g-u", "3", "--namespace", "ns"])
        );
        assert_eq!(release.uninstall(&[]), strings(&["helm", "uninstall", "g-u", "--namespace", "ns"]));
    }
}
