//! Per-unit operations driven through the task runner.
//!
//! Every operation turns the selected units into independent tasks. A task
//! builds its command line with `codegen`, runs it through the injected
//! `Executor`, and reports the command's output. The first failing task
//! cancels the rest.

use super::codegen::{self, DeployInfo, Release, RELEASE_NOT_FOUND};
use super::error::TaskError;
use super::generate::unit_values_path;
use super::types::{Build, Config, Dependency};
use crate::runner::{CancelToken, Runner, TaskReport};
use crate::transport::{run_checked, ExecError, Executor};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// What to do with each selected unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Build the unit's images
    Build,
    /// Push the unit's images
    Push,
    /// Install or upgrade the unit's release
    Install,
    /// Compare the deployed manifest with a dry run
    Diff,
    /// Roll the release back
    Rollback,
    /// Report release status
    Status,
    /// Remove the release
    Uninstall,
    /// Render the release's manifests locally
    Template,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Self::Build,
        Self::Push,
        Self::Install,
        Self::Diff,
        Self::Rollback,
        Self::Status,
        Self::Uninstall,
        Self::Template,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Push => "push",
            Self::Install => "install",
            Self::Diff => "diff",
            Self::Rollback => "rollback",
            Self::Status => "status",
            Self::Uninstall => "uninstall",
            Self::Template => "template",
        }
    }

    /// Whether this operation acts on images rather than releases.
    pub fn is_image_operation(self) -> bool {
        matches!(self, Self::Build | Self::Push)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("unknown operation '{s}'"))
    }
}

/// Parameters shared by every task of one run.
#[derive(Debug, Clone)]
pub struct OperationOptions {
    /// Target namespace for releases
    pub namespace: String,
    /// Number of tasks run at once
    pub concurrency: usize,
    /// Directory relative chart and build paths resolve against
    pub project_root: PathBuf,
    /// Where generated values files live
    pub output_dir: PathBuf,
    /// Extra arguments appended to every tool invocation
    pub extra_args: Vec<String>,
    /// Revision to roll back to; empty means the previous one
    pub revision: String,
    /// Recorded in release descriptions on install
    pub deploy: DeployInfo,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            namespace: "default".into(),
            concurrency: 1,
            project_root: PathBuf::from("."),
            output_dir: PathBuf::from(".flotilla"),
            extra_args: Vec::new(),
            revision: String::new(),
            deploy: DeployInfo::default(),
        }
    }
}

/// Run `op` for every unit in `config`.
///
/// Image operations run one task per build, after a first pass over the
/// shared builds the unit builds name in `dependencies`. Release operations
/// run one task per unit. Reports come back in group, unit, build order.
pub fn run_operation(
    executor: Arc<dyn Executor>,
    config: &Config,
    op: Operation,
    opts: &OperationOptions,
    cancel: &CancelToken,
) -> Result<Vec<TaskReport>, TaskError> {
    let opts = Arc::new(opts.clone());
    let mut reports = Vec::new();

    if op.is_image_operation() {
        let shared = config.build_dependencies().map_err(|e| TaskError::Invalid {
            unit: "builds".into(),
            message: e.to_string(),
        })?;
        if !shared.is_empty() {
            let mut runner = Runner::new(opts.concurrency);
            for (name, build) in shared {
                add_image_task(&mut runner, format!("builds/{name}"), build, op, &executor, &opts);
            }
            info!(operation = %op, tasks = runner.len(), "running shared builds");
            reports = runner.run(cancel)?;
        }
    }

    let mut runner = Runner::new(opts.concurrency);
    for (group, unit_name, unit) in config.units() {
        if op.is_image_operation() {
            for (build_name, build) in &unit.builds {
                let id = format!("{group}/{unit_name}/{build_name}");
                add_image_task(&mut runner, id, build.clone(), op, &executor, &opts);
            }
        } else {
            let id = format!("{group}/{unit_name}");
            let task = ReleaseTask {
                id: id.clone(),
                group: group.to_string(),
                unit: unit_name.to_string(),
                chart: unit.chart.clone(),
                kustomize: unit.kustomize.clone(),
                executor: Arc::clone(&executor),
                opts: Arc::clone(&opts),
            };
            runner.add(id, move |cancel: &CancelToken| task.run(op, cancel));
        }
    }

    info!(operation = %op, tasks = runner.len(), concurrency = opts.concurrency, "running operation");
    reports.extend(runner.run(cancel)?);
    Ok(reports)
}

fn add_image_task(
    runner: &mut Runner,
    id: String,
    build: Build,
    op: Operation,
    executor: &Arc<dyn Executor>,
    opts: &Arc<OperationOptions>,
) {
    let task = ImageTask {
        id: id.clone(),
        build,
        executor: Arc::clone(executor),
        opts: Arc::clone(opts),
    };
    runner.add(id, move |cancel: &CancelToken| task.run(op, cancel));
}

fn task_error(id: &str, op: &str, err: ExecError) -> TaskError {
    match err {
        ExecError::Failed { code, output, .. } => TaskError::Failed {
            unit: id.to_string(),
            operation: op.to_string(),
            code,
            output,
        },
        source => TaskError::Exec {
            unit: id.to_string(),
            operation: op.to_string(),
            source,
        },
    }
}

// ============================================================================
// Images
// ============================================================================

struct ImageTask {
    id: String,
    build: Build,
    executor: Arc<dyn Executor>,
    opts: Arc<OperationOptions>,
}

impl ImageTask {
    fn run(self, op: Operation, cancel: &CancelToken) -> Result<String, TaskError> {
        let extra = codegen::split_args(&self.opts.extra_args);
        let (args, cwd) = match op {
            Operation::Push => {
                if self.build.image.is_empty() {
                    return Err(TaskError::Invalid {
                        unit: self.id,
                        message: "build has no image to push".into(),
                    });
                }
                (codegen::docker_push(&self.build, &extra), self.opts.project_root.clone())
            }
            _ => (
                codegen::docker_build(&self.build, &extra),
                self.opts.project_root.join(&self.build.context),
            ),
        };
        debug!(id = %self.id, operation = %op, "running image task");
        run_checked(self.executor.as_ref(), &args, &cwd, cancel).map_err(|e| task_error(&self.id, op.as_str(), e))
    }
}

// ============================================================================
// Releases
// ============================================================================

struct ReleaseTask {
    id: String,
    group: String,
    unit: String,
    chart: Dependency,
    kustomize: String,
    executor: Arc<dyn Executor>,
    opts: Arc<OperationOptions>,
}

impl ReleaseTask {
    fn run(self, op: Operation, cancel: &CancelToken) -> Result<String, TaskError> {
        let values_file = unit_values_path(&self.opts.output_dir, &self.group, &self.unit);
        let release = Release {
            group: &self.group,
            unit: &self.unit,
            chart: &self.chart,
            namespace: &self.opts.namespace,
            values_file: &values_file,
            kustomize: &self.kustomize,
        };
        let extra = codegen::split_args(&self.opts.extra_args);
        let root = self.opts.project_root.as_path();
        let exec = self.executor.as_ref();
        let fail = |e: ExecError| task_error(&self.id, op.as_str(), e);
        debug!(id = %self.id, operation = %op, release = %release.name(), "running release task");

        match op {
            Operation::Install => {
                if let Some(local) = self.chart.local_path() {
                    run_checked(exec, &codegen::dependency_update(), &root.join(local), cancel).map_err(fail)?;
                }
                run_checked(exec, &release.upgrade(Some(&self.opts.deploy), &extra), root, cancel).map_err(fail)
            }
            Operation::Diff => {
                let deployed = tolerate_missing(run_checked(exec, &release.manifest(), root, cancel))
                    .map_err(fail)?
                    .unwrap_or_default();
                let dry_run = run_checked(exec, &release.upgrade(None, &extra), root, cancel).map_err(fail)?;
                Ok(line_diff(&deployed, dry_run_manifest(&dry_run)))
            }
            Operation::Rollback => {
                run_checked(exec, &release.rollback(&self.opts.revision, &extra), root, cancel).map_err(fail)
            }
            Operation::Status => {
                let raw = tolerate_missing(run_checked(exec, &release.status(&extra), root, cancel)).map_err(fail)?;
                let status = match raw {
                    Some(raw) => parse_release_status(&raw).map_err(|source| TaskError::Output {
                        unit: self.id.clone(),
                        operation: op.to_string(),
                        source,
                    })?,
                    None => ReleaseStatus::not_installed(release.name()),
                };
                serde_json::to_string(&status).map_err(|source| TaskError::Output {
                    unit: self.id.clone(),
                    operation: op.to_string(),
                    source,
                })
            }
            Operation::Uninstall => {
                let out = tolerate_missing(run_checked(exec, &release.uninstall(&extra), root, cancel)).map_err(fail)?;
                Ok(out.unwrap_or_else(|| format!("release {} not found", release.name())))
            }
            Operation::Template => run_checked(exec, &release.template(&extra), root, cancel).map_err(fail),
            Operation::Build | Operation::Push => Err(TaskError::Invalid {
                unit: self.id.clone(),
                message: format!("{op} is not a release operation"),
            }),
        }
    }
}

/// Post-renderer step: leave `manifests` in the kustomization at `dir` and
/// return what `kustomize build` makes of them.
///
/// The kustomization is expected to list the manifest file as a resource.
pub fn post_render(
    executor: &dyn Executor,
    dir: &Path,
    manifests: &str,
    cancel: &CancelToken,
) -> Result<String, TaskError> {
    let id = dir.display().to_string();
    let input = dir.join(codegen::POST_RENDER_INPUT);
    std::fs::write(&input, manifests).map_err(|e| TaskError::Invalid {
        unit: id.clone(),
        message: format!("cannot write {}: {e}", input.display()),
    })?;
    debug!(dir = %id, bytes = manifests.len(), "post-rendering manifests");
    run_checked(executor, &codegen::kustomize_build(dir), Path::new("."), cancel)
        .map_err(|e| task_error(&id, codegen::POST_RENDERER_COMMAND, e))
}

/// `None` when the command failed only because the release does not exist.
fn tolerate_missing(result: Result<String, ExecError>) -> Result<Option<String>, ExecError> {
    match result {
        Ok(out) => Ok(Some(out)),
        Err(ExecError::Failed { ref output, .. }) if output.contains(RELEASE_NOT_FOUND) => Ok(None),
        Err(e) => Err(e),
    }
}

/// The manifest section of `helm upgrade --dry-run` output.
///
/// Output without a `MANIFEST:` marker is returned whole.
pub fn dry_run_manifest(output: &str) -> &str {
    let Some(start) = output.find("MANIFEST:\n") else {
        return output;
    };
    let body = &output[start + "MANIFEST:\n".len()..];
    match body.find("\nNOTES:\n") {
        Some(end) => &body[..=end],
        None => body,
    }
}

// ============================================================================
// Release status
// ============================================================================

/// One row of the status report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStatus {
    pub name: String,
    pub revision: u64,
    pub status: String,
    pub deployed_by: String,
    pub git_commit: String,
    pub last_deployed: String,
    pub notes: Vec<String>,
}

impl ReleaseStatus {
    pub fn not_installed(name: String) -> Self {
        Self {
            name,
            status: "not installed".into(),
            ..Default::default()
        }
    }

    /// Decode the row a status task reported.
    pub fn from_report(report: &TaskReport) -> Result<Self, TaskError> {
        serde_json::from_str(&report.output).map_err(|source| TaskError::Output {
            unit: report.id.clone(),
            operation: Operation::Status.to_string(),
            source,
        })
    }
}

#[derive(Deserialize)]
struct RawStatus {
    name: String,
    #[serde(default)]
    version: u64,
    #[serde(default)]
    info: RawInfo,
}

#[derive(Deserialize, Default)]
struct RawInfo {
    #[serde(default)]
    status: String,
    #[serde(default)]
    last_deployed: String,
    #[serde(default)]
    description: String,
}

/// Parse `helm status --output json --show-desc`.
///
/// `Deployed-By:` and `Git-Commit:` lines of the description fill their
/// columns; `Managed-By:` is dropped and any other non-empty line is a note.
pub fn parse_release_status(raw: &str) -> Result<ReleaseStatus, serde_json::Error> {
    let parsed: RawStatus = serde_json::from_str(raw)?;
    let mut status = ReleaseStatus {
        name: parsed.name,
        revision: parsed.version,
        status: parsed.info.status,
        last_deployed: parsed.info.last_deployed,
        ..Default::default()
    };
    for line in parsed.info.description.lines() {
        if let Some(v) = line.strip_prefix("Deployed-By: ") {
            status.deployed_by = v.to_string();
        } else if let Some(v) = line.strip_prefix("Git-Commit: ") {
            status.git_commit = v.to_string();
        } else if !line.starts_with("Managed-By: ") && !line.trim().is_empty() {
            status.notes.push(line.to_string());
        }
    }
    Ok(status)
}

// ============================================================================
// Line diff
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit<'a> {
    Keep(&'a str),
    Delete(&'a str),
    Insert(&'a str),
}

/// Unified-style line diff: `-` for removed, `+` for added, two spaces for
/// unchanged lines. Empty when both sides are equal.
///
/// Common leading and trailing lines are matched directly; the rest goes
/// through Hirschberg's linear-space LCS.
pub fn line_diff(old: &str, new: &str) -> String {
    if old == new {
        return String::new();
    }
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();

    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let mut edits: Vec<Edit> = a[..prefix].iter().map(|l| Edit::Keep(l)).collect();
    hirschberg(&a[prefix..a.len() - suffix], &b[prefix..b.len() - suffix], &mut edits);
    edits.extend(a[a.len() - suffix..].iter().map(|l| Edit::Keep(l)));

    let mut out = String::new();
    for edit in edits {
        let _ = match edit {
            Edit::Keep(l) => writeln!(out, "  {l}"),
            Edit::Delete(l) => writeln!(out, "- {l}"),
            Edit::Insert(l) => writeln!(out, "+ {l}"),
        };
    }
    out
}

fn hirschberg<'a>(a: &[&'a str], b: &[&'a str], edits: &mut Vec<Edit<'a>>) {
    if a.is_empty() {
        edits.extend(b.iter().map(|l| Edit::Insert(l)));
        return;
    }
    if b.is_empty() {
        edits.extend(a.iter().map(|l| Edit::Delete(l)));
        return;
    }
    if a.len() == 1 {
        match b.iter().position(|l| *l == a[0]) {
            Some(k) => {
                edits.extend(b[..k].iter().map(|l| Edit::Insert(l)));
                edits.push(Edit::Keep(a[0]));
                edits.extend(b[k + 1..].iter().map(|l| Edit::Insert(l)));
            }
            None => {
                edits.push(Edit::Delete(a[0]));
                edits.extend(b.iter().map(|l| Edit::Insert(l)));
            }
        }
        return;
    }

    let mid = a.len() / 2;
    let forward = lcs_lengths(&a[..mid], b);
    let rev_a: Vec<&str> = a[mid..].iter().rev().copied().collect();
    let rev_b: Vec<&str> = b.iter().rev().copied().collect();
    let backward = lcs_lengths(&rev_a, &rev_b);
    // split b where the two halves together keep the most lines
    let split = (0..=b.len())
        .max_by_key(|&k| (forward[k] + backward[b.len() - k], std::cmp::Reverse(k)))
        .unwrap_or(0);

    hirschberg(&a[..mid], &b[..split], edits);
    hirschberg(&a[mid..], &b[split..], edits);
}

/// Last row of the LCS table: entry `k` is the LCS length of all of `a`
/// against the first `k` lines of `b`.
fn lcs_lengths(a: &[&str], b: &[&str]) -> Vec<usize> {
    let mut prev = vec![0usize; b.len() + 1];
    let mut row = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            row[j + 1] = if x == y { prev[j] + 1 } else { prev[j + 1].max(row[j]) };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev
}
