//! CLI subcommands: config, list, schema, generate, the unit operations,
//! and the post-renderer helm calls back into.
//!
//! Every subcommand resolves the same pipeline (load, merge, select, render)
//! before doing its own work.

use crate::core::codegen::DeployInfo;
use crate::core::error::{Error, TaskError};
use crate::core::executor::{self, Operation, OperationOptions, ReleaseStatus};
use crate::core::generate;
use crate::core::selector::Selection;
use crate::core::types::Config;
use crate::core::value::Value;
use crate::runner::{CancelToken, TaskReport};
use crate::schema::SchemaComposer;
use crate::template::{git, TemplateEngine, Vars};
use crate::transport::{Executor, ProcessExecutor};
use clap::{Args, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which files to load and which units to act on.
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Config layers, merged in order
    #[arg(short, long = "file", default_value = "flotilla.yaml")]
    pub files: Vec<PathBuf>,

    /// Group to select (default: all)
    pub group: Option<String>,

    /// Units to select within the group (default: all)
    pub units: Vec<String>,

    /// Tag terms; prefix with `-` to exclude
    #[arg(short, long, value_delimiter = ',', allow_hyphen_values = true)]
    pub tags: Vec<String>,

    /// Template variable as key=value, dotted keys nest
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,
}

/// Execution parameters for unit operations.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Namespace releases live in
    #[arg(short, long, default_value = "default")]
    pub namespace: String,

    /// Number of units processed at once
    #[arg(short, long, default_value_t = 1)]
    pub parallel: usize,

    /// Directory for generated charts and values files
    #[arg(long, default_value = ".flotilla")]
    pub output_dir: PathBuf,

    /// Extra arguments passed to every tool invocation
    #[arg(long = "extra-args", allow_hyphen_values = true)]
    pub extra_args: Vec<String>,

    /// Abort after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the resolved config
    Config {
        #[command(flatten)]
        target: Target,

        /// Skip template rendering
        #[arg(long)]
        raw: bool,
    },

    /// List selected units
    List {
        #[command(flatten)]
        target: Target,

        /// Also list each unit's builds
        #[arg(long)]
        builds: bool,
    },

    /// Print the JSON schema of the config, extended with chart value schemas
    Schema {
        #[command(flatten)]
        target: Target,

        /// Base schema URL or path (default: built in)
        #[arg(long)]
        base: Option<String>,

        /// Pretty-print the output
        #[arg(long)]
        pretty: bool,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write umbrella charts and values files
    Generate {
        #[command(flatten)]
        target: Target,

        /// Output directory
        #[arg(long, default_value = ".flotilla")]
        output_dir: PathBuf,
    },

    /// Build unit images
    Build(OperationArgs),

    /// Push unit images
    Push(OperationArgs),

    /// Install or upgrade unit releases
    Install(OperationArgs),

    /// Show what an install would change
    Diff(OperationArgs),

    /// Roll unit releases back
    Rollback {
        #[command(flatten)]
        op: OperationArgs,

        /// Revision to roll back to (default: previous)
        #[arg(long, default_value = "")]
        revision: String,
    },

    /// Show release status of units
    Status(OperationArgs),

    /// Remove unit releases
    Uninstall(OperationArgs),

    /// Render unit manifests locally
    Template(OperationArgs),

    /// Post-renderer helm calls for units with a kustomization
    #[command(hide = true)]
    PostRenderer {
        /// Kustomization directory
        path: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct OperationArgs {
    #[command(flatten)]
    pub target: Target,

    #[command(flatten)]
    pub run: RunArgs,
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    let executor: Arc<dyn Executor> = Arc::new(ProcessExecutor);
    let root = PathBuf::from(".");
    match cmd {
        Commands::Config { target, raw } => cmd_config(&target, raw, &root, executor),
        Commands::List { target, builds } => cmd_list(&target, builds, &root, executor),
        Commands::Schema {
            target,
            base,
            pretty,
            output,
        } => cmd_schema(&target, base.as_deref(), pretty, output.as_deref(), &root, executor),
        Commands::Generate { target, output_dir } => cmd_generate(&target, &output_dir, &root, executor),
        Commands::Build(args) => cmd_operation(Operation::Build, &args, "", &root, executor),
        Commands::Push(args) => cmd_operation(Operation::Push, &args, "", &root, executor),
        Commands::Install(args) => cmd_operation(Operation::Install, &args, "", &root, executor),
        Commands::Diff(args) => cmd_operation(Operation::Diff, &args, "", &root, executor),
        Commands::Rollback { op, revision } => cmd_operation(Operation::Rollback, &op, &revision, &root, executor),
        Commands::Status(args) => cmd_operation(Operation::Status, &args, "", &root, executor),
        Commands::Uninstall(args) => cmd_operation(Operation::Uninstall, &args, "", &root, executor),
        Commands::Template(args) => cmd_operation(Operation::Template, &args, "", &root, executor),
        Commands::PostRenderer { path } => cmd_post_renderer(&path, executor.as_ref()),
    }
}

/// Render an error with every cause in its chain.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

fn fail(err: Error) -> String {
    if let Error::Task(task) = &err {
        if let Some(output) = task.output().filter(|o| !o.trim().is_empty()) {
            eprintln!("{}", output.trim_end());
        }
    }
    error_chain(&err)
}

/// Parse `--var` flags. Dotted keys build nested maps.
pub fn parse_vars(raw: &[String]) -> Result<Vars, String> {
    let mut vars = Vars::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("invalid --var {entry:?}, expected KEY=VALUE"))?;
        let mut path = key.split('.').peekable();
        let mut slot = &mut vars;
        while let Some(part) = path.next() {
            if path.peek().is_none() {
                slot.insert(part.to_string(), Value::from(value));
                break;
            }
            let next = slot
                .entry(part.to_string())
                .or_insert_with(|| Value::Map(Default::default()));
            if !matches!(next, Value::Map(_)) {
                *next = Value::Map(Default::default());
            }
            slot = match next {
                Value::Map(m) => m,
                _ => return Err(format!("invalid --var key {key:?}")),
            };
        }
    }
    Ok(vars)
}

impl Target {
    fn selection(&self) -> Selection {
        Selection {
            group: self.group.clone(),
            units: self.units.clone(),
            tags: self.tags.iter().map(|t| t.as_str().into()).collect(),
        }
    }

    /// Load, merge, select and (unless `raw`) render.
    fn resolve(&self, raw: bool, engine: &TemplateEngine) -> Result<Config, String> {
        let vars = parse_vars(&self.vars)?;
        let config = crate::core::load_config(&self.files, engine).map_err(fail)?;
        let config = crate::core::select(config, &self.selection()).map_err(fail)?;
        if raw {
            return Ok(config);
        }
        crate::core::render(&config, &vars, engine).map_err(fail)
    }
}

fn cmd_config(target: &Target, raw: bool, root: &Path, executor: Arc<dyn Executor>) -> Result<(), String> {
    let engine = TemplateEngine::new(root, executor);
    let config = target.resolve(raw, &engine)?;
    let text = serde_yaml_ng::to_string(&config).map_err(|e| format!("cannot serialize config: {e}"))?;
    print!("{text}");
    Ok(())
}

fn cmd_list(target: &Target, builds: bool, root: &Path, executor: Arc<dyn Executor>) -> Result<(), String> {
    let engine = TemplateEngine::new(root, executor);
    let config = target.resolve(false, &engine)?;
    print!("{}", format_units(&config, builds));
    Ok(())
}

/// One line per unit, `group/unit` followed by its tags.
pub fn format_units(config: &Config, builds: bool) -> String {
    let mut out = String::new();
    for (group, name, unit) in config.units() {
        out.push_str(&format!("{group}/{name}"));
        if !unit.tags.is_empty() {
            let tags: Vec<&str> = unit.tags.iter().map(|t| t.as_str()).collect();
            out.push_str(&format!(" [{}]", tags.join(", ")));
        }
        out.push('\n');
        if builds {
            for (build, spec) in &unit.builds {
                out.push_str(&format!("  {build}: {}\n", spec.image_ref()));
            }
        }
    }
    out
}

fn cmd_schema(
    target: &Target,
    base: Option<&str>,
    pretty: bool,
    output: Option<&Path>,
    root: &Path,
    executor: Arc<dyn Executor>,
) -> Result<(), String> {
    let engine = TemplateEngine::new(root, executor);
    let config = target.resolve(false, &engine)?;
    let mut composer = SchemaComposer::new(root);
    if let Some(base) = base {
        composer.load_base(base).map_err(|e| fail(e.into()))?;
    }
    composer.compose(&config).map_err(|e| fail(e.into()))?;
    let text = composer.serialize(pretty).map_err(|e| fail(e.into()))?;
    match output {
        Some(path) => std::fs::write(path, text).map_err(|e| format!("cannot write {}: {e}", path.display())),
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

fn cmd_generate(target: &Target, output_dir: &Path, root: &Path, executor: Arc<dyn Executor>) -> Result<(), String> {
    let engine = TemplateEngine::new(root, executor);
    let config = target.resolve(false, &engine)?;
    let generated = generate::generate(&config, root, output_dir).map_err(|e| fail(e.into()))?;
    for group in &generated {
        println!("{}: {} file(s) in {}", group.group, group.files.len(), group.dir.display());
    }
    Ok(())
}

/// Who is deploying, from `USER` and the repository's HEAD.
fn deploy_info(executor: &dyn Executor, root: &Path) -> DeployInfo {
    let git_commit = git::query(executor, &git::repository_dir(root), "commitsha").unwrap_or_else(|e| {
        debug!(error = %e, "no git commit for release description");
        String::new()
    });
    DeployInfo {
        deployed_by: std::env::var("USER").unwrap_or_default(),
        managed_by: env!("CARGO_PKG_VERSION").to_string(),
        git_commit,
    }
}

fn cmd_operation(
    op: Operation,
    args: &OperationArgs,
    revision: &str,
    root: &Path,
    executor: Arc<dyn Executor>,
) -> Result<(), String> {
    let engine = TemplateEngine::new(root, Arc::clone(&executor));
    let config = args.target.resolve(false, &engine)?;
    if config.unit_count() == 0 {
        println!("No units selected.");
        return Ok(());
    }

    if matches!(op, Operation::Install | Operation::Diff | Operation::Template) {
        generate::generate(&config, root, &args.run.output_dir).map_err(|e| fail(e.into()))?;
    }
    let opts = OperationOptions {
        namespace: args.run.namespace.clone(),
        concurrency: args.run.parallel,
        project_root: root.to_path_buf(),
        output_dir: args.run.output_dir.clone(),
        extra_args: args.run.extra_args.clone(),
        revision: revision.to_string(),
        deploy: if op == Operation::Install {
            deploy_info(executor.as_ref(), root)
        } else {
            DeployInfo::default()
        },
    };
    let cancel = match args.run.timeout {
        Some(secs) => CancelToken::with_timeout(Duration::from_secs(secs)),
        None => CancelToken::new(),
    };

    let reports = executor::run_operation(executor, &config, op, &opts, &cancel).map_err(|e| fail(e.into()))?;
    print!("{}", format_reports(op, &reports).map_err(|e| fail(e.into()))?);
    Ok(())
}

/// Read manifests from stdin and print them through `kustomize build`.
fn cmd_post_renderer(path: &Path, executor: &dyn Executor) -> Result<(), String> {
    let mut manifests = String::new();
    std::io::stdin()
        .read_to_string(&mut manifests)
        .map_err(|e| format!("cannot read manifests from stdin: {e}"))?;
    let out = executor::post_render(executor, path, &manifests, &CancelToken::new()).map_err(|e| fail(e.into()))?;
    print!("{out}");
    Ok(())
}

/// Human-readable summary of a finished operation.
pub fn format_reports(op: Operation, reports: &[TaskReport]) -> Result<String, TaskError> {
    let mut out = String::new();
    match op {
        Operation::Status => {
            let rows = reports
                .iter()
                .map(ReleaseStatus::from_report)
                .collect::<Result<Vec<_>, _>>()?;
            out.push_str(&format_status(&rows));
        }
        Operation::Diff => {
            for report in reports {
                if report.output.is_empty() {
                    out.push_str(&format!("{}: no changes\n", report.id));
                } else {
                    out.push_str(&format!("--- {}\n{}", report.id, report.output));
                }
            }
        }
        Operation::Template => {
            for report in reports {
                out.push_str(&format!("# {}\n{}", report.id, report.output));
                if !report.output.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
        _ => {
            for report in reports {
                out.push_str(&format!("{}: {op} done ({:.2}s)\n", report.id, report.duration.as_secs_f64()));
            }
        }
    }
    Ok(out)
}

/// Status rows as aligned columns.
pub fn format_status(rows: &[ReleaseStatus]) -> String {
    let header = ["NAME", "REVISION", "STATUS", "DEPLOYED BY", "COMMIT", "LAST DEPLOYED", "NOTES"];
    let cells: Vec<[String; 7]> = rows
        .iter()
        .map(|r| {
            [
                r.name.clone(),
                if r.revision == 0 { String::new() } else { r.revision.to_string() },
                r.status.clone(),
                r.deployed_by.clone(),
                r.git_commit.chars().take(8).collect(),
                r.last_deployed.clone(),
                r.notes.join(" | "),
            ]
        })
        .collect();

    let mut widths = header.map(str::len);
    for row in &cells {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }
    let line = |row: &[String]| {
        let padded: Vec<String> = row
            .iter()
            .zip(widths)
            .map(|(cell, w)| format!("{cell:<w$}"))
            .collect();
        format!("{}\n", padded.join("  ").trim_end())
    };

    let mut out = line(header.map(String::from).as_slice());
    for row in &cells {
        out.push_str(&line(row.as_slice()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(subcommand)]
        command: Commands,
    }

    fn parse(args: &[&str]) -> Commands {
        TestCli::try_parse_from(std::iter::once("flotilla").chain(args.iter().copied()))
            .unwrap()
            .command
    }

    #[test]
    fn test_parse_operation_args() {
        let Commands::Install(args) = parse(&[
            "install",
            "-f",
            "base.yaml",
            "-f",
            "prod.yaml",
            "site",
            "api",
            "web",
            "--tags",
            "backend,-skip",
            "--parallel",
            "4",
        ]) else {
            panic!("expected install");
        };
        assert_eq!(args.target.files, [PathBuf::from("base.yaml"), PathBuf::from("prod.yaml")]);
        assert_eq!(args.target.group.as_deref(), Some("site"));
        assert_eq!(args.target.units, ["api", "web"]);
        assert_eq!(args.target.tags, ["backend", "-skip"]);
        assert_eq!(args.run.parallel, 4);
        assert_eq!(args.run.namespace, "default");
    }

    #[test]
    fn test_default_file() {
        let Commands::Config { target, raw } = parse(&["config"]) else {
            panic!("expected config");
        };
        assert_eq!(target.files, [PathBuf::from("flotilla.yaml")]);
        assert!(!raw);
    }

    #[test]
    fn test_rollback_revision() {
        let Commands::Rollback { revision, .. } = parse(&["rollback", "--revision", "3"]) else {
            panic!("expected rollback");
        };
        assert_eq!(revision, "3");
    }

    #[test]
    fn test_parse_vars_nested() {
        let vars = parse_vars(&["stage=prod".into(), "db.host=localhost".into(), "db.port=5432".into()]).unwrap();
        assert_eq!(vars.get("stage"), Some(&Value::from("prod")));
        let db = vars.get("db").and_then(Value::as_map).unwrap();
        assert_eq!(db.get("host"), Some(&Value::from("localhost")));
        assert_eq!(db.get("port"), Some(&Value::from("5432")));
    }

    #[test]
    fn test_parse_vars_rejects_missing_equals() {
        assert!(parse_vars(&["stage".into()]).is_err());
    }

    #[test]
    fn test_format_units() {
        let config: Config = serde_yaml_ng::from_str(
            "groups:\n  site:\n    api:\n      tags: [backend, http]\n      builds: {default: {image: acme/api, tag: '1'}}\n    web: {}\n",
        )
        .unwrap();
        assert_eq!(format_units(&config, false), "site/api [backend, http]\nsite/web\n");
        assert_eq!(
            format_units(&config, true),
            "site/api [backend, http]\n  default: acme/api:1\nsite/web\n"
        );
    }

    #[test]
    fn test_format_status() {
        let rows = [
            ReleaseStatus {
                name: "site-api".into(),
                revision: 2,
                status: "deployed".into(),
                deployed_by: "ops".into(),
                git_commit: "0123456789abcdef".into(),
                notes: vec!["a".into(), "b".into()],
                ..Default::default()
            },
            ReleaseStatus::not_installed("site-db".into()),
        ];
        let out = format_status(&rows);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("NAME      REVISION  STATUS"));
        assert!(lines[1].contains("01234567 "));
        assert!(lines[1].ends_with("a | b"));
        assert_eq!(lines[2], "site-db             not installed");
    }

    #[test]
    fn test_format_diff_reports() {
        let reports = [
            TaskReport {
                id: "site/api".into(),
                output: String::new(),
                duration: Duration::ZERO,
            },
            TaskReport {
                id: "site/db".into(),
                output: "+ kind: Service\n".into(),
                duration: Duration::ZERO,
            },
        ];
        let out = format_reports(Operation::Diff, &reports).unwrap();
        assert_eq!(out, "site/api: no changes\n--- site/db\n+ kind: Service\n");
    }

    #[test]
    fn test_format_template_reports() {
        let reports = [
            TaskReport {
                id: "site/api".into(),
                output: "kind: Service\n".into(),
                duration: Duration::ZERO,
            },
            TaskReport {
                id: "site/db".into(),
                output: "kind: StatefulSet".into(),
                duration: Duration::ZERO,
            },
        ];
        let out = format_reports(Operation::Template, &reports).unwrap();
        assert_eq!(out, "# site/api\nkind: Service\n# site/db\nkind: StatefulSet\n");
    }

    #[test]
    fn test_parse_post_renderer() {
        let Commands::PostRenderer { path } = parse(&["post-renderer", "overlays/prod"]) else {
            panic!("expected post-renderer");
        };
        assert_eq!(path, PathBuf::from("overlays/prod"));
        assert!(matches!(parse(&["template", "site"]), Commands::Template(_)));
    }

    #[test]
    fn test_error_chain() {
        let err = Error::Task(TaskError::Exec {
            unit: "site/api".into(),
            operation: "install".into(),
            source: crate::transport::ExecError::EmptyCommand,
        });
        assert_eq!(error_chain(&err), "site/api: install could not run: empty command line");
    }
}
