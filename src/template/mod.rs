//! Two-pass template rendering with `<% ... %>` expressions.
//!
//! The delimiters differ from the chart tool's own `{{ }}`, so chart
//! templates embedded in values pass through untouched.
//!
//! A document is rendered tolerantly first: undefined variables become
//! empty. The tolerant output is parsed and its `global`, `vars` and
//! `groups` sections are exposed as `.Global`, `.Vars` and `.Groups`. The
//! original text is then rendered strictly against that variable set, so a
//! document may reference values it defines itself while typos still fail.

pub mod functions;
pub mod git;
pub(crate) mod parse;
pub mod secrets;

use crate::core::error::{FunctionError, TemplateError};
use crate::core::value::{Map, Value};
use crate::transport::Executor;
use parse::{Command, Operand, Pipeline, Segment, Template};
use secrets::{OnePasswordCli, SecretCache, SecretProvider};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Template variables, keyed by top-level name.
pub type Vars = Map;

/// Document sections exposed to templates, and the names they go by.
pub const RESERVED_VARS: [(&str, &str); 3] = [("global", "Global"), ("vars", "Vars"), ("groups", "Groups")];

const MAX_INCLUDE_DEPTH: usize = 16;
const MAX_TOLERANT_PASSES: usize = 3;

/// How undefined variables are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Undefined variables render as empty
    Tolerant,
    /// Undefined variables are an error
    Strict,
}

pub(crate) struct Scope<'a> {
    pub vars: &'a Vars,
    pub mode: Mode,
    pub depth: usize,
}

/// Renders templates for one run. Owns the run's secret cache.
pub struct TemplateEngine {
    base_dir: PathBuf,
    git_dir: PathBuf,
    executor: Arc<dyn Executor>,
    secrets: SecretCache,
}

impl TemplateEngine {
    /// Relative `file` paths resolve against `base_dir`. Secrets come from
    /// the `op` CLI unless another provider is installed.
    pub fn new(base_dir: impl Into<PathBuf>, executor: Arc<dyn Executor>) -> Self {
        let base_dir = base_dir.into();
        let secrets = SecretCache::new(OnePasswordCli::new(Arc::clone(&executor), base_dir.clone()));
        Self {
            git_dir: git::repository_dir(&base_dir),
            base_dir,
            executor,
            secrets,
        }
    }

    /// Replace the secret provider; resets the cache.
    pub fn with_secrets(mut self, provider: impl SecretProvider + 'static) -> Self {
        self.secrets = SecretCache::new(provider);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn secrets(&self) -> &SecretCache {
        &self.secrets
    }

    pub(crate) fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    pub(crate) fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Single pass over `text`.
    pub fn render(&self, text: &str, vars: &Vars, mode: Mode) -> Result<String, TemplateError> {
        self.render_at(text, vars, mode, 0)
    }

    /// Full tolerant-then-strict rendering of a YAML document.
    pub fn render_document(&self, text: &str, vars: &Vars) -> Result<String, TemplateError> {
        self.render_document_at(text, vars, 0)
    }

    pub(crate) fn render_at(
        &self,
        text: &str,
        vars: &Vars,
        mode: Mode,
        depth: usize,
    ) -> Result<String, TemplateError> {
        let template = Template::parse(text)?;
        self.execute(&template, &Scope { vars, mode, depth })
    }

    fn render_document_at(&self, text: &str, seed: &Vars, depth: usize) -> Result<String, TemplateError> {
        let template = Template::parse(text)?;
        if !template.has_expressions() {
            return Ok(text.to_string());
        }

        // values defined through other templated values need more than one
        // tolerant pass before they settle
        let mut vars = seed.clone();
        for pass in 1..=MAX_TOLERANT_PASSES {
            let scope = Scope {
                vars: &vars,
                mode: Mode::Tolerant,
                depth,
            };
            let out = self.execute(&template, &scope)?;
            let next = document_vars(&out, seed);
            debug!(pass, depth, "tolerant pass");
            if next == vars {
                break;
            }
            vars = next;
        }

        let scope = Scope {
            vars: &vars,
            mode: Mode::Strict,
            depth,
        };
        self.execute(&template, &scope)
    }

    fn execute(&self, template: &Template, scope: &Scope<'_>) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &template.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr {
                    line,
                    source,
                    pipeline,
                } => {
                    let value = self.eval_pipeline(pipeline, scope, *line, source)?;
                    out.push_str(&value.to_text());
                }
            }
        }
        Ok(out)
    }

    fn eval_pipeline(
        &self,
        pipeline: &Pipeline,
        scope: &Scope<'_>,
        line: usize,
        expr: &str,
    ) -> Result<Value, TemplateError> {
        let mut piped: Option<Value> = None;
        for command in &pipeline.commands {
            let value = match command {
                Command::Operand(operand) => {
                    if piped.is_some() {
                        return Err(TemplateError::Syntax {
                            line,
                            message: format!("cannot pipe into a non-function in `{expr}`"),
                        });
                    }
                    self.eval_operand(operand, scope, line, expr)?
                }
                Command::Call { name, args } => {
                    let function = functions::lookup(name).ok_or_else(|| TemplateError::UnknownFunction {
                        line,
                        expr: expr.to_string(),
                        name: name.clone(),
                    })?;
                    let mut values = args
                        .iter()
                        .map(|a| self.eval_operand(a, scope, line, expr))
                        .collect::<Result<Vec<_>, _>>()?;
                    values.extend(piped.take());
                    function(self, scope, values).map_err(|source| TemplateError::Function {
                        line,
                        expr: expr.to_string(),
                        source,
                    })?
                }
            };
            piped = Some(value);
        }
        Ok(piped.unwrap_or_default())
    }

    fn eval_operand(
        &self,
        operand: &Operand,
        scope: &Scope<'_>,
        line: usize,
        expr: &str,
    ) -> Result<Value, TemplateError> {
        match operand {
            Operand::Literal(v) => Ok(v.clone()),
            Operand::Nested(inner) => self.eval_pipeline(inner, scope, line, expr),
            Operand::Field(path) => {
                let Some((head, rest)) = path.split_first() else {
                    return Ok(Value::Map(scope.vars.clone()));
                };
                let found = scope.vars.get(head).and_then(|v| v.get_path(rest));
                match (found, scope.mode) {
                    (Some(v), _) => Ok(v.clone()),
                    (None, Mode::Tolerant) => Ok(Value::Null),
                    (None, Mode::Strict) => Err(TemplateError::UndefinedVariable {
                        line,
                        expr: expr.to_string(),
                        path: path.join("."),
                    }),
                }
            }
        }
    }

    /// Read another file and render it in the caller's mode.
    pub(crate) fn include(&self, path: &str, scope: &Scope<'_>) -> Result<String, FunctionError> {
        if path.is_empty() {
            return Ok(String::new());
        }
        let full = self.base_dir.join(path);
        if scope.depth >= MAX_INCLUDE_DEPTH {
            return Err(FunctionError::IncludeDepth {
                path: full,
                max: MAX_INCLUDE_DEPTH,
            });
        }
        let text = std::fs::read_to_string(&full).map_err(|source| FunctionError::Read {
            path: full.clone(),
            source,
        })?;
        let depth = scope.depth + 1;
        let rendered = match scope.mode {
            // the strict pass has not happened yet for the caller either
            Mode::Tolerant => self.render_at(&text, scope.vars, Mode::Tolerant, depth),
            Mode::Strict => self.render_document_at(&text, scope.vars, depth),
        }
        .map_err(|source| FunctionError::Include {
            path: full,
            source: Box::new(source),
        })?;
        Ok(rendered.trim().to_string())
    }
}

/// Variables exposed by a rendered document, layered over `seed`.
///
/// Output that is not a YAML mapping contributes nothing.
pub fn document_vars(rendered: &str, seed: &Vars) -> Vars {
    let mut vars = seed.clone();
    let doc: Value = match serde_yaml_ng::from_str(rendered) {
        Ok(doc) => doc,
        Err(err) => {
            debug!(error = %err, "tolerant output is not YAML");
            return vars;
        }
    };
    if let Value::Map(map) = doc {
        for (section, name) in RESERVED_VARS {
            if let Some(v) = map.get(section) {
                vars.insert(name.to_string(), v.clone());
            }
        }
    }
    vars
}
