//! Template function library.
//!
//! Every function receives its evaluated arguments as `Value`s. A value
//! piped in with `|` arrives as the last argument.

use super::{git, Scope, TemplateEngine};
use crate::core::error::FunctionError;
use crate::core::value::Value;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

pub(crate) type Function = fn(&TemplateEngine, &Scope<'_>, Vec<Value>) -> Result<Value, FunctionError>;

const FUNCTIONS: &[(&str, Function)] = &[
    ("env", env),
    ("envDefault", env_default),
    ("default", default),
    ("defaultIndex", default_index),
    ("indent", indent),
    ("quote", quote),
    ("quoteAll", quote_all),
    ("replace", replace),
    ("base64", base64),
    ("toYaml", to_yaml),
    ("toJson", to_json),
    ("git", git_info),
    ("file", file),
    ("op", op),
    ("opDoc", op_doc),
];

pub(crate) fn lookup(name: &str) -> Option<Function> {
    FUNCTIONS.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
}

/// Names of all built-in functions.
pub fn names() -> impl Iterator<Item = &'static str> {
    FUNCTIONS.iter().map(|(n, _)| *n)
}

fn exact<const N: usize>(name: &'static str, args: Vec<Value>) -> Result<[Value; N], FunctionError> {
    let got = args.len();
    <[Value; N]>::try_from(args).map_err(|_| FunctionError::Arity {
        name,
        expected: N.to_string(),
        got,
    })
}

fn integer(name: &'static str, v: &Value) -> Result<i64, FunctionError> {
    let parsed = match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| FunctionError::Argument {
        name,
        message: format!("expected an integer, got {}", v.type_name()),
    })
}

fn is_empty_text(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

// ============================================================================
// Environment and defaults
// ============================================================================

fn env(_: &TemplateEngine, _: &Scope<'_>, args: Vec<Value>) -> Result<Value, FunctionError> {
    let [name] = exact("env", args)?;
    let name = name.to_text();
    match std::env::var(&name) {
        Ok(v) if !v.is_empty() => Ok(Value::String(v)),
        _ => Err(FunctionError::EmptyEnv(name)),
    }
}

fn env_default(_: &TemplateEngine, _: &Scope<'_>, args: Vec<Value>) -> Result<Value, FunctionError> {
    let [name, fallback] = exact("envDefault", args)?;
    match std::env::var(name.to_text()) {
        Ok(v) if !v.is_empty() => Ok(Value::String(v)),
        _ => Ok(fallback),
    }
}

fn default(_: &TemplateEngine, _: &Scope<'_>, args: Vec<Value>) -> Result<Value, FunctionError> {
    let [value, fallback] = exact("default", args)?;
    Ok(if is_empty_text(&value) { fallback } else { value })
}

fn default_index(_: &TemplateEngine, _: &Scope<'_>, args: Vec<Value>) -> Result<Value, FunctionError> {
    let [map, key, fallback] = exact("defaultIndex", args)?;
    match map {
        Value::Null => Ok(fallback),
        Value::Map(m) => Ok(m.get(&key.to_text()).cloned().unwrap_or(fallback)),
        other => Err(FunctionError::Argument {
            name: "defaultIndex",
            message: format!("expected a map, got {}", other.type_name()),
        }),
    }
}

// ============================================================================
// String transforms
// ============================================================================

/// Pads every line after the first by `n` levels of two spaces.
fn indent(_: &TemplateEngine, _: &Scope<'_>, args: Vec<Value>) -> Result<Value, FunctionError> {
    let [n, text] = exact("indent", args)?;
    let levels = integer("indent", &n)?;
    let levels = usize::try_from(levels).map_err(|_| FunctionError::Argument {
        name: "indent",
        message: format!("negative indent {levels}"),
    })?;
    let pad = "  ".repeat(levels);
    Ok(Value::String(text.to_text().replace('\n', &format!("\n{pad}"))))
}

fn quote(_: &TemplateEngine, _: &Scope<'_>, args: Vec<Value>) -> Result<Value, FunctionError> {
    let parts: Vec<String> = args.iter().filter(|v| !v.is_null()).map(Value::to_text).collect();
    Ok(Value::String(format!("'{}'", parts.join(" "))))
}

fn quote_all(_: &TemplateEngine, _: &Scope<'_>, args: Vec<Value>) -> Result<Value, FunctionError> {
    let parts: Vec<String> = args
        .iter()
        .filter(|v| !v.is_null())
        .map(|v| format!("'{}'", v.to_text()))
        .collect();
    Ok(Value::String(parts.join(" ")))
}

fn replace(_: &TemplateEngine, _: &Scope<'_>, args: Vec<Value>) -> Result<Value, FunctionError> {
    let [old, new, text] = exact("replace", args)?;
    Ok(Value::String(text.to_text().replace(&old.to_text(), &new.to_text())))
}

fn base64(_: &TemplateEngine, _: &Scope<'_>, args: Vec<Value>) -> Result<Value, FunctionError> {
    let [text] = exact("base64", args)?;
    Ok(Value::String(STANDARD.encode(text.to_text())))
}

fn to_yaml(_: &TemplateEngine, _: &Scope<'_>, args: Vec<Value>) -> Result<Value, FunctionError> {
    let [value] = exact("toYaml", args)?;
    let out = serde_yaml_ng::to_string(&value).map_err(|e| FunctionError::Encode {
        format: "yaml",
        message: e.to_string(),
    })?;
    Ok(Value::String(out.trim_end_matches('\n').to_string()))
}

fn to_json(_: &TemplateEngine, _: &Scope<'_>, args: Vec<Value>) -> Result<Value, FunctionError> {
    let [value] = exact("toJson", args)?;
    let out = serde_json::to_string(&value).map_err(|e| FunctionError::Encode {
        format: "json",
        message: e.to_string(),
    })?;
    Ok(Value::String(out))
}

// ============================================================================
// External lookups
// ============================================================================

fn git_info(engine: &TemplateEngine, _: &Scope<'_>, args: Vec<Value>) -> Result<Value, FunctionError> {
    let [action] = exact("git", args)?;
    git::query(engine.executor(), engine.git_dir(), &action.to_text()).map(Value::String)
}

fn file(engine: &TemplateEngine, scope: &Scope<'_>, args: Vec<Value>) -> Result<Value, FunctionError> {
    let [path] = exact("file", args)?;
    engine.include(&path.to_text(), scope).map(Value::String)
}

/// Item ids and field names may carry their own expressions.
fn secret_param(engine: &TemplateEngine, scope: &Scope<'_>, v: &Value) -> Result<String, FunctionError> {
    let text = v.to_text();
    if !text.contains(super::parse::OPEN) {
        return Ok(text);
    }
    engine
        .render_at(&text, scope.vars, scope.mode, scope.depth + 1)
        .map_err(|e| FunctionError::Argument {
            name: "op",
            message: e.to_string(),
        })
}

fn op(engine: &TemplateEngine, scope: &Scope<'_>, args: Vec<Value>) -> Result<Value, FunctionError> {
    let [account, vault, item, field] = exact("op", args)?;
    let item = secret_param(engine, scope, &item)?;
    let field = secret_param(engine, scope, &field)?;
    let value = engine
        .secrets()
        .field(&account.to_text(), &vault.to_text(), &item, &field)?;
    Ok(Value::String(value))
}

fn op_doc(engine: &TemplateEngine, scope: &Scope<'_>, args: Vec<Value>) -> Result<Value, FunctionError> {
    let [account, vault, item] = exact("opDoc", args)?;
    let item = secret_param(engine, scope, &item)?;
    let value = engine
        .secrets()
        .document(&account.to_text(), &vault.to_text(), &item)?;
    Ok(Value::String(value))
}
