//! Secret providers and the per-run secret cache.
//!
//! Templates resolve secrets by `(account, vault, item)` plus a field name.
//! The cache is created once per run and handed to every render, so a
//! secret referenced many times costs one provider round trip, and two runs
//! in one process never share resolved values.

use crate::core::error::SecretError;
use crate::runner::CancelToken;
use crate::transport::Executor;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::debug;

/// Fields of one secret item, keyed by label.
pub type SecretFields = BTreeMap<String, String>;

type SecretKey = (String, String, String);

/// Backend capable of resolving secret items and documents.
pub trait SecretProvider: Send + Sync {
    fn item(&self, account: &str, vault: &str, item: &str) -> Result<SecretFields, SecretError>;

    fn document(&self, account: &str, vault: &str, item: &str) -> Result<String, SecretError>;
}

/// Memoizes provider lookups for the lifetime of one run.
pub struct SecretCache {
    provider: Box<dyn SecretProvider>,
    items: Mutex<HashMap<SecretKey, SecretFields>>,
    documents: Mutex<HashMap<SecretKey, String>>,
}

impl SecretCache {
    pub fn new(provider: impl SecretProvider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
            items: Mutex::new(HashMap::new()),
            documents: Mutex::new(HashMap::new()),
        }
    }

    /// One field of an item. A missing field is `SecretNotFound`.
    pub fn field(
        &self,
        account: &str,
        vault: &str,
        item: &str,
        field: &str,
    ) -> Result<String, SecretError> {
        let key = (account.to_string(), vault.to_string(), item.to_string());
        let mut items = lock(&self.items);
        if !items.contains_key(&key) {
            debug!(account, vault, item, "fetching secret item");
            let fields = self.provider.item(account, vault, item)?;
            items.insert(key.clone(), fields);
        }
        items
            .get(&key)
            .and_then(|fields| fields.get(field))
            .cloned()
            .ok_or_else(|| SecretError::SecretNotFound {
                vault: vault.to_string(),
                item: item.to_string(),
                field: Some(field.to_string()),
            })
    }

    /// Content of a document item.
    pub fn document(&self, account: &str, vault: &str, item: &str) -> Result<String, SecretError> {
        let key = (account.to_string(), vault.to_string(), item.to_string());
        let mut documents = lock(&self.documents);
        if let Some(doc) = documents.get(&key) {
            return Ok(doc.clone());
        }
        debug!(account, vault, item, "fetching secret document");
        let doc = self.provider.document(account, vault, item)?;
        documents.insert(key, doc.clone());
        Ok(doc)
    }

    /// Number of distinct secrets resolved so far.
    pub fn len(&self) -> usize {
        lock(&self.items).len() + lock(&self.documents).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// 1Password CLI
// ============================================================================

const NOT_SIGNED_IN: &str = "You are not currently signed in";

fn is_vault_uuid(s: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-z0-9]{26}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(s))
}

/// Resolves secrets by shelling out to the `op` CLI.
pub struct OnePasswordCli {
    executor: Arc<dyn Executor>,
    cwd: PathBuf,
    verified: Mutex<HashSet<String>>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OpItem {
    vault: OpVault,
    fields: Vec<OpField>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OpVault {
    id: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OpField {
    label: String,
    value: serde_json::Value,
    section: Option<OpSection>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OpSection {
    label: String,
}

impl OpField {
    /// `section.label` for fields in a labelled section, the bare label otherwise.
    fn key(&self) -> String {
        let label = if self.label == "notesPlain" { "notes" } else { &self.label };
        match self.section.as_ref().filter(|s| !s.label.is_empty()) {
            Some(section) => format!("{}.{label}", section.label),
            None => label.to_string(),
        }
    }
}

impl OnePasswordCli {
    pub fn new(executor: Arc<dyn Executor>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            cwd: cwd.into(),
            verified: Mutex::new(HashSet::new()),
        }
    }

    fn non_interactive() -> bool {
        let set = |k: &str| std::env::var(k).is_ok_and(|v| !v.is_empty());
        set("OP_SERVICE_ACCOUNT_TOKEN") || (set("OP_CONNECT_HOST") && set("OP_CONNECT_TOKEN"))
    }

    /// Check the account session once per account.
    fn ensure_signed_in(&self, account: &str) -> Result<(), SecretError> {
        if Self::non_interactive() || lock(&self.verified).contains(account) {
            return Ok(());
        }
        let args = strings(&["op", "account", "get", "--account", account]);
        let out = self.call(&args)?;
        if !out.success() {
            return Err(SecretError::AuthenticationRequired {
                account: account.to_string(),
            });
        }
        lock(&self.verified).insert(account.to_string());
        Ok(())
    }

    fn call(&self, args: &[String]) -> Result<crate::transport::ExecOutput, SecretError> {
        self.executor
            .execute(args, &self.cwd, &CancelToken::new())
            .map_err(|e| SecretError::Provider {
                message: e.to_string(),
            })
    }

    fn fetch(&self, args: &[String], account: &str, vault: &str, item: &str) -> Result<String, SecretError> {
        self.ensure_signed_in(account)?;
        let out = self.call(args)?;
        if out.success() {
            return Ok(out.output);
        }
        if out.output.contains(NOT_SIGNED_IN) {
            Err(SecretError::AuthenticationRequired {
                account: account.to_string(),
            })
        } else if out.output.contains("isn't an item") || out.output.contains("not found") {
            Err(SecretError::SecretNotFound {
                vault: vault.to_string(),
                item: item.to_string(),
                field: None,
            })
        } else {
            Err(SecretError::Provider {
                message: out.output.trim().to_string(),
            })
        }
    }
}

impl SecretProvider for OnePasswordCli {
    fn item(&self, account: &str, vault: &str, item: &str) -> Result<SecretFields, SecretError> {
        let args = strings(&[
            "op", "item", "get", item, "--vault", vault, "--account", account, "--format", "json",
        ]);
        let raw = self.fetch(&args, account, vault, item)?;
        let parsed: OpItem = serde_json::from_str(&raw).map_err(|e| SecretError::Provider {
            message: format!("failed to decode item {item}: {e}"),
        })?;
        if is_vault_uuid(vault) && parsed.vault.id != vault {
            return Err(SecretError::Provider {
                message: format!("wrong vault {vault} for item {item}"),
            });
        }
        Ok(parsed
            .fields
            .into_iter()
            .map(|f| {
                let key = f.key();
                let value = match f.value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect())
    }

    fn document(&self, account: &str, vault: &str, item: &str) -> Result<String, SecretError> {
        let args = strings(&["op", "document", "get", item, "--vault", vault, "--account", account]);
        let raw = self.fetch(&args, account, vault, item)?;
        Ok(raw.trim_matches('\n').to_string())
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
