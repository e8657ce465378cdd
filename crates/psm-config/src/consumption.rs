//! Consumed-key registry and unused-key guard.
//!
//! Each command lists the JSON-pointer prefixes it actually reads. A leaf
//! outside every consumed prefix is reported as unused; callers choose
//! whether that warns or fails.

use std::collections::BTreeSet;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnusedKeyReport {
    pub command: String,
    /// Consumed JSON-pointer prefixes used for this analysis (sorted, unique).
    pub consumed_prefixes: Vec<String>,
    /// Unused leaf pointers (sorted).
    pub unused_leaf_pointers: Vec<String>,
}

impl UnusedKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unused_leaf_pointers.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigCommand {
    Import,
    Sync,
    Cleanup,
    Serve,
}

impl ConfigCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigCommand::Import => "IMPORT",
            ConfigCommand::Sync => "SYNC",
            ConfigCommand::Cleanup => "CLEANUP",
            ConfigCommand::Serve => "SERVE",
        }
    }
}

/// Must list only what the command reads today.
pub fn consumed_pointers_for_command(cmd: ConfigCommand) -> &'static [&'static str] {
    match cmd {
        ConfigCommand::Import => &["/tenant/tenant_id", "/ingest/identity_fields", "/database"],
        ConfigCommand::Sync => &["/tenant/tenant_id", "/ingest/identity_fields", "/database"],
        ConfigCommand::Cleanup => &["/tenant/tenant_id", "/retention/snapshot_days", "/database"],
        ConfigCommand::Serve => &[
            "/tenant/tenant_id",
            "/ingest/identity_fields",
            "/retention/snapshot_days",
            "/database",
        ],
    }
}

/// Leaves of `config_json` outside every prefix `cmd` consumes.
///
/// `Warn` always returns the report; `Fail` turns a non-clean report into a
/// `CONFIG_UNUSED_KEYS` error.
pub fn report_unused_keys(
    cmd: ConfigCommand,
    config_json: &Value,
    policy: UnusedKeyPolicy,
) -> Result<UnusedKeyReport> {
    let consumed: BTreeSet<&str> = consumed_pointers_for_command(cmd).iter().copied().collect();

    let unused: BTreeSet<String> = crate::leaves(config_json)
        .into_iter()
        .map(|(pointer, _)| pointer)
        .filter(|leaf| !consumed.iter().any(|prefix| consumes(prefix, leaf)))
        .collect();

    let report = UnusedKeyReport {
        command: cmd.as_str().to_string(),
        consumed_prefixes: consumed.iter().map(|p| p.to_string()).collect(),
        unused_leaf_pointers: unused.into_iter().collect(),
    };

    if policy == UnusedKeyPolicy::Fail && !report.is_clean() {
        let shown: Vec<&str> = report
            .unused_leaf_pointers
            .iter()
            .take(PREVIEW)
            .map(String::as_str)
            .collect();
        bail!(
            "CONFIG_UNUSED_KEYS (command={}): {} key(s) not read by this command: {}",
            report.command,
            report.unused_leaf_pointers.len(),
            shown.join(", ")
        );
    }

    Ok(report)
}

const PREVIEW: usize = 12;

/// "/a/b" consumes "/a/b" and "/a/b/c" but not "/a/bc".
fn consumes(prefix: &str, leaf: &str) -> bool {
    prefix == "/"
        || leaf
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_respects_segment_boundary() {
        assert!(consumes("/database", "/database/url_env"));
        assert!(!consumes("/database", "/databases/x"));
        assert!(consumes("/", "/anything"));
    }

    #[test]
    fn empty_config_is_clean() {
        let report =
            report_unused_keys(ConfigCommand::Sync, &serde_json::json!({}), UnusedKeyPolicy::Fail)
                .unwrap();
        assert!(report.is_clean());
    }
}
