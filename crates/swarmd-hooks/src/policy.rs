//! Tool policy rules.
//!
//! Incoming `(tool, params)` payloads are lifted into tagged
//! [`ToolInvocation`] variants at the boundary; anything unrecognized is
//! carried as `Opaque` and passed through (it still gets hashed for the
//! validation cache). Rule tiers, cheapest first: an aho-corasick scan for
//! destructive command substrings, regex rewrites (strip `sudo`), a warn
//! list for heavyweight operations, and a system-path write block.

use aho_corasick::AhoCorasick;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HookError, HookResult};

/// Command substrings that are always denied.
const DENY_SUBSTRINGS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "rm -fr /",
    "mkfs",
    "dd if=/dev/zero of=/dev/",
    ":(){ :|:& };:",
    "> /dev/sda",
    "chmod -r 777 /",
    "shutdown -h",
    "reboot now",
];

/// Command substrings that are allowed with a warning attached.
const WARN_SUBSTRINGS: &[&str] = &[
    "dd if=",
    "tar -c",
    "find / ",
    "du -a /",
    "rsync -a /",
];

/// Path prefixes that must never be written by a specialist.
const PROTECTED_PREFIXES: &[&str] = &[
    "/etc", "/usr", "/bin", "/sbin", "/boot", "/sys", "/proc", "/dev", "/lib",
];

// ---------------------------------------------------------------------------
// Tagged tool invocations
// ---------------------------------------------------------------------------

/// A tool call lifted out of its dynamic RPC payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    /// Shell command execution.
    Bash { command: String },
    /// File write with a target path.
    FileWrite { path: String },
    /// File read with a target path.
    FileRead { path: String },
    /// Anything else: passed through opaquely.
    Opaque { tool: String, params: Value },
}

impl ToolInvocation {
    /// Classify a raw `(tool, params)` pair.
    pub fn classify(tool: &str, params: &Value) -> Self {
        match tool {
            "bash" | "shell" | "exec" => {
                let command = params
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Self::Bash { command }
            }
            "write" | "file_write" | "edit" => {
                let path = params
                    .get("file_path")
                    .or_else(|| params.get("path"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Self::FileWrite { path }
            }
            "read" | "file_read" => {
                let path = params
                    .get("file_path")
                    .or_else(|| params.get("path"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Self::FileRead { path }
            }
            other => Self::Opaque {
                tool: other.to_string(),
                params: params.clone(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Outcome of a pre-tool policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Rewritten params when a rewrite rule fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
            modified: None,
            warnings: Vec::new(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
            modified: None,
            warnings: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Compiled rule set evaluated for every pre-tool hook.
pub struct HookPolicy {
    deny: AhoCorasick,
    warn: AhoCorasick,
    sudo: Regex,
}

impl HookPolicy {
    pub fn new() -> HookResult<Self> {
        let deny = AhoCorasick::new(DENY_SUBSTRINGS).map_err(|e| HookError::InvalidPattern {
            pattern: "deny list".into(),
            reason: e.to_string(),
        })?;
        let warn = AhoCorasick::new(WARN_SUBSTRINGS).map_err(|e| HookError::InvalidPattern {
            pattern: "warn list".into(),
            reason: e.to_string(),
        })?;
        let sudo = Regex::new(r"(?m)^\s*sudo\s+").map_err(|e| HookError::InvalidPattern {
            pattern: "sudo rewrite".into(),
            reason: e.to_string(),
        })?;
        Ok(Self { deny, warn, sudo })
    }

    /// Evaluate the pre-tool policy for a raw `(tool, params)` pair.
    pub fn evaluate(&self, tool: &str, params: &Value) -> Decision {
        match ToolInvocation::classify(tool, params) {
            ToolInvocation::Bash { command } => self.evaluate_command(&command, params),
            ToolInvocation::FileWrite { path } => self.evaluate_write(&path),
            ToolInvocation::FileRead { .. } | ToolInvocation::Opaque { .. } => Decision::allow(),
        }
    }

    fn evaluate_command(&self, command: &str, params: &Value) -> Decision {
        let lowered = command.to_lowercase();

        if let Some(m) = self.deny.find(&lowered) {
            let matched = &lowered[m.start()..m.end()];
            return Decision::deny(format!(
                "dangerous command blocked: matched `{matched}`"
            ));
        }

        let mut decision = Decision::allow();

        // Rewrite tier: specialists never get elevation; strip it and let
        // the command run unprivileged.
        if self.sudo.is_match(command) {
            let stripped = self.sudo.replace_all(command, "").into_owned();
            let mut modified = params.clone();
            if let Some(object) = modified.as_object_mut() {
                object.insert("command".to_string(), Value::String(stripped));
            }
            decision.modified = Some(modified);
            decision
                .warnings
                .push("sudo stripped from command".to_string());
        }

        if let Some(m) = self.warn.find(&lowered) {
            let matched = &lowered[m.start()..m.end()];
            decision
                .warnings
                .push(format!("large file operation: `{matched}`"));
        }

        decision
    }

    fn evaluate_write(&self, path: &str) -> Decision {
        for prefix in PROTECTED_PREFIXES {
            if path == *prefix || path.starts_with(&format!("{prefix}/")) {
                return Decision::deny(format!("write to protected system path {path}"));
            }
        }
        Decision::allow()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> HookPolicy {
        HookPolicy::new().unwrap()
    }

    #[test]
    fn destructive_command_is_denied() {
        let decision = policy().evaluate("bash", &json!({"command": "rm -rf /"}));
        assert!(!decision.allow);
        assert!(decision.reason.unwrap().contains("dangerous"));
    }

    #[test]
    fn deny_is_case_insensitive() {
        let decision = policy().evaluate("bash", &json!({"command": "RM -RF / --no-preserve-root"}));
        assert!(!decision.allow);
    }

    #[test]
    fn sudo_is_stripped_not_denied() {
        let decision = policy().evaluate("bash", &json!({"command": "sudo apt-get update"}));
        assert!(decision.allow);
        let modified = decision.modified.unwrap();
        assert_eq!(modified["command"], "apt-get update");
        assert!(decision.warnings.iter().any(|w| w.contains("sudo")));
    }

    #[test]
    fn large_operations_warn_but_allow() {
        let decision = policy().evaluate(
            "bash",
            &json!({"command": "dd if=/tmp/image.iso of=/tmp/copy.iso"}),
        );
        assert!(decision.allow);
        assert!(!decision.warnings.is_empty());
    }

    #[test]
    fn system_path_writes_blocked() {
        let decision = policy().evaluate("write", &json!({"file_path": "/etc/passwd"}));
        assert!(!decision.allow);
        assert!(decision.reason.unwrap().contains("protected"));

        // Paths that merely share a prefix string are fine.
        let decision = policy().evaluate("write", &json!({"file_path": "/etcetera/notes.txt"}));
        assert!(decision.allow);
    }

    #[test]
    fn workspace_writes_allowed() {
        let decision = policy().evaluate("write", &json!({"file_path": "/home/worker/src/main.rs"}));
        assert!(decision.allow);
        assert!(decision.warnings.is_empty());
    }

    #[test]
    fn unknown_tools_pass_through() {
        let decision = policy().evaluate("telemetry", &json!({"anything": [1, 2, 3]}));
        assert!(decision.allow);
        assert!(decision.modified.is_none());
    }

    #[test]
    fn classification_is_tagged() {
        assert_eq!(
            ToolInvocation::classify("bash", &json!({"command": "ls"})),
            ToolInvocation::Bash {
                command: "ls".into()
            }
        );
        assert!(matches!(
            ToolInvocation::classify("custom", &json!({})),
            ToolInvocation::Opaque { .. }
        ));
    }
}
