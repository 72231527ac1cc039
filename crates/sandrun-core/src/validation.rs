//! Payload validation performed before any container is created
//!
//! Each deny-list entry pairs a rule name with the regex that triggers it. The
//! rule name is reported back in the rejection. Isolation is still the
//! container's job; these rules only screen out obvious abuse.

use crate::core_types::ExecutionKind;
use crate::errors::{SandboxError, ValidationError};
use regex::Regex;

/// Rules applied to every request kind.
pub const COMMON_DENY_LIST: &[(&str, &str)] = &[
    ("recursive-root-delete", r"\brm\s+(-{1,2}[\w-]+\s+)*/\*?(\s|;|&|\||$)"),
    ("fork-bomb", r":\s*\(\s*\)\s*\{[^}]*:\s*\|\s*:"),
    ("raw-device-write", r"(>|\bof=)\s*/dev/(sd|hd|nvme|xvd|vd|mmcblk)"),
    ("filesystem-format", r"\bmkfs(\.\w+)?\b"),
    ("container-socket", r"/(var/)?run/(docker|containerd/containerd)\.sock"),
];

/// Shell metacharacter injection patterns, applied to shell commands only.
pub const SHELL_DENY_LIST: &[(&str, &str)] = &[
    ("command-substitution", r"\$\("),
    ("backtick-substitution", r"`"),
    ("process-substitution", r"[<>]\("),
    ("pipe-to-shell", r"\|\s*(sudo\s+)?(ba|z|da|k)?sh\b"),
    ("privilege-escalation", r"(^|[;&|]\s*)(sudo|su|doas)\b"),
];

struct DenyRule {
    name: String,
    pattern: Regex,
}

pub struct PayloadValidator {
    max_payload_bytes: usize,
    common: Vec<DenyRule>,
    shell: Vec<DenyRule>,
}

impl PayloadValidator {
    pub fn new(max_payload_bytes: usize, extra_patterns: &[String]) -> Result<Self, SandboxError> {
        let mut common = compile_rules(COMMON_DENY_LIST)?;
        for (index, pattern) in extra_patterns.iter().enumerate() {
            let compiled = Regex::new(pattern).map_err(|e| {
                SandboxError::ConfigError(format!("Invalid deny pattern '{}': {}", pattern, e))
            })?;
            common.push(DenyRule {
                name: format!("configured-{}", index),
                pattern: compiled,
            });
        }

        Ok(Self {
            max_payload_bytes,
            common,
            shell: compile_rules(SHELL_DENY_LIST)?,
        })
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    pub fn validate(&self, kind: ExecutionKind, payload: &str) -> Result<(), ValidationError> {
        // Size first so oversized payloads never reach the regex engine.
        if payload.len() > self.max_payload_bytes {
            return Err(ValidationError::TooLarge {
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }

        if payload.trim().is_empty() {
            return Err(ValidationError::Empty);
        }

        if payload.contains('\0') {
            return Err(ValidationError::NullByte);
        }

        let rules = self
            .common
            .iter()
            .chain(self.shell.iter().filter(|_| kind.is_shell()));

        for rule in rules {
            if rule.pattern.is_match(payload) {
                return Err(ValidationError::Prohibited {
                    rule: rule.name.clone(),
                });
            }
        }

        Ok(())
    }
}

fn compile_rules(table: &[(&str, &str)]) -> Result<Vec<DenyRule>, SandboxError> {
    table
        .iter()
        .map(|(name, pattern)| {
            Regex::new(pattern)
                .map(|pattern| DenyRule {
                    name: name.to_string(),
                    pattern,
                })
                .map_err(|e| {
                    SandboxError::ConfigError(format!("Invalid built-in rule '{}': {}", name, e))
                })
        })
        .collect()
}
