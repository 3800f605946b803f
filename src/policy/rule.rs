//! Argument rules and policy-driven argument defaults.

use std::path::{Component, Path};

use chrono::{DateTime, Utc};

use crate::config::{OutputConfig, RuleConfig};
use crate::parse::{OptionGrammar, ParsedCommand};

/// What an [`ArgumentRule`] checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    /// An option (any spelling) or an exact raw token that must not appear.
    ForbiddenPattern { pattern: String },
    /// When `flag` is present, its value must start with `prefix` and must
    /// not climb out of it with `..`.
    RequiredPathPrefix { flag: String, prefix: String },
    /// `flag` may only appear together with a value.
    ForbiddenWhenBare { flag: String },
    /// Read-only subcommand gate for `<program> <object> <verb> ...` tools.
    SubcommandAllowlist {
        objects: Vec<String>,
        verbs: Vec<String>,
        forbidden: Vec<String>,
    },
}

/// A single constraint on a parsed argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentRule {
    pub kind: RuleKind,
    /// Surfaced to the caller on denial.
    pub message: String,
}

impl ArgumentRule {
    pub fn new(kind: RuleKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Expand one configured rule into runtime rules.
    /// A `forbidden_pattern` entry with several patterns becomes one rule
    /// per pattern, keeping their declared order.
    pub fn from_config(config: &RuleConfig) -> Vec<Self> {
        match config {
            RuleConfig::ForbiddenPattern { patterns, message } => patterns
                .iter()
                .map(|p| {
                    Self::new(
                        RuleKind::ForbiddenPattern { pattern: p.clone() },
                        message.as_str(),
                    )
                })
                .collect(),
            RuleConfig::RequiredPathPrefix {
                flag,
                prefix,
                message,
            } => vec![Self::new(
                RuleKind::RequiredPathPrefix {
                    flag: flag.clone(),
                    prefix: prefix.clone(),
                },
                message.as_str(),
            )],
            RuleConfig::ForbiddenWhenBare { flag, message } => vec![Self::new(
                RuleKind::ForbiddenWhenBare { flag: flag.clone() },
                message.as_str(),
            )],
            RuleConfig::SubcommandAllowlist {
                objects,
                verbs,
                forbidden,
                message,
            } => vec![Self::new(
                RuleKind::SubcommandAllowlist {
                    objects: objects.clone(),
                    verbs: verbs.clone(),
                    forbidden: forbidden.clone(),
                },
                message.as_str(),
            )],
        }
    }

    /// Check the rule against a parsed command.
    /// Returns the denial reason when the rule is violated.
    pub fn violation(&self, cmd: &ParsedCommand, grammar: &OptionGrammar) -> Option<String> {
        let detail = match &self.kind {
            RuleKind::ForbiddenPattern { pattern } => forbidden_pattern(cmd, grammar, pattern)?,
            RuleKind::RequiredPathPrefix { flag, prefix } => {
                let flag = grammar.canonical(flag);
                cmd.occurrences(&flag)
                    .filter_map(|o| o.value.as_deref())
                    .find(|v| !within_prefix(v, prefix))
                    .map(|v| format!("{flag} {v}"))?
            }
            RuleKind::ForbiddenWhenBare { flag } => {
                let flag = grammar.canonical(flag);
                if !cmd.is_bare(&flag) {
                    return None;
                }
                format!("{flag} without a value")
            }
            RuleKind::SubcommandAllowlist {
                objects,
                verbs,
                forbidden,
            } => subcommand(cmd, objects, verbs, forbidden)?,
        };
        Some(format!("{}: {detail}", self.message))
    }
}

fn forbidden_pattern(cmd: &ParsedCommand, grammar: &OptionGrammar, pattern: &str) -> Option<String> {
    if pattern.len() > 1 && pattern.starts_with('-') {
        let canonical = grammar.canonical(pattern);
        let as_option = cmd.has_option(&canonical) || cmd.has_option(pattern);
        let long_inline = format!("{pattern}=");
        let as_token = cmd
            .tokens()
            .iter()
            .any(|t| t == pattern || (pattern.starts_with("--") && t.starts_with(&long_inline)));
        return (as_option || as_token).then(|| format!("'{pattern}'"));
    }
    cmd.has_token(pattern).then(|| format!("'{pattern}'"))
}

/// Whether `value` lies under `prefix` without any `..` component.
fn within_prefix(value: &str, prefix: &str) -> bool {
    value.starts_with(prefix)
        && !Path::new(value)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
}

fn subcommand(
    cmd: &ParsedCommand,
    objects: &[String],
    verbs: &[String],
    forbidden: &[String],
) -> Option<String> {
    let operands = cmd.operands();
    if let Some(verb) = operands.iter().find(|w| forbidden.contains(*w)) {
        return Some(format!("mutating verb '{verb}'"));
    }
    let object = operands.first()?;
    if !objects.is_empty() && !objects.contains(object) {
        return Some(format!("unsupported object '{object}'"));
    }
    match operands.get(1) {
        Some(verb) if !verbs.is_empty() && !verbs.contains(verb) => {
            Some(format!("'{object} {verb}' is not a read-only form"))
        }
        _ => None,
    }
}

/// A `(flag, value)` pair injected when the caller omits `flag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultArgument {
    pub flag: String,
    pub value: String,
}

/// Safe default output file injected when the caller omits the output flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDirective {
    pub flag: String,
    pub directory: String,
    pub file_template: String,
}

impl OutputDirective {
    pub fn from_config(config: &OutputConfig) -> Self {
        Self {
            flag: config.flag.clone(),
            directory: config.directory.clone(),
            file_template: config.file_template.clone(),
        }
    }

    /// Render the output path for a node at a given submission time.
    pub fn render(&self, node: &str, at: DateTime<Utc>) -> String {
        let file = self
            .file_template
            .replace("{node}", &sanitize_component(node))
            .replace("{timestamp}", &at.format("%Y%m%d-%H%M%S").to_string());
        if self.directory.ends_with('/') {
            format!("{}{file}", self.directory)
        } else {
            format!("{}/{file}", self.directory)
        }
    }
}

/// Restrict a value used inside a file name to `[A-Za-z0-9._-]`.
fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    // A name made only of dots would still be a path component
    if cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}
