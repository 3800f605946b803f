//! The policy model: one [`CommandPolicy`] per allowlisted program.
//!
//! Anything not in the [`PolicySet`] is denied. The set is built once from
//! configuration and then only read; [`PolicyStore`] swaps whole snapshots
//! so evaluations never observe a half-applied reload.

pub mod rule;

pub use rule::{ArgumentRule, DefaultArgument, OutputDirective, RuleKind};

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::config::{CaptureConfig, CaptureProfile, Config, PolicyConfig, RuleConfig};
use crate::parse::{OptionGrammar, ParsedCommand, parse_arguments};

/// Everything the evaluator needs to know about one allowed program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPolicy {
    pub name: String,
    pub grammar: OptionGrammar,
    /// Checked in order; the first violation decides the denial reason.
    pub rules: Vec<ArgumentRule>,
    pub default_arguments: Vec<DefaultArgument>,
    pub default_output: Option<OutputDirective>,
    /// Applied when the caller gives no timeout.
    pub default_timeout: Option<Duration>,
    /// Known risk of allowing this program.
    pub risk: Option<String>,
}

impl CommandPolicy {
    /// Build a policy from its configuration entry.
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            name: config.name.clone(),
            grammar: OptionGrammar::new(config.value_flags.iter().cloned(), config.aliases.clone())
                .with_single_dash_long(config.single_dash_long)
                .with_long_options(
                    config.long_options.iter().chain(forbidden_options(config)).cloned(),
                ),
            rules: config.rules.iter().flat_map(ArgumentRule::from_config).collect(),
            default_arguments: Vec::new(),
            default_output: config.default_output.as_ref().map(OutputDirective::from_config),
            default_timeout: None,
            risk: config.risk.clone(),
        }
    }

    /// Parse an argument vector with this program's option grammar.
    pub fn parse(&self, args: &[String]) -> ParsedCommand {
        parse_arguments(&self.name, args, &self.grammar)
    }

    /// Apply one of the two packet-capture profiles.
    fn apply_capture_profile(&mut self, capture: &CaptureConfig) {
        let count_flag = self.grammar.canonical(&capture.count_flag);
        match capture.profile {
            CaptureProfile::BoundedCount => {
                self.default_arguments.push(DefaultArgument {
                    flag: count_flag,
                    value: capture.packet_cap.to_string(),
                });
            }
            CaptureProfile::TimedCapture => {
                self.rules.push(ArgumentRule::new(
                    RuleKind::ForbiddenPattern {
                        pattern: count_flag.clone(),
                    },
                    format!(
                        "packet count ({count_flag}) is not allowed in the timed-capture profile; captures are bounded by the timeout"
                    ),
                ));
                self.default_timeout = Some(Duration::from_secs(capture.default_duration_secs));
            }
        }
    }
}

/// Option spellings named by forbidden-pattern rules. An abbreviation of
/// one of these must resolve to it.
fn forbidden_options(config: &PolicyConfig) -> impl Iterator<Item = &String> {
    config
        .rules
        .iter()
        .filter_map(|rule| match rule {
            RuleConfig::ForbiddenPattern { patterns, .. } => Some(patterns),
            _ => None,
        })
        .flatten()
        .filter(|p| p.starts_with('-') && p.len() > 2)
}

/// The full allowlist, in declared order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySet {
    policies: Vec<CommandPolicy>,
    profile: CaptureProfile,
}

impl PolicySet {
    /// Build the policy set from configuration, applying the selected
    /// capture profile to the capture command's policy.
    pub fn from_config(config: &Config) -> Self {
        let mut policies: Vec<CommandPolicy> = Vec::new();
        for entry in &config.policies {
            if policies.iter().any(|p| p.name == entry.name) {
                log::warn!("duplicate policy for {}; keeping the first", entry.name);
                continue;
            }
            let mut policy = CommandPolicy::from_config(entry);
            if policy.name == config.capture.command {
                policy.apply_capture_profile(&config.capture);
            }
            policies.push(policy);
        }
        Self {
            policies,
            profile: config.capture.profile,
        }
    }

    /// Build the set from the embedded default configuration.
    pub fn default_policies() -> Self {
        Self::from_config(&Config::default_config())
    }

    /// Look up a policy by exact program name.
    pub fn lookup(&self, name: &str) -> Option<&CommandPolicy> {
        self.policies.iter().find(|p| p.name == name)
    }

    /// Names of all allowed programs, in declared order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.iter().map(|p| p.name.as_str())
    }

    pub fn profile(&self) -> CaptureProfile {
        self.profile
    }
}

/// Shared holder for the live policy set.
///
/// Readers take an `Arc` snapshot and keep it for the whole evaluation;
/// [`PolicyStore::replace`] installs a complete new set in one step.
#[derive(Debug)]
pub struct PolicyStore {
    current: RwLock<Arc<PolicySet>>,
}

impl PolicyStore {
    pub fn new(policies: PolicySet) -> Self {
        Self {
            current: RwLock::new(Arc::new(policies)),
        }
    }

    /// The current policy snapshot.
    pub fn current(&self) -> Arc<PolicySet> {
        // A poisoned lock still holds a complete snapshot
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*guard)
    }

    /// Swap in a new policy set. In-flight evaluations keep their snapshot.
    pub fn replace(&self, policies: PolicySet) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(policies);
    }
}
