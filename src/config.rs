use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Embedded default configuration.
const DEFAULT_CONFIG: &str = include_str!("../config.default.toml");

/// Errors raised while loading a user configuration overlay.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

// ── Final (merged) config types ──

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Append-only audit file. Supports `~` and `$VAR` expansion.
    #[serde(default)]
    pub audit_log: String,
    #[serde(default)]
    pub mirror: MirrorTarget,
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            audit_log: String::new(),
            mirror: MirrorTarget::default(),
            output_limit_bytes: default_output_limit(),
            kill_grace_secs: default_kill_grace(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_output_limit() -> usize {
    8192
}

fn default_kill_grace() -> u64 {
    5
}

/// Live channel every audit line is mirrored to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorTarget {
    #[default]
    Stdout,
    Stderr,
    None,
}

/// The two mutually exclusive packet-capture policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureProfile {
    /// Packet count allowed; a cap is injected when the caller omits it.
    #[default]
    BoundedCount,
    /// Packet count forbidden; runs are bounded by the timeout only.
    TimedCapture,
}

impl CaptureProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureProfile::BoundedCount => "bounded-count",
            CaptureProfile::TimedCapture => "timed-capture",
        }
    }
}

impl std::str::FromStr for CaptureProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bounded-count" => Ok(CaptureProfile::BoundedCount),
            "timed-capture" => Ok(CaptureProfile::TimedCapture),
            other => Err(format!("unknown capture profile: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub profile: CaptureProfile,
    /// Policy the profile applies to.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub count_flag: String,
    #[serde(default)]
    pub packet_cap: u32,
    #[serde(default)]
    pub default_duration_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            profile: CaptureProfile::default(),
            command: "tcpdump".into(),
            count_flag: "-c".into(),
            packet_cap: 1000,
            default_duration_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub nsenter: String,
    #[serde(default)]
    pub crictl: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            nsenter: "nsenter".into(),
            crictl: "crictl".into(),
        }
    }
}

/// One allowlisted program as written in configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PolicyConfig {
    pub name: String,
    /// Options that consume a value (`-w <path>`, `--exec=<cmd>`).
    #[serde(default)]
    pub value_flags: Vec<String>,
    /// Alternate spellings mapped to their canonical option name.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// Multi-letter options take a single dash (`ip -brief`) and are never
    /// read as short-option clusters.
    #[serde(default)]
    pub single_dash_long: bool,
    /// Long options that take no value. Listing them keeps abbreviated
    /// spellings from resolving to the wrong option.
    #[serde(default)]
    pub long_options: Vec<String>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub default_output: Option<OutputConfig>,
    /// Known risk of allowing this program, logged on every allow.
    #[serde(default)]
    pub risk: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleConfig {
    ForbiddenPattern {
        patterns: Vec<String>,
        message: String,
    },
    RequiredPathPrefix {
        flag: String,
        prefix: String,
        message: String,
    },
    ForbiddenWhenBare {
        flag: String,
        message: String,
    },
    SubcommandAllowlist {
        #[serde(default)]
        objects: Vec<String>,
        #[serde(default)]
        verbs: Vec<String>,
        #[serde(default)]
        forbidden: Vec<String>,
        message: String,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    pub flag: String,
    pub directory: String,
    /// File name template; `{node}` and `{timestamp}` are substituted.
    pub file_template: String,
}

// ── Overlay types (user config that merges with defaults) ──

#[derive(Debug, Deserialize, Default)]
struct ConfigOverlay {
    #[serde(default)]
    settings: SettingsOverlay,
    #[serde(default)]
    capture: CaptureOverlay,
    #[serde(default)]
    execution: ExecutionOverlay,
    /// Replace the default policy set entirely instead of merging.
    #[serde(default)]
    replace_policies: bool,
    #[serde(default)]
    remove_policies: Vec<String>,
    #[serde(default)]
    policies: Vec<PolicyConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct SettingsOverlay {
    log_level: Option<String>,
    audit_log: Option<String>,
    mirror: Option<MirrorTarget>,
    output_limit_bytes: Option<usize>,
    kill_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureOverlay {
    profile: Option<CaptureProfile>,
    command: Option<String>,
    count_flag: Option<String>,
    packet_cap: Option<u32>,
    default_duration_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ExecutionOverlay {
    nsenter: Option<String>,
    crictl: Option<String>,
}

// ── Merge logic ──

/// Merge user policies into the default set, keyed by name.
/// In replace mode: user policies replace the defaults entirely.
/// In merge mode: removals first, then each user policy replaces the
/// default of the same name in place or is appended.
fn merge_policies(
    base: &mut Vec<PolicyConfig>,
    add: Vec<PolicyConfig>,
    remove: &[String],
    replace: bool,
) {
    if replace {
        *base = add;
        return;
    }
    base.retain(|p| !remove.contains(&p.name));
    for policy in add {
        match base.iter_mut().find(|p| p.name == policy.name) {
            Some(existing) => *existing = policy,
            None => base.push(policy),
        }
    }
}

impl Config {
    /// Load the default embedded configuration.
    pub fn default_config() -> Self {
        toml::from_str(DEFAULT_CONFIG).expect("embedded default config must parse")
    }

    /// Load configuration with resolution order:
    /// 1. Start with embedded defaults
    /// 2. Merge `explicit` if given, else ~/.config/node-debug-gate/config.toml (if exists)
    ///
    /// An explicitly named file that cannot be read or parsed is an error;
    /// a broken file at the implicit location is reported and skipped.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default_config();
        match explicit {
            Some(path) => config.apply_overlay(Self::read_overlay(path)?),
            None => {
                if let Some(path) = Self::user_config_path()
                    && path.exists()
                {
                    match Self::read_overlay(&path) {
                        Ok(overlay) => config.apply_overlay(overlay),
                        Err(e) => eprintln!("node-debug-gate: ignoring user config: {e}"),
                    }
                }
            }
        }
        Ok(config)
    }

    fn user_config_path() -> Option<PathBuf> {
        let home = std::env::var_os("HOME")?;
        Some(Path::new(&home).join(".config/node-debug-gate/config.toml"))
    }

    fn read_overlay(path: &Path) -> Result<ConfigOverlay, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply an overlay on top of this config (merge semantics).
    fn apply_overlay(&mut self, overlay: ConfigOverlay) {
        // Settings: scalar overrides
        let s = overlay.settings;
        if let Some(v) = s.log_level {
            self.settings.log_level = v;
        }
        if let Some(v) = s.audit_log {
            self.settings.audit_log = v;
        }
        if let Some(v) = s.mirror {
            self.settings.mirror = v;
        }
        if let Some(v) = s.output_limit_bytes {
            self.settings.output_limit_bytes = v;
        }
        if let Some(v) = s.kill_grace_secs {
            self.settings.kill_grace_secs = v;
        }

        // Capture
        let c = overlay.capture;
        if let Some(v) = c.profile {
            self.capture.profile = v;
        }
        if let Some(v) = c.command {
            self.capture.command = v;
        }
        if let Some(v) = c.count_flag {
            self.capture.count_flag = v;
        }
        if let Some(v) = c.packet_cap {
            self.capture.packet_cap = v;
        }
        if let Some(v) = c.default_duration_secs {
            self.capture.default_duration_secs = v;
        }

        // Execution
        let e = overlay.execution;
        if let Some(v) = e.nsenter {
            self.execution.nsenter = v;
        }
        if let Some(v) = e.crictl {
            self.execution.crictl = v;
        }

        merge_policies(
            &mut self.policies,
            overlay.policies,
            &overlay.remove_policies,
            overlay.replace_policies,
        );
    }

    /// Apply an overlay from a TOML string.
    pub fn apply_overlay_str(&mut self, toml_str: &str) -> Result<(), toml::de::Error> {
        let overlay: ConfigOverlay = toml::from_str(toml_str)?;
        self.apply_overlay(overlay);
        Ok(())
    }

    /// The merged configuration rendered as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Audit file path with `~` and environment variables expanded.
    pub fn audit_log_path(&self) -> Option<PathBuf> {
        if self.settings.audit_log.is_empty() {
            return None;
        }
        let expanded = shellexpand::full(&self.settings.audit_log)
            .map(|p| p.into_owned())
            .unwrap_or_else(|e| {
                log::warn!("cannot expand audit_log path: {e}");
                self.settings.audit_log.clone()
            });
        Some(PathBuf::from(expanded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy<'a>(config: &'a Config, name: &str) -> &'a PolicyConfig {
        config.policies.iter().find(|p| p.name == name).unwrap()
    }

    #[test]
    fn default_config_parses() {
        let config = Config::default_config();
        let names: Vec<&str> = config.policies.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["tcpdump", "ncat", "ip", "ifconfig"]);
        assert!(!config.settings.audit_log.is_empty());
    }

    #[test]
    fn default_profile_is_bounded_count() {
        let config = Config::default_config();
        assert_eq!(config.capture.profile, CaptureProfile::BoundedCount);
        assert_eq!(config.capture.command, "tcpdump");
        assert_eq!(config.capture.packet_cap, 1000);
    }

    #[test]
    fn default_tcpdump_output_directive() {
        let config = Config::default_config();
        let out = policy(&config, "tcpdump").default_output.as_ref().unwrap();
        assert_eq!(out.flag, "-w");
        assert_eq!(out.directory, "/host/var/tmp/");
    }

    #[test]
    fn default_ip_rules_are_ordered() {
        let config = Config::default_config();
        let rules = &policy(&config, "ip").rules;
        assert!(matches!(rules[0], RuleConfig::ForbiddenPattern { .. }));
        assert!(matches!(rules[1], RuleConfig::SubcommandAllowlist { .. }));
    }

    #[test]
    fn ifconfig_carries_risk_note() {
        let config = Config::default_config();
        let ifconfig = policy(&config, "ifconfig");
        assert!(ifconfig.rules.is_empty());
        assert!(ifconfig.risk.is_some());
    }

    // ── Merge semantics ──

    #[test]
    fn overlay_profile_override() {
        let mut config = Config::default_config();
        config
            .apply_overlay_str(
                r#"
            [capture]
            profile = "timed-capture"
        "#,
            )
            .unwrap();
        assert_eq!(config.capture.profile, CaptureProfile::TimedCapture);
        // Untouched scalars keep their defaults
        assert_eq!(config.capture.packet_cap, 1000);
    }

    #[test]
    fn overlay_settings_override() {
        let mut config = Config::default_config();
        config
            .apply_overlay_str(
                r#"
            [settings]
            audit_log = "/tmp/audit.log"
            mirror = "none"
        "#,
            )
            .unwrap();
        assert_eq!(config.settings.audit_log, "/tmp/audit.log");
        assert_eq!(config.settings.mirror, MirrorTarget::None);
        assert_eq!(config.settings.log_level, "info");
    }

    #[test]
    fn overlay_removes_policy() {
        let mut config = Config::default_config();
        config
            .apply_overlay_str(r#"remove_policies = ["ifconfig"]"#)
            .unwrap();
        assert!(!config.policies.iter().any(|p| p.name == "ifconfig"));
        assert_eq!(config.policies.len(), 3);
    }

    #[test]
    fn overlay_adds_policy() {
        let mut config = Config::default_config();
        config
            .apply_overlay_str(
                r#"
            [[policies]]
            name = "ss"
        "#,
            )
            .unwrap();
        assert_eq!(config.policies.last().unwrap().name, "ss");
        assert_eq!(config.policies.len(), 5);
    }

    #[test]
    fn overlay_replaces_policy_in_place() {
        let mut config = Config::default_config();
        config
            .apply_overlay_str(
                r#"
            [[policies]]
            name = "ncat"
            [[policies.rules]]
            kind = "forbidden_pattern"
            patterns = ["-l"]
            message = "no listeners"
        "#,
            )
            .unwrap();
        // Position preserved, content replaced
        assert_eq!(config.policies[1].name, "ncat");
        assert_eq!(
            config.policies[1].rules,
            vec![RuleConfig::ForbiddenPattern {
                patterns: vec!["-l".into()],
                message: "no listeners".into(),
            }]
        );
    }

    #[test]
    fn overlay_replace_policies() {
        let mut config = Config::default_config();
        config
            .apply_overlay_str(
                r#"
            replace_policies = true
            [[policies]]
            name = "ifconfig"
        "#,
            )
            .unwrap();
        assert_eq!(config.policies.len(), 1);
        assert_eq!(config.policies[0].name, "ifconfig");
    }

    #[test]
    fn overlay_policy_lists_do_not_extend_defaults() {
        let mut config = Config::default_config();
        config
            .apply_overlay_str(
                r#"
            [[policies]]
            name = "tcpdump"
            value_flags = ["-i"]
        "#,
            )
            .unwrap();
        let tcpdump = policy(&config, "tcpdump");
        assert_eq!(tcpdump.value_flags, vec!["-i".to_string()]);
        assert!(tcpdump.aliases.is_empty());
        assert!(tcpdump.long_options.is_empty());
        assert!(tcpdump.rules.is_empty());
        assert!(tcpdump.default_output.is_none());
    }

    #[test]
    fn default_policies_list_long_options() {
        let config = Config::default_config();
        assert!(policy(&config, "ncat").long_options.contains(&"--broker".to_string()));
        assert!(policy(&config, "tcpdump").long_options.contains(&"--immediate-mode".to_string()));
        assert_eq!(policy(&config, "ip").aliases.get("-brief").map(String::as_str), Some("-br"));
    }

    #[test]
    fn empty_overlay_changes_nothing() {
        let original = Config::default_config();
        let mut config = Config::default_config();
        config.apply_overlay_str("").unwrap();
        assert_eq!(config.policies.len(), original.policies.len());
        assert_eq!(config.settings.audit_log, original.settings.audit_log);
    }

    #[test]
    fn overlay_rejects_unknown_profile() {
        let mut config = Config::default_config();
        let err = config.apply_overlay_str(
            r#"
            [capture]
            profile = "forever"
        "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn load_explicit_missing_file_is_error() {
        let err = Config::load(Some(Path::new("/nonexistent/node-debug-gate.toml")));
        assert!(matches!(err, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn load_explicit_file_merges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[settings]\nkill_grace_secs = 1\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.settings.kill_grace_secs, 1);
        assert_eq!(config.policies.len(), 4);
    }

    #[test]
    fn audit_path_expands_env() {
        let mut config = Config::default_config();
        config.settings.audit_log = "$HOME/audit.log".into();
        let home = std::env::var("HOME").unwrap_or_default();
        if !home.is_empty() {
            assert_eq!(
                config.audit_log_path().unwrap(),
                PathBuf::from(format!("{home}/audit.log"))
            );
        }
    }

    #[test]
    fn empty_audit_path_is_none() {
        let mut config = Config::default_config();
        config.settings.audit_log.clear();
        assert!(config.audit_log_path().is_none());
    }

    #[test]
    fn dump_round_trips_through_toml() {
        let config = Config::default_config();
        let text = config.to_toml().unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.policies.len(), config.policies.len());
    }
}
