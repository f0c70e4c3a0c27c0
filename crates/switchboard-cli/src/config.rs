use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use switchboard_core::{
    AgentInfo, AgentRole, CommunicationMatrix, MessagePriority, MessageType, PrefixContent,
    RoutingRule, StrategyKind, default_matrix,
};
use switchboard_scheduler::SchedulerConfig;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub cooperation: CooperationSection,
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixSection>,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window: usize,
}

fn default_tick_interval_ms() -> u64 {
    100
}
fn default_max_concurrent_deliveries() -> usize {
    16
}
fn default_dedupe_window() -> usize {
    4096
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
            dedupe_window: default_dedupe_window(),
        }
    }
}

impl SchedulerSection {
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            max_concurrent_deliveries: self.max_concurrent_deliveries,
            dedupe_window: self.dedupe_window,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooperationSection {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_round_interval_ms")]
    pub round_interval_ms: u64,
    /// Task used by `switchboard run` when none is given on the command line
    #[serde(default)]
    pub initial_message: String,
}

fn default_max_rounds() -> u32 {
    10
}
fn default_event_capacity() -> usize {
    256
}
fn default_round_interval_ms() -> u64 {
    1000
}

impl Default for CooperationSection {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            strategy: StrategyKind::default(),
            event_capacity: default_event_capacity(),
            round_interval_ms: default_round_interval_ms(),
            initial_message: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSection {
    /// Install the stock user/error copy rules before the configured ones
    #[serde(default = "default_true")]
    pub default_rules: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            default_rules: true,
        }
    }
}

/// Role table override. When absent the stock table is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixSection {
    #[serde(default)]
    pub universal: Vec<AgentRole>,
    #[serde(default)]
    pub allow: Vec<AllowEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowEntry {
    pub role: AgentRole,
    #[serde(default)]
    pub talks_to: Vec<AgentRole>,
}

impl MatrixSection {
    pub fn to_matrix(&self) -> CommunicationMatrix {
        let mut matrix = CommunicationMatrix::empty();
        for role in &self.universal {
            matrix = matrix.with_universal(*role);
        }
        for entry in &self.allow {
            matrix = matrix.allow(entry.role, &entry.talks_to);
        }
        matrix
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub role: AgentRole,
}

impl AgentEntry {
    pub fn to_info(&self) -> AgentInfo {
        let name = if self.name.is_empty() { &self.id } else { &self.name };
        AgentInfo::new(self.id.clone(), name.clone(), self.role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_role: Option<AgentRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_role: Option<AgentRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_target_role: Option<AgentRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_target_id: Option<String>,
    #[serde(default)]
    pub intercept_original: bool,
    /// Prepended to the content of forwarded copies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_prefix: Option<String>,
}

impl RuleEntry {
    pub fn to_rule(&self) -> RoutingRule {
        let mut rule = RoutingRule::new(self.description.clone())
            .with_id(self.id.clone())
            .with_priority(self.priority)
            .with_keywords(self.keywords.iter().cloned());
        rule.sender_role = self.sender_role;
        rule.receiver_role = self.receiver_role;
        rule.message_type = self.message_type;
        rule.enabled = self.enabled;
        rule.forward_target_role = self.forward_target_role;
        rule.forward_target_id = self.forward_target_id.clone();
        rule.intercept_original = self.intercept_original;
        if let Some(prefix) = &self.content_prefix {
            rule = rule.with_transform(PrefixContent(prefix.clone()));
        }
        rule
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchboard")
}

impl SwitchboardConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `switchboard init` first.",
                path.display()
            )
        })?;

        // Expand environment variables before parsing
        let expanded = expand_env_vars(&content);

        let config: Self = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;

        for (i, agent) in config.agents.iter().enumerate() {
            if config.agents[..i].iter().any(|a| a.id == agent.id) {
                warn!("Agent id '{}' is listed more than once; the last entry wins", agent.id);
            }
        }
        for rule in &config.rules {
            if rule.forward_target_id.is_none()
                && rule.forward_target_role.is_none()
                && !rule.intercept_original
            {
                warn!(
                    "Rule '{}' neither forwards nor intercepts; it only affects priority",
                    if rule.id.is_empty() { &rule.description } else { &rule.id }
                );
            }
        }

        Ok(config)
    }

    pub fn matrix(&self) -> CommunicationMatrix {
        self.matrix
            .as_ref()
            .map(MatrixSection::to_matrix)
            .unwrap_or_else(default_matrix)
    }

    pub fn agent_infos(&self) -> Vec<AgentInfo> {
        self.agents.iter().map(AgentEntry::to_info).collect()
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
const ALLOWED_ENV_VARS: &[&str] = &["SWITCHBOARD_TASK", "SWITCHBOARD_STRATEGY", "HOME", "USER"];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Leave the ${VAR} unexpanded so it's obvious
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_bundled_default_config_parses() {
        let file = write_config(DEFAULT_CONFIG);
        let cfg = SwitchboardConfig::load(&Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.scheduler.tick_interval_ms, 100);
        assert!(cfg.routing.default_rules);
        assert!(!cfg.agents.is_empty());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let file = write_config("");
        let cfg = SwitchboardConfig::load(&Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.cooperation.max_rounds, 10);
        assert_eq!(cfg.cooperation.strategy, StrategyKind::Sequential);
        assert_eq!(cfg.scheduler.max_concurrent_deliveries, 16);
        assert_eq!(cfg.matrix(), default_matrix());
        assert!(cfg.agents.is_empty());
    }

    #[test]
    fn test_sections_and_rules() {
        let file = write_config(
            r#"
[scheduler]
tick_interval_ms = 25

[cooperation]
strategy = "adaptive"
max_rounds = 4

[[agents]]
id = "u"
role = "user"

[[agents]]
id = "c"
name = "Cody"
role = "coder"

[[rules]]
id = "review"
priority = "high"
sender_role = "coder"
keywords = ["done"]
forward_target_role = "reviewer"
content_prefix = "[review] "
"#,
        );
        let cfg = SwitchboardConfig::load(&Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.scheduler.to_scheduler_config().tick_interval, Duration::from_millis(25));
        assert_eq!(cfg.cooperation.strategy, StrategyKind::Adaptive);

        let infos = cfg.agent_infos();
        assert_eq!(infos[0].name, "u");
        assert_eq!(infos[1].name, "Cody");
        assert_eq!(infos[1].role, AgentRole::Coder);

        let rule = cfg.rules[0].to_rule();
        assert_eq!(rule.id, "review");
        assert_eq!(rule.priority, MessagePriority::High);
        assert_eq!(rule.sender_role, Some(AgentRole::Coder));
        assert_eq!(rule.forward_target_role, Some(AgentRole::Reviewer));
        assert!(rule.enabled);
        assert!(rule.transform.is_some());
    }

    #[test]
    fn test_matrix_override() {
        let file = write_config(
            r#"
[matrix]
universal = ["user"]

[[matrix.allow]]
role = "coder"
talks_to = ["tester"]
"#,
        );
        let cfg = SwitchboardConfig::load(&Some(file.path().to_path_buf())).unwrap();
        let matrix = cfg.matrix();
        assert!(matrix.can_communicate(AgentRole::User, AgentRole::Reviewer));
        assert!(matrix.can_communicate(AgentRole::Tester, AgentRole::Coder));
        assert!(!matrix.can_communicate(AgentRole::Orchestrator, AgentRole::Coder));
    }

    #[test]
    fn test_unknown_agent_role_is_custom() {
        let file = write_config(
            r#"
[[agents]]
id = "bard"
role = "poet"
"#,
        );
        let cfg = SwitchboardConfig::load(&Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agents[0].role, AgentRole::Custom);
        assert_eq!(cfg.agent_infos()[0].name, "bard");
    }

    #[test]
    fn test_missing_file_is_error() {
        let missing = Some(PathBuf::from("/nonexistent/switchboard/config.toml"));
        let err = SwitchboardConfig::load(&missing).unwrap_err();
        assert!(err.to_string().contains("switchboard init"));
    }

    #[test]
    fn test_expand_env_vars_allowlist() {
        // SAFETY: test-only, no other test reads this variable
        unsafe { std::env::set_var("SWITCHBOARD_TASK", "write docs") };
        assert_eq!(expand_env_vars("task = \"${SWITCHBOARD_TASK}\""), "task = \"write docs\"");
        assert_eq!(expand_env_vars("x = \"${SECRET_THING}\""), "x = \"${SECRET_THING}\"");
        assert_eq!(expand_env_vars("no vars"), "no vars");
    }
}
