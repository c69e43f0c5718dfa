use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::agent::AgentSpec;

/// The three declarative catalogs loaded at startup: agents, workflows,
/// permissions. Immutable for the process lifetime; reload requires a
/// restart.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Catalogs {
    #[serde(default)]
    pub agents: AgentCatalog,
    #[serde(default)]
    pub workflows: WorkflowCatalog,
    #[serde(default)]
    pub permissions: PermissionsCatalog,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parse error in {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

impl Catalogs {
    /// Load `agents.json`, `workflows.json`, `permissions.json` from a
    /// directory. Missing files fall back to defaults.
    pub fn load_dir(dir: &Path) -> Result<Self, CatalogError> {
        Ok(Self {
            agents: load_or_default(&dir.join("agents.json"))?,
            workflows: load_or_default(&dir.join("workflows.json"))?,
            permissions: load_or_default(&dir.join("permissions.json"))?,
        })
    }
}

fn load_or_default<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> Result<T, CatalogError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| CatalogError::Parse {
        path: path.display().to_string(),
        source,
    })
}

// ── Agents ──

pub const INPUT_VALIDATOR: &str = "input_validator";
pub const TASK_PLANNER: &str = "task_planner";
pub const TOOL_EXECUTOR: &str = "tool_executor";
pub const HUMAN_REVIEWER: &str = "human_reviewer";
pub const RESULT_SYNTHESIZER: &str = "result_synthesizer";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentCatalog {
    pub agents: Vec<AgentSpec>,
}

impl AgentCatalog {
    pub fn get(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Peer roster visible to `name`: every other agent, as
    /// (name, one-line description) pairs. No transitive exposure.
    pub fn roster_for(&self, name: &str) -> Vec<(String, String)> {
        self.agents
            .iter()
            .filter(|a| a.name != name)
            .map(|a| (a.name.clone(), a.description.clone()))
            .collect()
    }
}

impl Default for AgentCatalog {
    fn default() -> Self {
        Self {
            agents: vec![
                AgentSpec::new(INPUT_VALIDATOR, "default")
                    .describe("Rejects empty or malformed requests before planning")
                    .with_prompt(
                        "You validate the user's request. Reply with finish_step \
                         {\"valid\": true} for actionable requests, or fail_step with \
                         a short reason for empty or nonsensical input.",
                    ),
                AgentSpec::new(TASK_PLANNER, "default")
                    .describe("Breaks a request into an ordered list of plan steps")
                    .with_prompt(
                        "You plan work for other agents. Reply with finish_step whose \
                         output is {\"steps\": [{\"title\": ..., \"agent\": ...}]}, or \
                         {\"workflow\": <name>} to use a catalog workflow.",
                    ),
                AgentSpec::new(TOOL_EXECUTOR, "default")
                    .describe("Executes a single plan step, calling tools as needed")
                    .with_prompt(
                        "You execute one plan step. Use call_tool / call_tools for \
                         external work, request_form when human input is required, \
                         and finish_step with the step's output when done.",
                    ),
                AgentSpec::new(HUMAN_REVIEWER, "default")
                    .describe("Decides whether a failed step is retried, skipped, or aborted")
                    .with_prompt(
                        "A plan step failed. Reply with finish_step whose output is \
                         {\"decision\": \"retry\" | \"skip\" | \"abort\"}.",
                    ),
                AgentSpec::new(RESULT_SYNTHESIZER, "default")
                    .describe("Summarizes completed steps into the final answer")
                    .with_prompt(
                        "Summarize the outcome of the plan for the user. Emit markdown \
                         with emit_markdown, then finish_step.",
                    ),
            ],
        }
    }
}

// ── Workflows ──

/// Named PlanStep templates. The planner can instantiate one by name
/// instead of inventing steps.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkflowCatalog {
    #[serde(default)]
    pub workflows: HashMap<String, WorkflowTemplate>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepTemplate>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepTemplate {
    pub title: String,
    pub agent: String,
}

impl WorkflowCatalog {
    pub fn get(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.workflows.get(name)
    }
}

// ── Permissions ──

/// Tenant → allowed tools/agents. A missing tenant entry falls back to the
/// default policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionsCatalog {
    #[serde(default)]
    pub tenants: HashMap<String, TenantPolicy>,
    #[serde(default)]
    pub default_policy: TenantPolicy,
}

impl Default for PermissionsCatalog {
    fn default() -> Self {
        Self {
            tenants: HashMap::new(),
            default_policy: TenantPolicy::allow_all(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TenantPolicy {
    /// Tool names, or the single entry "*" for all.
    pub allowed_tools: Vec<String>,
    pub allowed_agents: Vec<String>,
}

impl Default for TenantPolicy {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl TenantPolicy {
    pub fn allow_all() -> Self {
        Self {
            allowed_tools: vec!["*".into()],
            allowed_agents: vec!["*".into()],
        }
    }

    pub fn allows_tool(&self, name: &str) -> bool {
        self.allowed_tools.iter().any(|t| t == "*" || t == name)
    }

    pub fn allows_agent(&self, name: &str) -> bool {
        self.allowed_agents.iter().any(|a| a == "*" || a == name)
    }
}

impl PermissionsCatalog {
    pub fn policy_for(&self, tenant: &str) -> &TenantPolicy {
        self.tenants.get(tenant).unwrap_or(&self.default_policy)
    }
}
