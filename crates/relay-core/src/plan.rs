use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::MessageId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    AwaitingUser,
    Done,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Terminal steps are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

/// One unit of work in the orchestrator's plan, bound to a single agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: u32,
    pub title: String,
    pub agent_name: String,
    pub inputs: Value,
    pub status: StepStatus,
    pub output_ref: Option<MessageId>,
}

impl PlanStep {
    pub fn new(index: u32, title: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            index,
            title: title.into(),
            agent_name: agent_name.into(),
            inputs: Value::Null,
            status: StepStatus::Pending,
            output_ref: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("step {0} not found")]
    NotFound(u32),
    #[error("step {0} is terminal and immutable")]
    Terminal(u32),
    #[error("another step is already running")]
    AlreadyRunning,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&PlanStep> {
        self.steps.get(index as usize)
    }

    pub fn running_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .count()
    }

    /// Move a step to a new status, enforcing the plan invariants:
    /// terminal steps never change, and at most one step runs at a time.
    pub fn set_status(&mut self, index: u32, status: StepStatus) -> Result<(), PlanError> {
        if status == StepStatus::Running
            && self
                .steps
                .iter()
                .any(|s| s.status == StepStatus::Running && s.index != index)
        {
            return Err(PlanError::AlreadyRunning);
        }
        let step = self
            .steps
            .get_mut(index as usize)
            .ok_or(PlanError::NotFound(index))?;
        if step.status.is_terminal() {
            return Err(PlanError::Terminal(index));
        }
        step.status = status;
        Ok(())
    }

    pub fn set_output(&mut self, index: u32, output_ref: MessageId) -> Result<(), PlanError> {
        let step = self
            .steps
            .get_mut(index as usize)
            .ok_or(PlanError::NotFound(index))?;
        step.output_ref = Some(output_ref);
        Ok(())
    }

    /// Rebind the agent handling a step (delegation).
    pub fn rebind_agent(&mut self, index: u32, agent_name: impl Into<String>) -> Result<(), PlanError> {
        let step = self
            .steps
            .get_mut(index as usize)
            .ok_or(PlanError::NotFound(index))?;
        if step.status.is_terminal() {
            return Err(PlanError::Terminal(index));
        }
        step.agent_name = agent_name.into();
        Ok(())
    }

    /// Next pending step index after `after`, if any.
    pub fn next_pending(&self, after: u32) -> Option<u32> {
        self.steps
            .iter()
            .filter(|s| s.index > after || (after == 0 && s.index == 0))
            .find(|s| s.status == StepStatus::Pending)
            .map(|s| s.index)
    }

    pub fn all_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_plan() -> Plan {
        Plan::new(vec![
            PlanStep::new(0, "Plan query", "task_planner"),
            PlanStep::new(1, "Search", "tool_executor"),
        ])
    }

    #[test]
    fn at_most_one_running() {
        let mut plan = two_step_plan();
        plan.set_status(0, StepStatus::Running).unwrap();
        assert_eq!(
            plan.set_status(1, StepStatus::Running),
            Err(PlanError::AlreadyRunning)
        );
        plan.set_status(0, StepStatus::Done).unwrap();
        plan.set_status(1, StepStatus::Running).unwrap();
        assert_eq!(plan.running_count(), 1);
    }

    #[test]
    fn terminal_steps_are_immutable() {
        let mut plan = two_step_plan();
        plan.set_status(0, StepStatus::Running).unwrap();
        plan.set_status(0, StepStatus::Done).unwrap();
        assert_eq!(
            plan.set_status(0, StepStatus::Running),
            Err(PlanError::Terminal(0))
        );
        assert_eq!(
            plan.rebind_agent(0, "other"),
            Err(PlanError::Terminal(0))
        );
    }

    #[test]
    fn rerunning_the_same_step_is_allowed() {
        // Retry after failure recovery re-enters the same step.
        let mut plan = two_step_plan();
        plan.set_status(0, StepStatus::Running).unwrap();
        plan.set_status(0, StepStatus::AwaitingUser).unwrap();
        plan.set_status(0, StepStatus::Running).unwrap();
        assert_eq!(plan.running_count(), 1);
    }

    #[test]
    fn next_pending_walks_forward() {
        let mut plan = two_step_plan();
        assert_eq!(plan.next_pending(0), Some(0));
        plan.set_status(0, StepStatus::Running).unwrap();
        plan.set_status(0, StepStatus::Done).unwrap();
        assert_eq!(plan.next_pending(0), Some(1));
        plan.set_status(1, StepStatus::Skipped).unwrap();
        assert_eq!(plan.next_pending(1), None);
        assert!(plan.all_terminal());
    }

    #[test]
    fn unknown_step_errors() {
        let mut plan = two_step_plan();
        assert_eq!(
            plan.set_status(9, StepStatus::Running),
            Err(PlanError::NotFound(9))
        );
    }

    #[test]
    fn serde_roundtrip() {
        let plan = two_step_plan();
        let json = serde_json::to_string(&plan).unwrap();
        let parsed: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.steps[1].agent_name, "tool_executor");
    }
}
