use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{Workflow, WorkflowError, WorkflowStep, DEFAULT_STEP_TIMEOUT_MS};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStrategy {
    Parallel,
    Sequential,
}

impl fmt::Display for OrchestrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OrchestrationStrategy::Parallel => "parallel",
            OrchestrationStrategy::Sequential => "sequential",
        })
    }
}

impl FromStr for OrchestrationStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "parallel" => Ok(OrchestrationStrategy::Parallel),
            "sequential" => Ok(OrchestrationStrategy::Sequential),
            other => Err(format!("unknown strategy '{other}' (expected parallel or sequential)")),
        }
    }
}

/// Assembles a [`Workflow`] from explicit steps and composite patterns.
///
/// Composite patterns only generate ordinary steps with dependency edges;
/// their ids are prefixed with the pattern kind and a per-builder counter
/// (`conv1_r2_ba`, `orch2_3`, ...), so several composites can share one
/// workflow.
pub struct WorkflowBuilder {
    id: String,
    name: String,
    variables: Map<String, Value>,
    steps: Vec<WorkflowStep>,
    composites: usize,
    step_timeout: Duration,
    max_retries: u32,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let uuid = Uuid::new_v4().to_string();
        Self {
            id: format!("wf-{}", &uuid[..8]),
            name: name.into(),
            variables: Map::new(),
            steps: Vec::new(),
            composites: 0,
            step_timeout: Duration::from_millis(DEFAULT_STEP_TIMEOUT_MS),
            max_retries: 0,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Timeout and retry budget applied to steps generated by composites.
    pub fn step_defaults(mut self, timeout: Duration, max_retries: u32) -> Self {
        self.step_timeout = timeout;
        self.max_retries = max_retries;
        self
    }

    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    fn generated(&self, id: String, agent: &str, template: String) -> WorkflowStep {
        WorkflowStep::new(id, agent, template)
            .timeout(self.step_timeout)
            .retries(self.max_retries)
    }

    fn next_prefix(&mut self, kind: &str) -> String {
        self.composites += 1;
        format!("{kind}{}", self.composites)
    }

    /// `rounds` of A->B then B->A exchanges, chained end to end. Each turn
    /// sees the other side's last reply.
    pub fn conversation_loop(mut self, a: &str, b: &str, topic: &str, rounds: usize) -> Self {
        let prefix = self.next_prefix("conv");
        let mut previous: Option<String> = None;

        for round in 1..=rounds {
            for (speaker, listener, tag) in [(a, b, "ab"), (b, a, "ba")] {
                let id = format!("{prefix}_r{round}_{tag}");
                let template = match &previous {
                    None => format!(
                        "Conversation with {listener} about: {topic}\nOpen with your position."
                    ),
                    Some(prev) => format!(
                        "Conversation with {listener} about: {topic}\n\
                         {listener} replied: {{{{{prev}.text}}}}\nRespond to it."
                    ),
                };
                let step = self
                    .generated(id.clone(), speaker, template)
                    .named(format!("round {round}: {speaker} -> {listener}"))
                    .depends_on(previous.take());
                self.steps.push(step);
                previous = Some(id);
            }
        }
        self
    }

    /// One step per worker. `Sequential` makes each worker wait for every
    /// earlier worker and see their results.
    pub fn orchestrate(
        mut self,
        task: &str,
        workers: &[String],
        strategy: OrchestrationStrategy,
    ) -> Self {
        let prefix = self.next_prefix("orch");
        let mut earlier: Vec<String> = Vec::new();

        for (index, worker) in workers.iter().enumerate() {
            let id = format!("{prefix}_{}", index + 1);
            let mut template = format!("Task: {task}");
            let mut step_deps = Vec::new();
            if strategy == OrchestrationStrategy::Sequential && !earlier.is_empty() {
                template.push_str("\nResults so far:");
                for prior in &earlier {
                    template.push_str(&format!("\n- {{{{{prior}.text}}}}"));
                }
                step_deps = earlier.clone();
            }
            let step = self
                .generated(id.clone(), worker, template)
                .named(format!("{strategy} {worker}"))
                .depends_on(step_deps);
            self.steps.push(step);
            earlier.push(id);
        }
        self
    }

    /// A decision step followed by one step per `(agent, option)` branch.
    /// Every branch depends only on the decision; which branch acts on it is
    /// left to the agents.
    pub fn decision_tree(
        mut self,
        decider: &str,
        question: &str,
        branches: &[(String, String)],
    ) -> Self {
        let prefix = self.next_prefix("dec");
        let decision_id = format!("{prefix}_decide");

        let mut template = format!("Decision needed: {question}\nOptions:");
        for (_, option) in branches {
            template.push_str(&format!("\n- {option}"));
        }
        template.push_str("\nReply with the chosen option and why.");
        let decision = self
            .generated(decision_id.clone(), decider, template)
            .named(format!("decide: {question}"));
        self.steps.push(decision);

        for (index, (agent, option)) in branches.iter().enumerate() {
            let template = format!(
                "Decision on \"{question}\": {{{{{decision_id}.text}}}}\n\
                 If it selects \"{option}\", carry it out. \
                 Otherwise reply that this branch is skipped."
            );
            let branch = self
                .generated(format!("{prefix}_branch{}", index + 1), agent, template)
                .named(format!("branch: {option}"))
                .depends_on([decision_id.clone()]);
            self.steps.push(branch);
        }
        self
    }

    /// Alternating assess/act pairs for one agent.
    pub fn autonomous_loop(mut self, agent: &str, goal: &str, max_iterations: usize) -> Self {
        let prefix = self.next_prefix("auto");
        let mut last_act: Option<String> = None;

        for iteration in 1..=max_iterations {
            let assess_id = format!("{prefix}_i{iteration}_assess");
            let act_id = format!("{prefix}_i{iteration}_act");

            let mut assess = format!(
                "Goal: {goal}\nIteration {iteration} of {max_iterations}. Assess the current state."
            );
            if let Some(prev) = &last_act {
                assess.push_str(&format!("\nLast action result: {{{{{prev}.text}}}}"));
            }
            assess.push_str(
                "\nReply with findings and the next action, or DONE if the goal is met.",
            );
            let act = format!(
                "Goal: {goal}\nCarry out the next action from your assessment: \
                 {{{{{assess_id}.text}}}}"
            );

            let assess_step = self
                .generated(assess_id.clone(), agent, assess)
                .named(format!("assess #{iteration}"))
                .depends_on(last_act.take());
            let act_step = self
                .generated(act_id.clone(), agent, act)
                .named(format!("act #{iteration}"))
                .depends_on([assess_id]);
            self.steps.push(assess_step);
            self.steps.push(act_step);
            last_act = Some(act_id);
        }
        self
    }

    pub fn build(self) -> Result<Workflow, WorkflowError> {
        let workflow = Workflow {
            id: self.id,
            name: self.name,
            variables: self.variables,
            steps: self.steps,
        };
        workflow.validate()?;
        Ok(workflow)
    }
}
