//! Operator CLI: seeds tasks, posts messages and queues workflows into the
//! directories a running `fleetd` watches. It never talks to the daemon
//! directly.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use fleet_common::config::{resolve_config_path, FleetConfig, DEFAULT_CONFIG_FILE};
use fleet_common::envelope::Envelope;
use fleet_common::task::Task;
use fleet_orchestration::mailbox;
use fleet_orchestration::monitor::HEALTH_FILE;
use fleet_orchestration::workflow::{load_run, submit, DEFAULT_STEP_TIMEOUT_MS};
use fleet_orchestration::{Coordinator, OrchestrationStrategy, Workflow, WorkflowBuilder};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetctl", version)]
#[command(about = "Operate a fleet: seed tasks, post messages, queue workflows")]
struct Cli {
    /// Config file (falls back to $FLEET_CONFIG, then ./fleet.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a queued task in the task store
    Seed {
        #[arg(long)]
        id: String,
        #[arg(long)]
        repo: String,
        #[arg(long)]
        intent: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long = "label", value_delimiter = ',')]
        labels: Vec<String>,
        #[arg(long = "criteria", value_delimiter = ',')]
        acceptance_criteria: Vec<String>,
        #[arg(long = "evidence-required", value_delimiter = ',')]
        evidence_required: Vec<String>,
    },
    /// Drop a message into an agent's inbox
    Post {
        #[arg(long)]
        to: String,
        #[arg(long = "type")]
        kind: String,
        /// Sender; command results go back to its mailbox (default: the supervisor)
        #[arg(long)]
        from: Option<String>,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Ask the coordinator to hand queued tasks to the given workers
    Assign {
        #[arg(long = "target", value_delimiter = ',', required = true)]
        targets: Vec<String>,
        #[arg(long)]
        workflow_id: Option<String>,
    },
    /// Print agent health, or the state of one workflow run
    Status {
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Queue a workflow for the daemon's engine
    #[command(subcommand)]
    Workflow(WorkflowCmd),
}

#[derive(Args, Debug)]
struct StepOpts {
    /// Workflow name
    #[arg(long)]
    name: Option<String>,
    /// Per-step response timeout
    #[arg(long = "timeout-secs")]
    timeout_secs: Option<u64>,
    /// Re-dispatch attempts after a timeout
    #[arg(long, default_value_t = 0)]
    retries: u32,
}

#[derive(Subcommand, Debug)]
enum WorkflowCmd {
    /// Queue a workflow definition from a JSON file
    Submit { file: PathBuf },
    /// Two agents trading turns on a topic
    Conversation {
        #[arg(long)]
        a: String,
        #[arg(long)]
        b: String,
        #[arg(long)]
        topic: String,
        #[arg(long, default_value_t = 2)]
        rounds: usize,
        #[command(flatten)]
        opts: StepOpts,
    },
    /// One task fanned out to several workers
    Orchestrate {
        #[arg(long)]
        task: String,
        #[arg(long = "worker", value_delimiter = ',', required = true)]
        workers: Vec<String>,
        #[arg(long, default_value = "parallel")]
        strategy: OrchestrationStrategy,
        #[command(flatten)]
        opts: StepOpts,
    },
    /// A decision step followed by one branch per option
    Decide {
        #[arg(long)]
        decider: String,
        #[arg(long)]
        question: String,
        /// AGENT=OPTION, repeatable
        #[arg(long = "branch", value_parser = parse_branch, required = true)]
        branches: Vec<(String, String)>,
        #[command(flatten)]
        opts: StepOpts,
    },
    /// Assess/act iterations for one agent
    Loop {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        goal: String,
        #[arg(long, default_value_t = 3)]
        iterations: usize,
        #[command(flatten)]
        opts: StepOpts,
    },
}

fn parse_branch(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((agent, option)) if !agent.trim().is_empty() && !option.trim().is_empty() => {
            Ok((agent.trim().to_string(), option.trim().to_string()))
        }
        _ => Err(format!("expected AGENT=OPTION, got '{raw}'")),
    }
}

fn builder(opts: &StepOpts, default_name: &str) -> WorkflowBuilder {
    let timeout = Duration::from_millis(
        opts.timeout_secs
            .map(|secs| secs * 1000)
            .unwrap_or(DEFAULT_STEP_TIMEOUT_MS),
    );
    WorkflowBuilder::new(opts.name.as_deref().unwrap_or(default_name))
        .step_defaults(timeout, opts.retries)
}

fn build_workflow(cmd: WorkflowCmd) -> Result<Workflow> {
    let workflow = match cmd {
        WorkflowCmd::Submit { file } => {
            let raw = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let workflow: Workflow = serde_json::from_slice(&raw)
                .with_context(|| format!("parsing {}", file.display()))?;
            workflow.validate()?;
            workflow
        }
        WorkflowCmd::Conversation { a, b, topic, rounds, opts } => builder(&opts, "conversation")
            .variable("topic", topic.clone())
            .conversation_loop(&a, &b, &topic, rounds)
            .build()?,
        WorkflowCmd::Orchestrate { task, workers, strategy, opts } => builder(&opts, "orchestrate")
            .orchestrate(&task, &workers, strategy)
            .build()?,
        WorkflowCmd::Decide { decider, question, branches, opts } => builder(&opts, "decision")
            .decision_tree(&decider, &question, &branches)
            .build()?,
        WorkflowCmd::Loop { agent, goal, iterations, opts } => builder(&opts, "autonomous")
            .autonomous_loop(&agent, &goal, iterations)
            .build()?,
    };
    Ok(workflow)
}

/// Operator commands are signed as the supervisor so their `result` replies
/// land in a mailbox the daemon scans.
fn assign_request(
    config: &FleetConfig,
    targets: Vec<String>,
    workflow_id: Option<String>,
) -> Envelope {
    Envelope::new(
        "fsm_request",
        config.supervisor.clone(),
        config.orchestrator.clone(),
        json!({"targets": targets, "workflow_id": workflow_id}),
    )
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let Some(config_path) = resolve_config_path(cli.config) else {
        bail!("no config file given and ./{DEFAULT_CONFIG_FILE} does not exist");
    };
    let config = FleetConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    match cli.command {
        Commands::Seed {
            id,
            repo,
            intent,
            priority,
            labels,
            acceptance_criteria,
            evidence_required,
        } => {
            let mut task = Task::queued(id, repo, intent);
            task.priority = priority;
            task.labels = labels;
            task.acceptance_criteria = acceptance_criteria;
            task.evidence_required = evidence_required;
            let task_id = task.id.clone();
            Coordinator::from_config(&config)?.seed(task)?;
            print_json(&json!({"ok": true, "task_id": task_id}))
        }
        Commands::Post { to, kind, from, payload } => {
            let payload: Value =
                serde_json::from_str(&payload).context("--payload must be valid JSON")?;
            let from = from.unwrap_or_else(|| config.supervisor.clone());
            let envelope = Envelope::new(kind, from, to, payload);
            let path = mailbox::post(&config.mailbox_root, &envelope)?;
            print_json(&json!({"ok": true, "id": envelope.id, "path": path}))
        }
        Commands::Assign { targets, workflow_id } => {
            let envelope = assign_request(&config, targets, workflow_id);
            mailbox::post(&config.mailbox_root, &envelope)?;
            print_json(&json!({"ok": true, "id": envelope.id}))
        }
        Commands::Status { workflow: Some(workflow_id) } => {
            let run = load_run(&config.runtime_root, &workflow_id)?
                .ok_or_else(|| anyhow!("no run state for workflow '{workflow_id}'"))?;
            print_json(&serde_json::to_value(run)?)
        }
        Commands::Status { workflow: None } => {
            let path = config.runtime_root.join(HEALTH_FILE);
            let raw = std::fs::read(&path)
                .with_context(|| format!("reading {} (is fleetd running?)", path.display()))?;
            let health: Value = serde_json::from_slice(&raw)?;
            print_json(&health)
        }
        Commands::Workflow(cmd) => {
            let workflow = build_workflow(cmd)?;
            let path = submit(&config.runtime_root, &workflow)?;
            print_json(&json!({
                "ok": true,
                "workflow_id": workflow.id,
                "steps": workflow.steps.len(),
                "queued": path,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_sent_from_a_scanned_mailbox() {
        let config = FleetConfig::from_toml_str(
            r#"
agents = ["W1", "W2"]
mailbox_root = "/tmp/fleet/mail"
task_store_root = "/tmp/fleet/tasks"
runtime_root = "/tmp/fleet/runtime"
active_grace = 300
warn_threshold = 480
stall_threshold = 600
check_interval = 30
rescue_cooldown = 300
"#,
        )
        .unwrap();

        let envelope = assign_request(&config, vec!["W1".into()], None);
        assert_eq!(envelope.from, config.supervisor);
        assert_eq!(envelope.to, config.orchestrator);
        assert!(config.mailbox_owners().any(|owner| owner == envelope.from));

        let cli =
            Cli::try_parse_from(["fleetctl", "post", "--to", "W1", "--type", "note"]).unwrap();
        let Commands::Post { from, .. } = cli.command else {
            panic!("expected post command");
        };
        assert!(from.is_none());
    }

    #[test]
    fn branch_needs_agent_and_option() {
        assert_eq!(
            parse_branch("W2 = rewrite it").unwrap(),
            ("W2".to_string(), "rewrite it".to_string())
        );
        assert!(parse_branch("W2").is_err());
        assert!(parse_branch("=x").is_err());
    }

    #[test]
    fn cli_builds_sequential_orchestration() {
        let cli = Cli::try_parse_from([
            "fleetctl",
            "workflow",
            "orchestrate",
            "--task",
            "review",
            "--worker",
            "W1,W2",
            "--strategy",
            "sequential",
            "--retries",
            "1",
        ])
        .unwrap();
        let Commands::Workflow(cmd) = cli.command else {
            panic!("expected workflow command");
        };
        let wf = build_workflow(cmd).unwrap();
        assert_eq!(wf.steps.len(), 2);
        assert!(wf.steps[1].dependencies.contains("orch1_1"));
        assert!(wf.steps.iter().all(|s| s.max_retries == 1));
    }
}
