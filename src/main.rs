use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use marshal_core::config::{expand_home, AppConfig};
use marshal_core::event::EventSink;
use marshal_core::policy::Decision;
use marshal_core::types::{ActionRequest, EngineEvent, StateDelta, StateMap};
use marshal_engine::graph::{ActionSpec, GraphBuilder, MergePolicy, Node, ParallelGroup, RunOptions};
use marshal_engine::voting::{VoteSpec, VotingStrategy};
use marshal_engine::{AuditJournal, GovernanceContext, Orchestrator};

#[derive(Parser)]
#[command(name = "marshal", version, about = "Governed workflow orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "marshal.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved configuration
    Config,
    /// Dry-run an action against the policy table
    Check {
        /// Action identifier (policy key)
        action: String,
        /// Node name recorded on the request
        #[arg(long, default_value = "cli")]
        node: String,
        /// Parameter as key=value (value parsed as JSON when possible)
        #[arg(short, long = "param")]
        params: Vec<String>,
        /// Resource the action touches
        #[arg(short, long = "resource")]
        resources: Vec<String>,
        /// Estimated cost in cents
        #[arg(long, default_value_t = 0)]
        cost: u64,
    },
    /// List recorded violations from the audit journal
    Audit {
        /// Only violations for this action
        #[arg(long)]
        action: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Run a built-in scenario graph with stub executors
    Demo {
        #[arg(value_enum, default_value_t = DemoScenario::Approval)]
        scenario: DemoScenario,
        /// Seconds before the demo approver answers
        #[arg(long, default_value_t = 1)]
        approve_after: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DemoScenario {
    /// Plan then deploy, with deploy gated on human approval
    Approval,
    /// Three reviewers fan out, vote and merge their findings
    Fanout,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MARSHAL_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("marshal=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Check {
            action,
            node,
            params,
            resources,
            cost,
        } => {
            let gov = GovernanceContext::from_config(&config)?;
            let mut req = ActionRequest::new(node, action).with_cost(cost);
            for p in &params {
                let (k, v) = p
                    .split_once('=')
                    .with_context(|| format!("parameter '{}' is not key=value", p))?;
                let value = serde_json::from_str(v).unwrap_or_else(|_| json!(v));
                req = req.with_param(k, value);
            }
            for r in resources {
                req = req.with_resource(r);
            }
            match gov.policy.validate(&gov.policy.snapshot(), &req) {
                Decision::Allowed => println!("allowed: {}", req.summary()),
                Decision::Denied { reason, severity } => {
                    println!("denied ({:?}): {}", severity, reason);
                    std::process::exit(1);
                }
            }
        }
        Commands::Audit { action, limit } => {
            let path = config
                .audit
                .journal_path
                .as_deref()
                .context("no [audit] journal_path configured")?;
            let journal = AuditJournal::open(&expand_home(path)).map_err(anyhow::Error::msg)?;
            let violations = journal
                .recent_violations(action.as_deref(), limit)
                .map_err(anyhow::Error::msg)?;
            if violations.is_empty() {
                println!("No violations recorded.");
            }
            for v in violations {
                println!("{}", serde_json::to_string(&v)?);
            }
        }
        Commands::Demo {
            scenario,
            approve_after,
        } => run_demo(config, scenario, Duration::from_secs(approve_after)).await?,
    }

    Ok(())
}

fn load_config(path: &PathBuf) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home = expand_home("~/.marshal/config.toml");
    if home.exists() {
        info!(path = %home.display(), "Loading config from home directory");
        return Ok(AppConfig::load(&home)?);
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

/// Prints every event as a JSON line.
struct StdoutSink;

impl EventSink for StdoutSink {
    fn deliver(&self, event: &EngineEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
    }
}

fn single(key: &str, value: serde_json::Value) -> StateDelta {
    let mut d = StateDelta::new();
    d.insert(key.to_string(), value);
    d
}

async fn run_demo(
    mut config: AppConfig,
    scenario: DemoScenario,
    approve_after: Duration,
) -> anyhow::Result<()> {
    let demo_policies = r#"
[deploy]
risk_level = "high"
requires_approval = true
urgency = "high"
allowed_resource_prefixes = ["staging/", "prod/"]
max_cost_cents = 500
"#;
    for (action, policy) in toml::from_str::<marshal_core::policy::PolicyTable>(demo_policies)? {
        config.policies.entry(action).or_insert(policy);
    }

    let gov = Arc::new(GovernanceContext::from_config(&config)?);
    gov.event_bus.register_sink(Arc::new(StdoutSink));

    let graph = match scenario {
        DemoScenario::Approval => GraphBuilder::new("approval-demo")
            .node(Node::from_fn("plan", |_| async {
                Ok(single("target", json!("staging/web")))
            }))
            .node(
                Node::from_fn("deploy", |_| async { Ok(single("deployed", json!(true))) })
                    .with_action(
                        ActionSpec::new("deploy")
                            .with_cost(120)
                            .with_params(vec!["target".into()])
                            .with_resources(vec!["target".into()]),
                    ),
            )
            .edge("plan", "deploy")
            .entry("plan")
            .compile()?,
        DemoScenario::Fanout => GraphBuilder::new("fanout-demo")
            .node(Node::from_fn("security", |_| async {
                let mut d = StateDelta::new();
                d.insert("findings".into(), json!(["sql-injection"]));
                d.insert("verdict".into(), json!("reject"));
                Ok(d)
            }))
            .node(Node::from_fn("style", |_| async {
                let mut d = StateDelta::new();
                d.insert("findings".into(), json!(["long-lines"]));
                d.insert("verdict".into(), json!("approve"));
                Ok(d)
            }))
            .node(Node::from_fn("tests", |_| async {
                let mut d = StateDelta::new();
                d.insert("findings".into(), json!([]));
                d.insert("verdict".into(), json!("approve"));
                Ok(d)
            }))
            .group(
                ParallelGroup::new(
                    "review",
                    vec!["security".into(), "style".into(), "tests".into()],
                )
                .with_vote(
                    VoteSpec::new(VotingStrategy::Weighted, "verdict", "decision")
                        .with_weight("security", 3.0),
                ),
            )
            .merge_policy("findings", MergePolicy::AccumulateSet)
            .entry("review")
            .compile()?,
    };

    let mut approver_rx = gov.event_bus.subscribe();
    let approvals = gov.approvals.clone();
    let approver = tokio::spawn(async move {
        while let Ok(event) = approver_rx.recv().await {
            if let EngineEvent::ApprovalRequested { request } = event {
                tokio::time::sleep(approve_after).await;
                if let Err(e) = approvals.approve(&request.id, "demo-operator").await {
                    warn!(id = %request.id, error = %e, "Demo approval failed");
                }
            }
        }
    });

    let orchestrator = Orchestrator::new(gov.clone());
    let graph_id = graph.id.clone();
    orchestrator.register_graph(graph_id.clone(), graph);
    let handle = orchestrator.submit_run(&graph_id, StateMap::new(), RunOptions::default())?;
    let outcome = handle.await_result().await;
    approver.abort();

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.is_completed() {
        std::process::exit(1);
    }
    Ok(())
}
