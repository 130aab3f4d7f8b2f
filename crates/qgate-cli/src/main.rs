//! qgate - tier-aware quality gate orchestration CLI
//!
//! ## Commands
//!
//! - `policy`: Show the tier policy table
//! - `plan`: Show the validation plan a request would get
//! - `config`: Show the effective orchestrator configuration
//! - `simulate`: Drive a full orchestration against in-memory collaborators

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, Level};

use qgate_core::fakes::{RecordingBranchProtector, RecordingStatusReporter, RecordingWorkflowTrigger};
use qgate_core::{
    BypassApproval, Collaborators, EscalationDecision, EscalationOutcome, GateConfig, GateOutcome,
    GateStatusUpdate, GateType, OrchestrationReport, OrchestrationStatus, Orchestrator,
    OrchestratorConfig, PolicyTable, RepositoryTier, TierPolicy, ValidationPlan,
    ValidationRequest,
};

#[derive(Parser)]
#[command(name = "qgate")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tier-aware quality gate orchestration", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Orchestrator config file (TOML). Defaults plus QGATE_* env vars otherwise.
    #[arg(short, long, global = true, env = "QGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show required gates, reviews and failure handling per tier
    Policy {
        /// Only show this tier
        #[arg(short, long)]
        tier: Option<RepositoryTier>,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the phase plan for a tier and optional gate selection
    Plan {
        #[arg(short, long)]
        tier: RepositoryTier,

        /// Explicit gate subset (comma-separated), replaces the tier's gates
        #[arg(short, long, value_delimiter = ',')]
        gates: Vec<String>,

        /// Gates to leave out (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        skip: Vec<String>,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the effective configuration
    Config,

    /// Run one orchestration end to end against in-memory collaborators
    Simulate {
        /// Repository, e.g. org/service
        #[arg(long)]
        repo: String,

        /// Commit sha
        #[arg(long)]
        sha: String,

        #[arg(short, long)]
        tier: RepositoryTier,

        /// Explicit gate subset (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        gates: Vec<String>,

        /// Fail a gate's first N attempts, e.g. `security_scan=2` (repeatable)
        #[arg(long = "fail", value_parser = parse_failure)]
        failures: Vec<(GateType, u32)>,

        /// Approve pending bypasses and override escalations as this actor
        #[arg(long)]
        approver: Option<String>,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    qgate_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Policy { tier, format } => cmd_policy(&config, tier, format),
        Commands::Plan {
            tier,
            gates,
            skip,
            format,
        } => cmd_plan(&config, tier, gates, skip, format),
        Commands::Config => cmd_config(&config),
        Commands::Simulate {
            repo,
            sha,
            tier,
            gates,
            failures,
            approver,
            format,
        } => {
            let request = request_for(&repo, &sha, tier, gates, Vec::new());
            let report = cmd_simulate(config, request, failures, approver).await?;
            print_report(&report, format)?;
            if report.status != OrchestrationStatus::Completed {
                anyhow::bail!(
                    "validation of {}@{} ended {}",
                    report.repository,
                    report.commit,
                    report.status
                );
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    match path {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => OrchestratorConfig::from_env().context("Invalid QGATE_* environment"),
    }
}

fn parse_failure(s: &str) -> std::result::Result<(GateType, u32), String> {
    let (gate, count) = s
        .split_once('=')
        .ok_or_else(|| format!("expected GATE=COUNT, got '{s}'"))?;
    let gate: GateType = gate.parse().map_err(|e| format!("{e}"))?;
    let count: u32 = count
        .trim()
        .parse()
        .map_err(|e| format!("invalid count '{count}': {e}"))?;
    Ok((gate, count))
}

fn request_for(
    repo: &str,
    sha: &str,
    tier: RepositoryTier,
    gates: Vec<String>,
    skip: Vec<String>,
) -> ValidationRequest {
    let mut request = ValidationRequest::new(repo, sha, tier);
    if !gates.is_empty() {
        request = request.with_gates(gates);
    }
    request.skip_gates = skip;
    request
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// policy / plan / config
// ---------------------------------------------------------------------------

fn cmd_policy(
    config: &OrchestratorConfig,
    tier: Option<RepositoryTier>,
    format: OutputFormat,
) -> Result<()> {
    let table: PolicyTable = config.policy_table()?;
    let policies: Vec<TierPolicy> = match tier {
        Some(tier) => vec![table.policy_for(tier)],
        None => table.iter().cloned().collect(),
    };
    if format == OutputFormat::Json {
        return print_json(&policies);
    }

    for policy in &policies {
        let gates: Vec<&str> = policy.required_gates.iter().map(|g| g.as_str()).collect();
        println!("{}", policy.tier);
        println!("  gates:      {}", gates.join(", "));
        println!("  approvals:  {}", policy.reviews.required_approvals);
        println!("  retries:    {}", policy.max_retries);
        println!(
            "  on failure: {}",
            if policy.bypass_allowed {
                "bypass with approval"
            } else if policy.requires_override_approval {
                "escalate to reviewer"
            } else {
                "block"
            }
        );
        println!("  estimate:   {} min", policy.estimated_minutes);
        println!();
    }
    Ok(())
}

fn cmd_plan(
    config: &OrchestratorConfig,
    tier: RepositoryTier,
    gates: Vec<String>,
    skip: Vec<String>,
    format: OutputFormat,
) -> Result<()> {
    let request = request_for("local/plan", "HEAD", tier, gates, skip);
    let validated = request.validate()?;
    let plan: ValidationPlan = qgate_core::PlanBuilder::new(config.policy_table()?)
        .build(&validated)
        .context("Failed to build validation plan")?;
    plan.validate()?;

    if format == OutputFormat::Json {
        return print_json(&plan);
    }

    println!(
        "{} tier: {} gates in {} phases (~{} min)",
        plan.tier,
        plan.required_gates.len(),
        plan.phases.len(),
        plan.estimated_minutes
    );
    for kind in plan.execution_order()? {
        let Some(phase) = plan.phase(kind) else {
            continue;
        };
        let gates: Vec<&str> = phase.gates.iter().map(|g| g.as_str()).collect();
        let after: Vec<&str> = phase.depends_on.iter().map(|p| p.name()).collect();
        println!();
        println!("  {} ({}s)", phase.name, phase.timeout_secs);
        println!("    gates: {}", gates.join(", "));
        if !after.is_empty() {
            println!("    after: {}", after.join(", "));
        }
    }
    println!();
    println!("Fallbacks:");
    for strategy in &plan.fallback_strategies {
        println!(
            "  on {:?} -> {:?}: {}",
            strategy.trigger, strategy.action, strategy.reason
        );
    }
    Ok(())
}

fn cmd_config(config: &OrchestratorConfig) -> Result<()> {
    print_json(config)
}

// ---------------------------------------------------------------------------
// simulate
// ---------------------------------------------------------------------------

/// Feed every dispatched gate a synthetic result until the run settles.
///
/// A gate listed in `failures` fails that many attempts before passing.
async fn cmd_simulate(
    config: OrchestratorConfig,
    request: ValidationRequest,
    failures: Vec<(GateType, u32)>,
    approver: Option<String>,
) -> Result<OrchestrationReport> {
    let trigger = Arc::new(RecordingWorkflowTrigger::new());
    let reporter = Arc::new(RecordingStatusReporter::new());
    let protector = Arc::new(RecordingBranchProtector::new());
    let orchestrator = Orchestrator::new(
        config,
        Collaborators {
            trigger: trigger.clone(),
            reporter: reporter.clone(),
            protector: protector.clone(),
        },
    )?;

    let mut events = orchestrator.subscribe();
    let mut remaining: BTreeMap<GateType, u32> = failures.into_iter().collect();

    let started = orchestrator.start(request).await?;
    let id = started.orchestration_id.clone();
    info!(orchestration_id = %id, run = ?started.workflow_run_id, "simulation started");

    let mut consumed = 0;
    loop {
        orchestrator.flush_background().await;
        let dispatches = trigger.dispatches();
        let pending: Vec<GateConfig> = dispatches[consumed..]
            .iter()
            .flat_map(|d| d.gates.iter().cloned())
            .collect();
        consumed = dispatches.len();

        if pending.is_empty() {
            let report = orchestrator
                .report(&id)
                .await
                .context("orchestration disappeared")?;
            if report.status.is_terminal() || !decide(&orchestrator, &report, &approver).await? {
                break;
            }
            continue;
        }

        for config in pending {
            let outcome = match remaining.get_mut(&config.gate) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    let detail = format!("simulated failure (attempt {})", config.attempt + 1);
                    GateOutcome::failure(config.gate, detail)
                }
                _ => GateOutcome::success(config.gate).with_score(100.0),
            };
            let update = GateStatusUpdate::new(&started.repository, &started.commit, outcome)
                .for_orchestration(&id);
            orchestrator.handle_update(update).await;
        }
    }

    orchestrator.flush_background().await;
    while let Ok(envelope) = events.try_recv() {
        info!(seq = envelope.seq, event = envelope.event.kind(), "event");
    }
    info!(
        check_writes = reporter.updates().len(),
        protection_requests = protector.requests().len(),
        "simulation finished"
    );
    qgate_core::METRICS.flush();

    orchestrator
        .report(&id)
        .await
        .context("orchestration disappeared")
}

/// Resolve outstanding human decisions as `approver`. Returns whether
/// anything was decided.
async fn decide(
    orchestrator: &Orchestrator,
    report: &OrchestrationReport,
    approver: &Option<String>,
) -> Result<bool> {
    let Some(approver) = approver else {
        return Ok(false);
    };
    let mut decided = false;
    for gate in &report.pending_bypasses {
        orchestrator
            .approve_bypass(
                &report.orchestration_id,
                BypassApproval::new(*gate, approver, "approved during simulation", "SIM-0"),
            )
            .await?;
        decided = true;
    }
    for gate in &report.pending_escalations {
        orchestrator
            .record_escalation_decision(
                &report.orchestration_id,
                EscalationDecision::new(
                    *gate,
                    approver,
                    EscalationOutcome::Override,
                    "overridden during simulation",
                ),
            )
            .await?;
        decided = true;
    }
    Ok(decided)
}

fn print_report(report: &OrchestrationReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(report);
    }

    println!("Orchestration: {}", report.orchestration_id);
    println!("Target:        {}@{} ({})", report.repository, report.commit, report.branch);
    println!("Tier:          {}", report.tier);
    println!("Status:        {}", report.status);
    println!("Progress:      {}%", report.progress);
    println!("Verdict:       {}", report.compliance.description);
    println!();
    println!("  completed: {}", gate_list(&report.completed_gates));
    println!("  failed:    {}", gate_list(&report.failed_gates));
    println!("  cancelled: {}", gate_list(&report.cancelled_gates));
    if !report.pending_bypasses.is_empty() {
        println!("  awaiting bypass approval: {}", gate_list(&report.pending_bypasses));
    }
    if !report.pending_escalations.is_empty() {
        println!("  awaiting review: {}", gate_list(&report.pending_escalations));
    }
    for record in &report.audit {
        println!(
            "  decision: {:?} on {} by {} ({})",
            record.kind,
            record.gate,
            record.actor,
            &record.content_digest[..12.min(record.content_digest.len())]
        );
    }
    Ok(())
}

fn gate_list(gates: &[GateType]) -> String {
    if gates.is_empty() {
        "-".to_string()
    } else {
        gates.iter().map(|g| g.as_str()).collect::<Vec<_>>().join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_failure() {
        assert_eq!(
            parse_failure("security_scan=2").unwrap(),
            (GateType::SecurityScan, 2)
        );
        assert!(parse_failure("security_scan").is_err());
        assert!(parse_failure("smoke=1").is_err());
        assert!(parse_failure("unit_tests=many").is_err());
    }

    #[test]
    fn test_cli_parses_simulate() {
        let cli = Cli::try_parse_from([
            "qgate",
            "simulate",
            "--repo",
            "org/api",
            "--sha",
            "abc",
            "--tier",
            "standard",
            "--fail",
            "unit_tests=1",
            "--gates",
            "code_quality,unit_tests",
        ])
        .unwrap();
        match cli.command {
            Commands::Simulate {
                tier,
                gates,
                failures,
                ..
            } => {
                assert_eq!(tier, RepositoryTier::Standard);
                assert_eq!(gates, vec!["code_quality", "unit_tests"]);
                assert_eq!(failures, vec![(GateType::UnitTests, 1)]);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[tokio::test]
    async fn test_simulate_clean_run_completes() {
        let request = ValidationRequest::new("org/api", "abc", RepositoryTier::Standard);
        let report = cmd_simulate(OrchestratorConfig::default(), request, Vec::new(), None)
            .await
            .unwrap();
        assert_eq!(report.status, OrchestrationStatus::Completed);
        assert_eq!(report.progress, 100);
    }

    #[tokio::test]
    async fn test_simulate_retries_flaky_gate() {
        let request = ValidationRequest::new("org/api", "def", RepositoryTier::Experimental);
        let report = cmd_simulate(
            OrchestratorConfig::default(),
            request,
            vec![(GateType::UnitTests, 2)],
            None,
        )
        .await
        .unwrap();
        assert_eq!(report.status, OrchestrationStatus::Completed);
        assert!(report.failed_gates.is_empty());
    }

    #[tokio::test]
    async fn test_simulate_escalation_waits_without_approver() {
        let request = ValidationRequest::new("org/pay", "f00", RepositoryTier::BusinessCritical);
        let failures = vec![(GateType::SecurityScan, 3)];

        let report = cmd_simulate(
            OrchestratorConfig::default(),
            request.clone(),
            failures.clone(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(report.status, OrchestrationStatus::BlockedPendingEscalation);

        let report = cmd_simulate(
            OrchestratorConfig::default(),
            request,
            failures,
            Some("security-lead".into()),
        )
        .await
        .unwrap();
        assert_eq!(report.status, OrchestrationStatus::Completed);
        assert_eq!(report.audit.len(), 1);
    }

    #[test]
    fn test_plan_command_rejects_dor() {
        let result = cmd_plan(
            &OrchestratorConfig::default(),
            RepositoryTier::Standard,
            vec!["dor".into()],
            Vec::new(),
            OutputFormat::Json,
        );
        assert!(result.is_err());
    }
}
