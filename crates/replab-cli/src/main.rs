use anyhow::Result;
use clap::{Parser, Subcommand};
use replab_core::{FsStore, Store};
use replab_runner::{
    audit_study, compile_study, create_experiment, load_definition, load_policy, plan, AuditFinding,
    Auditor, CancelToken, ConfigResolver, ConvergeOutcome, Driver, ExperimentAudit, HttpLlmClient,
    Plan, RunnerPolicy, StateMachine, StudyAudit,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const EXIT_FATAL: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(name = "replab", version = "0.3.0", about = "Replicated LLM matching experiments")]
struct Cli {
    /// Resolve relative paths under this directory instead of REPLAB_SANDBOX_DIR.
    #[arg(long, global = true)]
    sandbox: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an experiment from a YAML definition and run it to completion.
    New {
        #[arg(long)]
        config: PathBuf,
        experiment_dir: PathBuf,
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Only write the config snapshot.
        #[arg(long)]
        no_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Read-only audit of one experiment.
    Audit {
        experiment_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Repair, extend and re-aggregate an experiment until it validates.
    Fix {
        experiment_dir: PathBuf,
        #[arg(long)]
        policy: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    AuditStudy {
        study_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    CompileStudy {
        study_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

struct CommandOutput {
    payload: Option<Value>,
    exit_code: i32,
}

impl CommandOutput {
    fn new(payload: Option<Value>, exit_code: i32) -> Self {
        Self { payload, exit_code }
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let resolver = match cli.sandbox {
        Some(root) => ConfigResolver::new(Some(root)),
        None => ConfigResolver::from_env(),
    };
    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());

    match run_command(cli.command, &resolver, &cancel) {
        Ok(output) => {
            if let Some(payload) = output.payload {
                emit_json(&payload);
            }
            std::process::exit(output.exit_code);
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
            } else {
                eprintln!("error: {:#}", err);
            }
            std::process::exit(EXIT_FATAL);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// First Ctrl+C trips the cancel token so in-flight sessions finish and locks
/// are released; a second one removes the registered locks and exits at once.
fn install_interrupt_handler(cancel: CancelToken) {
    let spawned = std::thread::Builder::new()
        .name("replab-signal".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!(error = %e, "interrupt handler unavailable");
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                warn!("interrupt received; finishing in-flight sessions and releasing locks");
                cancel.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    let released = cancel.locks().release_all();
                    warn!(released, "second interrupt; released held locks, exiting");
                    std::process::exit(EXIT_CANCELLED);
                }
            });
        });
    if let Err(e) = spawned {
        warn!(error = %e, "could not start interrupt handler thread");
    }
}

fn run_command(
    command: Commands,
    resolver: &ConfigResolver,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    let store: Arc<dyn Store> = Arc::new(FsStore::new());
    match command {
        Commands::New {
            config,
            experiment_dir,
            policy,
            no_run,
            json,
        } => {
            let def = load_definition(&config, resolver)?;
            let dir = resolver.resolve(&experiment_dir);
            let created = create_experiment(store.as_ref(), &dir, &def)?;
            if no_run {
                let audit = Auditor::new(store.clone()).audit_experiment(&dir);
                if json {
                    return Ok(CommandOutput::new(
                        Some(json!({
                            "ok": true,
                            "command": "new",
                            "experiment_id": created.experiment_id,
                            "audit": audit_to_json(&audit),
                        })),
                        audit.exit_code(),
                    ));
                }
                println!("created: {}", dir.display());
                print!("{}", audit.render_text());
                return Ok(CommandOutput::new(None, audit.exit_code()));
            }
            let policy = load_policy(policy.map(|p| resolver.resolve(&p)).as_deref())?;
            fix_experiment(store, &dir, policy, cancel, "new", json)
        }
        Commands::Audit {
            experiment_dir,
            json,
        } => {
            let dir = resolver.resolve(&experiment_dir);
            let audit = Auditor::new(store).audit_experiment(&dir);
            if json {
                return Ok(CommandOutput::new(
                    Some(json!({
                        "ok": audit.exit_code() == 0,
                        "command": "audit",
                        "audit": audit_to_json(&audit),
                    })),
                    audit.exit_code(),
                ));
            }
            print!("{}", audit.render_text());
            Ok(CommandOutput::new(None, audit.exit_code()))
        }
        Commands::Fix {
            experiment_dir,
            policy,
            json,
        } => {
            let dir = resolver.resolve(&experiment_dir);
            let policy = load_policy(policy.map(|p| resolver.resolve(&p)).as_deref())?;
            fix_experiment(store, &dir, policy, cancel, "fix", json)
        }
        Commands::AuditStudy { study_dir, json } => {
            let dir = resolver.resolve(&study_dir);
            let study = audit_study(store, &dir)?;
            if json {
                return Ok(CommandOutput::new(
                    Some(json!({
                        "ok": study.exit_code() == 0,
                        "command": "audit-study",
                        "study": study_to_json(&study),
                    })),
                    study.exit_code(),
                ));
            }
            print!("{}", study.render_text());
            Ok(CommandOutput::new(None, study.exit_code()))
        }
        Commands::CompileStudy { study_dir, json } => {
            let dir = resolver.resolve(&study_dir);
            let result = compile_study(store, &dir)?;
            if json {
                return Ok(CommandOutput::new(
                    Some(json!({
                        "ok": true,
                        "command": "compile-study",
                        "path": result.path.display().to_string(),
                        "rows": result.rows,
                    })),
                    0,
                ));
            }
            println!("wrote: {} ({} experiments)", result.path.display(), result.rows);
            Ok(CommandOutput::new(None, 0))
        }
    }
}

fn fix_experiment(
    store: Arc<dyn Store>,
    dir: &Path,
    policy: RunnerPolicy,
    cancel: &CancelToken,
    command: &str,
    json: bool,
) -> Result<CommandOutput> {
    let auditor = Auditor::new(store.clone());
    let before = auditor.audit_experiment(dir);
    // nothing to run: report without requiring LLM credentials
    if matches!(plan(&before), Plan::Done | Plan::Halt(_)) {
        if !json {
            print!("{}", before.render_text());
            return Ok(CommandOutput::new(None, before.exit_code()));
        }
        return Ok(CommandOutput::new(
            Some(json!({
                "ok": before.exit_code() == 0,
                "command": command,
                "outcome": before.status.to_string(),
                "audit": audit_to_json(&before),
            })),
            before.exit_code(),
        ));
    }

    let llm = HttpLlmClient::from_policy(&policy)?;
    let driver = Driver::new(store.clone(), Arc::new(llm), policy, cancel.clone());
    let machine = StateMachine::new(store.clone(), driver, dir);
    info!(dir = %dir.display(), status = %before.status, "converging experiment");
    let outcome = machine.converge()?;
    let exit_code = outcome.exit_code();
    let after = auditor.audit_experiment(dir);
    let (label, detail) = match &outcome {
        ConvergeOutcome::Validated { steps } => ("validated", format!("{} step(s)", steps)),
        ConvergeOutcome::Halted { reason, .. } => ("halted", reason.to_string()),
        ConvergeOutcome::Exhausted { reason, .. } => ("exhausted", reason.clone()),
        ConvergeOutcome::Cancelled => ("cancelled", "interrupted by user".to_string()),
    };
    if json {
        return Ok(CommandOutput::new(
            Some(json!({
                "ok": exit_code == 0,
                "command": command,
                "outcome": label,
                "detail": detail,
                "audit": audit_to_json(&after),
            })),
            exit_code,
        ));
    }
    println!("{}: {}", label, detail);
    print!("{}", after.render_text());
    Ok(CommandOutput::new(None, exit_code))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::New { json, .. }
        | Commands::Audit { json, .. }
        | Commands::Fix { json, .. }
        | Commands::AuditStudy { json, .. }
        | Commands::CompileStudy { json, .. } => *json,
    }
}

fn finding_to_json(root: &Path, replication: usize, finding: &AuditFinding) -> Value {
    let trials = match finding {
        AuditFinding::ResponseIssue { trials, .. } => json!(trials),
        _ => Value::Null,
    };
    json!({
        "replication": replication,
        "finding": finding.tag(),
        "details": finding.details(root),
        "trials": trials,
    })
}

fn audit_to_json(audit: &ExperimentAudit) -> Value {
    json!({
        "experiment_dir": audit.dir.display().to_string(),
        "status": audit.status.to_string(),
        "exit_code": audit.exit_code(),
        "next_action": audit.next_action().describe(),
        "schema_version": audit.config.as_ref().map(|c| c.schema_version.clone()),
        "migration_reason": audit.migration_reason,
        "config_faults": audit.config_faults,
        "replications": audit
            .replications
            .iter()
            .map(|r| finding_to_json(&audit.dir, r.replication, &r.finding))
            .collect::<Vec<_>>(),
        "missing": audit.missing,
        "summary_faults": audit.summary_faults,
    })
}

fn study_to_json(study: &StudyAudit) -> Value {
    json!({
        "study_dir": study.dir.display().to_string(),
        "exit_code": study.exit_code(),
        "experiments": study
            .experiments
            .iter()
            .map(|(name, audit)| json!({
                "name": name,
                "status": audit.status.to_string(),
                "next_action": audit.next_action().describe(),
            }))
            .collect::<Vec<_>>(),
        "summary_faults": study.summary_faults,
    })
}
