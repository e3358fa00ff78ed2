//! Dispatches a parsed [`Command`](crate::cli::Command) into `ktl_core`
//! operations. No engine behavior lives here: this module only wires
//! discovery, compilation, the DAG, the Scheduler and the Reporter together
//! the way the flags asked for.

use crate::cli::{BundleCommand, Cli, Command as CliCommand, GraphFormat, OutputFormat, RunArgs, SelectorArgs};
use crate::keys;
use crate::shell_helm::{ShellHelm, ShellKube};
use crate::verify::BuiltinVerifyEngine;
use ktl_core::bundle;
use ktl_core::cache::RenderCache;
use ktl_core::collaborators::HelmRenderer;
use ktl_core::error::{Error, Result};
use ktl_core::executor::{Executor, HelmExecutor};
use ktl_core::git::{GitRange, NoGit, SystemGit};
use ktl_core::infer::{infer, InferOptions};
use ktl_core::plan::Plan;
use ktl_core::reporter;
use ktl_core::run::{Command as RunCommand, NodeStatus, Run};
use ktl_core::scheduler::{ConfirmHook, FailurePolicy, RetryPolicy, RunOptions, Scheduler};
use ktl_core::{discover, DAGBuilder, RunStore, StackLock};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

/// Runs the parsed CLI and returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    match &cli.command {
        CliCommand::Plan(selector) => {
            let plan = compile_plan(&cli, selector, false).await?;
            print_plan(&cli, &plan)?;
            Ok(0)
        }
        CliCommand::Graph { selector, format } => {
            let plan = compile_plan(&cli, selector, false).await?;
            let text = reporter::render_graph(&plan, to_core_graph_format(*format))?;
            println!("{text}");
            Ok(0)
        }
        CliCommand::Apply(args) => run_command(&cli, args, RunCommand::Apply).await,
        CliCommand::Delete(args) => run_command(&cli, args, RunCommand::Delete).await,
        CliCommand::Diff(args) => run_command(&cli, args, RunCommand::Diff).await,
        CliCommand::Verify(args) => run_command(&cli, args, RunCommand::Verify).await,
        CliCommand::Audit { run_id } => audit(&cli, run_id.as_deref()).await,
        CliCommand::Bundle { action } => bundle_command(&cli, action).await,
    }
}

async fn compile_plan(cli: &Cli, selector: &SelectorArgs, infer_needed: bool) -> Result<Plan> {
    let discovered = discover(&cli.stack_root)?;
    let opts = selector.to_compile_options();

    let git: Box<dyn GitRange> = if opts.git_range.is_some() {
        Box::new(SystemGit { repo_root: cli.stack_root.clone() })
    } else {
        Box::new(NoGit)
    };

    let mut plan = ktl_core::compile(&cli.stack_root, &discovered.manifest, &opts, Some(git.as_ref()))?;

    if infer_needed || discovered.manifest.cli.infer_deps {
        let renderer: Arc<dyn HelmRenderer> = Arc::new(ShellHelm);
        let cache = Arc::new(RenderCache::new(64 * 1024 * 1024, None));
        infer(&mut plan, renderer, cache, &InferOptions::default()).await?;
    }

    DAGBuilder::build(&mut plan)?;
    Ok(plan)
}

fn print_plan(cli: &Cli, plan: &Plan) -> Result<()> {
    match cli.output {
        OutputFormat::Table => {
            print!("{}", reporter::print_plan_table(plan));
            Ok(())
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(plan)?);
            Ok(())
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(plan).map_err(Error::Yaml)?);
            Ok(())
        }
    }
}

async fn run_command(cli: &Cli, args: &RunArgs, command: RunCommand) -> Result<i32> {
    let _lock = StackLock::acquire(&cli.stack_root)?;
    let plan = compile_plan(cli, &args.selector, true).await?;

    let confirm: Option<ConfirmHook> = if args.yes || !matches!(command, RunCommand::Delete) {
        None
    } else {
        Some(Arc::new(|prompt: &str| -> bool {
            eprint!("{prompt}? [y/N] ");
            let _ = io::stderr().flush();
            let mut line = String::new();
            io::stdin().read_line(&mut line).is_ok() && matches!(line.trim(), "y" | "Y" | "yes")
        }))
    };

    let options = RunOptions {
        concurrency: args.concurrency,
        command,
        failure_policy: if args.continue_on_error { FailurePolicy::ContinueOnError } else { FailurePolicy::FailFast },
        retry: RetryPolicy { max_attempts: args.max_attempts, ..RetryPolicy::default() },
        node_timeout: Duration::from_secs(args.node_timeout_secs),
        wave_barrier: false,
        resume_run_id: args.resume.clone(),
        confirm,
    };

    let executor: Arc<dyn Executor> = Arc::new(HelmExecutor {
        renderer: Arc::new(ShellHelm),
        applier: Arc::new(ShellKube),
        verifier: Arc::new(BuiltinVerifyEngine),
        ruleset: args.ruleset.clone(),
        fail_on: args.fail_on.to_severity(),
    });
    let store = Arc::new(RunStore::new(&cli.stack_root));

    let result = Scheduler::run(options, plan, executor, store).await?;

    println!("run {}", result.run_id);
    for (id, status) in &result.status_by_id {
        println!("  {id} {status:?}");
    }

    Ok(result.exit as i32)
}

async fn audit(cli: &Cli, run_id: Option<&str>) -> Result<i32> {
    let store = RunStore::new(&cli.stack_root);
    let run_id = match run_id {
        Some(id) => id.to_string(),
        None => store
            .load_most_recent_run()?
            .ok_or_else(|| Error::Store("no runs recorded under this stack root".into()))?,
    };

    let plan = store.load_plan(&run_id)?;
    let transitions = store.replay_transitions(&run_id)?;

    let mut run = Run::new(run_id, RunCommand::Apply, plan);
    for t in transitions {
        run.status_by_id.insert(t.node_id.clone(), t.to);
        let attempts = run.attempts_by_id.entry(t.node_id).or_default();
        while attempts.len() < t.attempt as usize {
            attempts.push(ktl_core::run::Attempt { started_at: t.ts, finished_at: Some(t.ts), result: None, error: None });
        }
    }

    let text = reporter::render_audit(&run, to_core_audit_format(cli.output))?;
    println!("{text}");

    let failed = run.status_by_id.values().any(|s| matches!(s, NodeStatus::Failed));
    Ok(if failed { 1 } else { 0 })
}

async fn bundle_command(cli: &Cli, action: &BundleCommand) -> Result<i32> {
    match action {
        BundleCommand::Seal { selector, out, signing_key, include_inputs } => {
            let plan = compile_plan(cli, selector, false).await?;
            let key = keys::load_or_generate(signing_key.as_deref())?;
            let sealed = bundle::seal(&plan, RunCommand::Apply, *include_inputs, &key, out)?;
            println!("sealed {} (public key {})", sealed.path.display(), sealed.signature.public_key);
            Ok(0)
        }
        BundleCommand::Verify { bundle: bundle_path, trusted_key } => {
            let trusted = trusted_key.as_deref().map(keys::parse_trusted_key).transpose()?;
            let meta = bundle::verify(bundle_path, trusted.as_ref())?;
            println!("verified: alg={} key={}", meta.alg, meta.public_key);
            Ok(0)
        }
    }
}

fn to_core_graph_format(format: GraphFormat) -> reporter::GraphFormat {
    match format {
        GraphFormat::Dot => reporter::GraphFormat::Dot,
        GraphFormat::Mermaid => reporter::GraphFormat::Mermaid,
        GraphFormat::Json => reporter::GraphFormat::Json,
    }
}

fn to_core_audit_format(format: OutputFormat) -> reporter::AuditFormat {
    match format {
        OutputFormat::Json | OutputFormat::Yaml => reporter::AuditFormat::Json,
        OutputFormat::Table => reporter::AuditFormat::Table,
    }
}
