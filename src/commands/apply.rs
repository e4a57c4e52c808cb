use super::{build_engine, build_validator, load_policy, print_transaction, via_daemon};
use crate::cli::ApplyArgs;
use crate::config::Config;
use crate::daemon::{DaemonClient, DaemonRequest, DaemonResponse};
use crate::error::{PilotError, Result};
use crate::generator::{gather_context, request_from_reply, CliGenerator, GenerationInput, PatchGenerator};
use crate::patch::Patch;
use crate::policy::{CommandClass, SafetyPolicy};
use crate::request::{ChangeRequest, Payload};
use crate::snapshot::store::TreeScanner;
use crate::transaction::{Engine, HaltLatch, Orchestrator, Transaction, TxState};
use crate::ui::{create_spinner, state_message, ConfirmPrompt};
use colored::*;
use std::process::ExitCode;
use std::time::Duration;

/// Run one change end to end. Exit status is success only on Committed.
///
/// The change goes to the daemon whenever its socket answers; only without
/// one does this process start its own worker.
pub async fn apply(config: &Config, args: ApplyArgs) -> Result<ExitCode> {
    HaltLatch::new(&config.state_dir).check()?;
    let policy = load_policy(config)?;

    let request = build_request(config, &policy, &args).await?;

    if args.dry_run {
        let validator = build_validator(config, policy)?;
        let spinner = create_spinner("Validating and build-testing...");
        let result = validator.validate(&request).await;
        spinner.finish_and_clear();
        let result = result?;
        if result.ok {
            println!("{} change validated, nothing applied", "[OK]".green().bold());
            return Ok(ExitCode::SUCCESS);
        }
        for reason in &result.reasons {
            println!("  {} {}", format!("{}:", reason.kind).red().bold(), reason.message);
        }
        return Ok(ExitCode::FAILURE);
    }

    let tx = if args.daemon || daemon_answers(config).await {
        submit_to_daemon(config, request).await?
    } else {
        run_locally(build_engine(config)?, request).await?
    };

    print_transaction(&tx);
    Ok(if tx.committed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn build_request(config: &Config, policy: &SafetyPolicy, args: &ApplyArgs) -> Result<ChangeRequest> {
    let prompt = ConfirmPrompt::new();

    if let Some(path) = &args.patch {
        let text = std::fs::read_to_string(path)?;
        let mut patch = Patch::parse(&text)?;
        patch.bind_base(&config.config_root)?;
        if !args.yes && !prompt.confirm_patch(&patch)? {
            return Err(PilotError::UserCancelled);
        }
        return Ok(ChangeRequest::patch(patch, &config.config_root));
    }

    if let Some(argv) = &args.run {
        let class = policy.evaluate_command(argv).class;
        let confirmed = match class {
            CommandClass::Restricted if args.yes => true,
            CommandClass::Restricted => {
                if !prompt.confirm_command(argv, class)? {
                    return Err(PilotError::UserCancelled);
                }
                true
            }
            // Forbidden commands go through so the rejection is journaled
            CommandClass::Safe | CommandClass::Forbidden => false,
        };
        return Ok(ChangeRequest::command(argv.clone(), confirmed));
    }

    if args.instruction.is_empty() {
        return Err(PilotError::Config(
            "nothing to apply: give an instruction, --patch <file> or --run <command>".to_string(),
        ));
    }

    let scanner = TreeScanner::new(config.config_root.clone(), &config.snapshot_excludes)?;
    let (context, target_paths) = gather_context(&scanner)?;
    let generator = CliGenerator::new(config.generator.clone());
    let input = GenerationInput {
        instruction: args.instruction.join(" "),
        target_paths: target_paths.clone(),
        context,
    };

    let spinner = create_spinner(&format!("Asking {} for a patch...", generator.name()));
    let reply = generator.generate(&input).await;
    spinner.finish_and_clear();

    let request = request_from_reply(reply?, &config.config_root, target_paths)?;
    if let Payload::Patch { patch } = &request.payload {
        if !args.yes && !prompt.confirm_patch(patch)? {
            return Err(PilotError::UserCancelled);
        }
    }
    Ok(request)
}

async fn daemon_answers(config: &Config) -> bool {
    matches!(
        via_daemon(config, &DaemonRequest::Ping).await,
        Some(Ok(DaemonResponse::Pong { .. }))
    )
}

async fn run_locally(engine: Engine, request: ChangeRequest) -> Result<Transaction> {
    let orchestrator = Orchestrator::start(engine);
    let submission = orchestrator.submit(request)?;
    let tx_id = submission.tx_id.clone();

    let spinner = create_spinner(&state_message(TxState::Received));
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let wait = submission.wait();
    tokio::pin!(wait);

    let result = loop {
        tokio::select! {
            result = &mut wait => break result,
            _ = tokio::signal::ctrl_c() => {
                match orchestrator.cancel(&tx_id) {
                    Ok(_) => spinner.set_message("Cancelling..."),
                    Err(e) => spinner.println(format!("{} {}", "[!]".yellow(), e)),
                }
            }
            _ = ticker.tick() => {
                if let Some(progress) = orchestrator.progress() {
                    spinner.set_message(state_message(progress.state));
                }
            }
        }
    };
    spinner.finish_and_clear();
    orchestrator.shutdown().await;
    result
}

async fn submit_to_daemon(config: &Config, request: ChangeRequest) -> Result<Transaction> {
    let client = DaemonClient::new(config.socket_path());
    let spinner = create_spinner("Submitted to daemon, waiting for the transaction...");
    let response = client
        .send_request(&DaemonRequest::Submit { request, wait: true })
        .await;
    spinner.finish_and_clear();

    match response? {
        DaemonResponse::Finished { transaction } => Ok(*transaction),
        DaemonResponse::Error { message } => Err(PilotError::Daemon(message)),
        other => Err(PilotError::Daemon(format!("unexpected response: {:?}", other))),
    }
}
