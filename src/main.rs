//! bulk-engine - Bulk Action Framework and Migration Engine
//!
//! Entry point for the CLI application.

use anyhow::{bail, Context, Result};
use bulk_engine::bulk::{BulkCommand, BulkStatus, Deadline};
use bulk_engine::config::{CliArgs, Command, EngineConfig, MigrateAction, SubmitArgs};
use bulk_engine::engine::Engine;
use bulk_engine::migration::{load_descriptors, MigrationService};
use bulk_engine::progress::{
    format_number, print_header, print_migration, print_status, print_statuses, ProgressReporter,
};
use bulk_engine::selection::Document;
use bulk_engine::server::{self, AppState};
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    // Validate and create config
    let config = EngineConfig::from_args(&args).context("Invalid configuration")?;
    let engine = Engine::open(config).context("Failed to open engine")?;

    match args.command.clone() {
        Command::Serve { bind, migrations } => {
            serve(&engine, &args, bind, migrations.as_deref())
        }
        Command::Submit(submit_args) => submit(&engine, &args, submit_args),
        Command::Status { id } => {
            let status = engine.bulk().get_status(&id)?;
            print_status(&status);
            Ok(())
        }
        Command::List { user } => {
            let statuses = engine.bulk().get_statuses(&user)?;
            print_statuses(&statuses);
            Ok(())
        }
        Command::Seed {
            count,
            doc_type,
            title,
        } => {
            let docs: Vec<Document> = (0..count)
                .map(|i| {
                    let title = title.clone().unwrap_or_else(|| format!("Document {}", i));
                    Document::with_random_id(&doc_type, &title)
                })
                .collect();
            let saved = engine
                .repository()
                .save_all(&docs)
                .context("Failed to save documents")?;
            println!("Seeded {} documents", format_number(saved as u64));
            Ok(())
        }
        Command::Migrate { migrations, action } => migrate(&engine, &args, &migrations, action),
    }
}

/// Run the processor and the status API until Ctrl+C
fn serve(
    engine: &Engine,
    args: &CliArgs,
    bind: std::net::SocketAddr,
    migrations: Option<&Path>,
) -> Result<()> {
    let migrations = match migrations {
        Some(path) => {
            let service = engine.migrations(load_descriptors(path)?);
            info!(migrations = ?service.migration_ids(), "Migrations loaded");
            Some(Arc::new(service))
        }
        None => None,
    };

    if !args.quiet {
        print_engine_header(engine, args);
    }

    engine.processor().start().context("Failed to start processor")?;
    if let Some(service) = &migrations {
        let resumed = service.resume_watchers()?;
        if resumed > 0 {
            info!(resumed, "Resumed running migration steps");
        }
    }

    let state = Arc::new(AppState {
        bulk: engine.bulk().clone(),
        migrations: migrations.clone(),
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")?;
    let served = runtime.block_on(server::serve(state, bind, shutdown_signal()));

    if let Some(service) = &migrations {
        service.shutdown();
    }
    if !engine.processor().stop(engine.config().stop_grace) {
        warn!("Processor did not stop cleanly, in-flight buckets will be redelivered");
    }
    served.context("Status API failed")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    eprintln!("\nShutting down gracefully...");
}

fn submit(engine: &Engine, args: &CliArgs, submit_args: SubmitArgs) -> Result<()> {
    let mut builder = BulkCommand::builder(&submit_args.action, &submit_args.query)
        .user(&submit_args.user)
        .repository(&submit_args.repository)
        .bucket_size(submit_args.bucket_size)
        .batch_size(submit_args.batch_size);
    for (key, value) in &submit_args.params {
        builder = builder.param(key, value);
    }

    let id = engine
        .bulk()
        .submit(builder.build())
        .context("Failed to submit command")?;
    println!("{}", id);

    if !submit_args.wait {
        return Ok(());
    }

    if !args.quiet {
        print_engine_header(engine, args);
    }
    let interrupted = interrupt_flag()?;
    engine.processor().start().context("Failed to start processor")?;
    let status = follow_command(
        engine,
        &id,
        Duration::from_secs(submit_args.timeout),
        &interrupted,
        args.quiet,
    );
    engine.processor().stop(engine.config().stop_grace);

    let status = status?;
    print_status(&status);
    if !status.is_terminal() {
        bail!(
            "Command {} did not finish, processing resumes on the next start",
            id
        );
    }
    Ok(())
}

fn migrate(engine: &Engine, args: &CliArgs, path: &Path, action: MigrateAction) -> Result<()> {
    let service = engine.migrations(load_descriptors(path)?);

    match action {
        MigrateAction::Probe { id } => {
            let state = service.probe_and_set_state(&id)?;
            println!("{}", state);
        }
        MigrateAction::Status { id } => {
            print_migration(&service.get_status(&id)?);
        }
        MigrateAction::Run { id, step, timeout } => {
            if !args.quiet {
                print_engine_header(engine, args);
            }
            let interrupted = interrupt_flag()?;
            engine.processor().start().context("Failed to start processor")?;

            let result = run_migration_step(
                &service,
                &id,
                step.as_deref(),
                Duration::from_secs(timeout),
                &interrupted,
                args.quiet,
            );
            service.shutdown();
            engine.processor().stop(engine.config().stop_grace);
            result?;

            let view = service.get_status(&id)?;
            print_migration(&view);
            if view.running {
                bail!("Migration step of '{}' is still running", id);
            }
            if let Some(error) = view.last_error {
                bail!("Migration step failed: {}", error);
            }
        }
    }
    Ok(())
}

fn run_migration_step(
    service: &MigrationService,
    id: &str,
    step: Option<&str>,
    timeout: Duration,
    interrupted: &AtomicBool,
    quiet: bool,
) -> Result<()> {
    let command_id = match step {
        Some(step) => service.run_step(id, step)?,
        None => service.probe_and_run(id)?,
    };
    info!(migration_id = id, command_id = %command_id, "Migration step submitted");

    let progress = (!quiet).then(ProgressReporter::new);
    let deadline = Deadline::after(timeout);
    loop {
        let view = service.get_status(id)?;
        if !view.running {
            break;
        }
        if let Some(p) = &progress {
            p.set_status(&format!("Migration {} running step {}", id, view.step.unwrap_or_default()));
        }
        if interrupted.load(Ordering::SeqCst) || deadline.is_expired() {
            break;
        }
        thread::sleep(Duration::from_millis(200));
    }
    if let Some(p) = progress {
        p.finish_and_clear();
    }
    Ok(())
}

/// Poll a command until it is terminal, interrupted or timed out
fn follow_command(
    engine: &Engine,
    id: &str,
    timeout: Duration,
    interrupted: &AtomicBool,
    quiet: bool,
) -> Result<BulkStatus> {
    let progress = (!quiet).then(ProgressReporter::new);
    let deadline = Deadline::after(timeout);

    let status = loop {
        let status = engine.bulk().get_status(id)?;
        if let Some(p) = &progress {
            p.update(&status);
        }
        if status.is_terminal() || deadline.is_expired() {
            break status;
        }
        if interrupted.load(Ordering::SeqCst) {
            info!(command_id = id, "Interrupted while waiting");
            break status;
        }
        engine
            .bulk()
            .await_completion(id, Duration::from_millis(200).min(deadline.remaining()))?;
    };

    if let Some(p) = progress {
        p.finish_and_clear();
    }
    Ok(status)
}

fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, stopping...");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;
    Ok(flag)
}

fn print_engine_header(engine: &Engine, args: &CliArgs) {
    let config = engine.config();
    print_header(
        &args.database.display().to_string(),
        config.partitions,
        config.workers,
    );
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("bulk_engine=debug,warn")
    } else {
        EnvFilter::new("bulk_engine=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
