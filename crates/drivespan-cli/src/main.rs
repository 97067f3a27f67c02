mod commands;
mod logging;
mod progress;

use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands};
use dotenv::dotenv;
use drivespan_core::{catalog, walker, Context, Error, FileType, SyncConfig, SyncOptions};
use progress::ConsoleProgress;
use std::fs;
use std::path::Path;
use std::process;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = r#"# drivespan configuration file
# Use: df -B1 <mountpoint> to find the available space in bytes.
# Undersize each device by about 1MiB, otherwise errors will occur.
backupPath: "/mnt/data"
# Number of concurrent device backups. 1 == one device, 2 == two devices
outputStreams: 1
# Device sizes must be in bytes. Device order is planning order.
# devices:
#   - name: "Drive 1"
#     size: 4965185763
#     mountPoint: "/mnt/backup1"
#   - name: "Drive 2"
#     size: 4965185763
#     mountPoint: "/mnt/backup2"
"#;

fn main() {
    dotenv().ok();

    let args = Cli::parse();
    let _guard = logging::init_logger(&args.log_level, &args.log, !args.no_file_log);

    match args.command {
        Some(Commands::Sync) => process::exit(run_sync(&args)),
        None => {
            let _ = Cli::command().print_long_help();
        }
    }
}

fn run_sync(args: &Cli) -> i32 {
    let cfg = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    info!(path = %args.config.display(), "using configuration file");

    let (file_index, walk_errors) = match walker::build_file_index(&cfg.backup_path) {
        Ok(result) => result,
        Err(err) => {
            error!("error building file index: {err}");
            return 1;
        }
    };
    info!(files = file_index.len(), "file index built");

    let save_sync_context = !args.no_dev_context;
    let mut ctx = Context::from_config(&cfg, file_index);
    let plan_errors = match catalog::plan(&mut ctx, save_sync_context) {
        Ok(soft_errors) => soft_errors,
        Err(err) => {
            error!("planning failed: {err}");
            return 2;
        }
    };

    let mut file_error_count = 0usize;
    for err in walk_errors.iter().chain(plan_errors.iter()) {
        warn!("{err}");
        file_error_count += 1;
    }

    let device_info: Vec<(String, u64)> = ctx
        .devices
        .iter()
        .map(|d| (d.name.clone(), d.size_writn))
        .collect();
    let total_bytes: u64 = ctx
        .file_index
        .iter()
        .filter(|f| f.file_type == FileType::Regular)
        .map(|f| f.size)
        .sum();

    let mut session = drivespan_core::sync::run(ctx, SyncOptions { save_sync_context });

    let console = session.take_progress().map(|stream| {
        ConsoleProgress::spawn(stream, device_info, total_bytes, session.retry_senders())
    });

    // Error drain doubles as the wait loop: the channel disconnects once
    // every worker is finished and the context is finalized.
    for err in &session.errors {
        if err.is_done() {
            info!("{err}");
        } else {
            error!("sync error: {err}");
            file_error_count += 1;
        }
    }

    let mut ctx = match session.wait() {
        Ok(ctx) => ctx,
        Err(err) => {
            error!("sync failed: {err}");
            return 2;
        }
    };
    if let Some(console) = console {
        console.join();
    }

    if let Err(err) = dump_context(&mut ctx, &args.context) {
        error!("could not write sync context: {err}");
        file_error_count += 1;
    }

    if file_error_count > 0 {
        println!(
            "{}",
            format!("sync finished with {file_error_count} file errors").yellow()
        );
        3
    } else {
        println!("{}", "sync complete".green());
        0
    }
}

/// Loads the YAML configuration; a missing file is scaffolded with a
/// commented template for the operator to fill in.
fn load_config(path: &Path) -> Result<SyncConfig, i32> {
    if !path.exists() {
        if let Err(err) = fs::write(path, DEFAULT_CONFIG) {
            error!("could not create default configuration at {}: {err}", path.display());
        } else {
            error!(
                "created default configuration at {}; fill it in and re-run",
                path.display()
            );
        }
        return Err(1);
    }
    drivespan_core::config::load_configuration(path).map_err(|err| {
        error!("error loading configuration: {err}");
        1
    })
}

fn dump_context(ctx: &mut Context, path: &Path) -> Result<(), Error> {
    let mut soft_errors = Vec::new();
    let json = ctx.manifest_json(&mut soft_errors)?;
    for err in soft_errors {
        warn!("{err}");
    }
    fs::write(path, json)?;
    info!(path = %path.display(), "sync context written");
    Ok(())
}
