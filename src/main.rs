mod acquisition;
mod config;
mod devices;
mod registers;
mod status;
mod storage;

use chrono::{Local, Timelike};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt;

use acquisition::{Cycle, ReadPlan};
use config::Config;
use devices::SerialLink;
use storage::{retention, CsvBackup, SheetsClient};

/// Polls the power meter and records each reading locally and remotely
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "meter-logger.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read the meter once and store the record
    Run {
        /// First PK to use when no backups exist yet
        #[arg(long)]
        seed_pk: Option<u64>,
    },
    /// Check the meter, the local backups and the remote tables
    Status,
    /// Delete old local backups and trash old remote tables
    Prune,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let guard = setup_logging(&config.log.dir);
    info!("Starting meter logger");
    info!("Loaded configuration from {}", args.config.display());

    let link = SerialLink::new(&config.serial);
    let local = CsvBackup::new(&config.backup.dir);
    let remote = config.cloud.enabled.then(|| SheetsClient::new(&config.cloud));
    info!("Backups kept in {}", local.dir().display());

    let ok = match args.command {
        Command::Run { seed_pk } => run_cycle(&config, &link, &local, remote.as_ref(), seed_pk),
        Command::Status => status::report(&link, &local, remote.as_ref()),
        Command::Prune => prune(&config, &local, remote.as_ref()),
    };

    info!("Meter logger shutting down");
    if !ok {
        // exit skips destructors, so flush the log first
        drop(guard);
        std::process::exit(1);
    }
    Ok(())
}

fn run_cycle(
    config: &Config,
    link: &SerialLink,
    local: &CsvBackup,
    remote: Option<&SheetsClient>,
    seed_pk: Option<u64>,
) -> bool {
    let map = match config.load_register_map() {
        Ok(map) => map,
        Err(e) => {
            error!("Cycle failed: {}", e);
            return false;
        }
    };
    if map.is_empty() {
        warn!("Register map {} is empty", config.acquisition.register_map.display());
    }

    let cycle = Cycle {
        link,
        map: &map,
        plan: ReadPlan::from(&config.acquisition),
        local,
        remote,
        seed_pk,
    };
    let now = Local::now().naive_local();
    let now = now.with_nanosecond(0).unwrap_or(now);

    match cycle.run(now) {
        Ok(report) => {
            if report.remote_ok == Some(false) {
                warn!("PK {} is only in the local backup", report.pk);
            }
            true
        }
        Err(e) => {
            error!("Cycle failed: {}", e);
            eprintln!("Cycle failed: {}", e);
            false
        }
    }
}

fn prune(config: &Config, local: &CsvBackup, remote: Option<&SheetsClient>) -> bool {
    let mut ok = true;
    if let Err(e) = retention::prune_local(local, config.backup.keep_files) {
        error!("Pruning local backups failed: {}", e);
        ok = false;
    }
    if let Some(remote) = remote {
        if let Err(e) = retention::prune_remote(remote, config.cloud.keep_tables) {
            error!("Pruning remote tables failed: {}", e);
            ok = false;
        }
    }
    ok
}

fn setup_logging(dir: &Path) -> WorkerGuard {
    // Daily rolling file; the guard flushes it on exit
    let file_appender = rolling::daily(dir, "meter-logger.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_level(true)
        .init();
    guard
}
