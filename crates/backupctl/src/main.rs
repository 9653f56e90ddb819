//! backupctl: scheduled backup jobs with notifications
//!
//! Subcommands:
//! - `register`, `remove`, `enable`, `disable`: manage jobs and their crontab lines
//! - `status`: check the registry against the crontab, optionally repair
//! - `run`: execute a job (invoked by cron), log it and send notifications
//! - `inspect`, `validate`: look at jobs and plan documents

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use backupctl_notify::Dispatcher;
use backupctl_scheduler::JobStatus;
use clap::{ArgAction, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod admin;
mod inspect;
mod plan;
mod reporter;
mod run;
mod settings;

use reporter::Reporter;
use run::RunOptions;
use settings::Settings;

#[derive(Parser)]
#[command(name = "backupctl")]
#[command(about = "Schedule backup jobs and report how they went", long_about = None)]
struct Cli {
    /// Directory holding the registry, plans and logs [default: ~/.backups]
    #[arg(long, global = true, env = "BACKUPCTL_HOME")]
    home: Option<PathBuf>,

    /// Program used to read and install the crontab
    #[arg(long, global = true, env = "BACKUPCTL_CRONTAB", default_value = "crontab")]
    crontab: PathBuf,

    /// Command written into crontab lines to run a job [default: this executable]
    #[arg(long, global = true, env = "BACKUPCTL_RUN_COMMAND")]
    run_command: Option<PathBuf>,

    /// Seconds to wait for another backupctl editing the crontab
    #[arg(long, global = true, env = "BACKUPCTL_LOCK_TIMEOUT_SECS", default_value = "10")]
    lock_timeout: u64,

    /// More diagnostics on stderr (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a job from a plan document, or update its schedule
    Register {
        /// Plan document (JSON)
        plan: PathBuf,

        /// Cron schedule: five fields or a macro such as @daily
        #[arg(long, short)]
        schedule: String,
    },

    /// Remove jobs, their crontab lines, plans and default log folders
    Remove {
        /// Jobs to remove; all when omitted
        targets: Vec<String>,
    },

    /// Enable jobs
    Enable {
        /// Jobs to enable; all when omitted
        targets: Vec<String>,
    },

    /// Disable jobs without removing them
    Disable {
        /// Jobs to disable; all when omitted
        targets: Vec<String>,
    },

    /// Check that the crontab matches the registry
    Status {
        /// Repair without asking
        #[arg(long)]
        apply: bool,
    },

    /// Run a registered job now
    Run {
        target: String,

        /// Pass --dry-run to the transfer command
        #[arg(long)]
        dry_run: bool,

        /// Print the result instead of sending notifications
        #[arg(long)]
        no_notify: bool,

        /// Do not write a run log
        #[arg(long)]
        no_log: bool,
    },

    /// Show details of registered jobs
    Inspect {
        /// Jobs to show; all when omitted
        targets: Vec<String>,
    },

    /// Check a plan document without registering it
    Validate {
        plan: PathBuf,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "backupctl=info,backupctl_scheduler=info,backupctl_notify=info",
        _ => "backupctl=debug,backupctl_scheduler=debug,backupctl_notify=debug",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default.to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = Settings::new(
        cli.home,
        cli.crontab,
        cli.run_command,
        Duration::from_secs(cli.lock_timeout),
    )?;
    let manager = settings.manager();
    let mut reporter = Reporter::stdio();

    let ok = match cli.command {
        Commands::Register { plan, schedule } => {
            admin::register(&settings, &manager, &mut reporter, &plan, &schedule).await?
        }
        Commands::Remove { targets } => {
            admin::remove(&settings, &manager, &mut reporter, &targets).await?
        }
        Commands::Enable { targets } => {
            admin::set_status(&manager, &mut reporter, &targets, JobStatus::Enabled).await?
        }
        Commands::Disable { targets } => {
            admin::set_status(&manager, &mut reporter, &targets, JobStatus::Disabled).await?
        }
        Commands::Status { apply } => {
            admin::status(&settings, &manager, &mut reporter, apply).await?
        }
        Commands::Run {
            target,
            dry_run,
            no_notify,
            no_log,
        } => {
            let dispatcher = Dispatcher::standard().map_err(|e| miette::miette!("{}", e))?;
            let options = RunOptions {
                dry_run,
                notify: !no_notify,
                log: !no_log,
            };
            run::run(&settings, &manager, &mut reporter, &dispatcher, &target, options).await?
        }
        Commands::Inspect { targets } => {
            inspect::inspect(&settings, &manager, &mut reporter, &targets).await?
        }
        Commands::Validate { plan } => inspect::validate(&mut reporter, &plan).await?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
