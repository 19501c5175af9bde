pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write logs to this file in addition to the console
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Quick compliance scan of a site's entry page or an explicit page list
    Scan {
        /// Site URL to scan
        #[arg(required = true)]
        url: String,

        /// Specific pages to scan; repeatable. Defaults to the entry page
        #[arg(short, long = "page")]
        pages: Vec<String>,

        /// Configuration profile to use
        #[arg(long)]
        profile: Option<String>,

        /// Concurrent page loads
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Full-site scan with link discovery, checkpointing and resume
    DeepScan {
        /// Site URL to scan
        #[arg(required = true)]
        url: String,

        /// Configuration profile to use
        #[arg(long)]
        profile: Option<String>,

        /// Maximum pages to scan
        #[arg(short, long)]
        max_pages: Option<usize>,

        /// Pages per checkpointed chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Resume the crawl with this job ID from its checkpoint
        #[arg(short, long)]
        resume: Option<String>,

        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the scheduler daemon: fires schedules and watches for changes
    Daemon {
        /// Configuration profile to use
        #[arg(long)]
        profile: Option<String>,
    },

    /// Show schedule execution history
    History {
        /// Limit to one schedule
        #[arg(required = false)]
        schedule_id: Option<String>,

        /// Maximum entries to show
        #[arg(short, long, default_value = "20")]
        limit: i64,

        /// Show aggregate stats instead of individual runs
        #[arg(short, long)]
        stats: bool,

        /// Configuration profile to use
        #[arg(long)]
        profile: Option<String>,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Scan {
            url,
            pages,
            profile,
            concurrency,
            output,
        } => {
            info!("Starting quick scan of {}", url);
            commands::scan(url, pages, profile, concurrency, output).await
        }
        Commands::DeepScan {
            url,
            profile,
            max_pages,
            chunk_size,
            resume,
            output,
        } => {
            info!("Starting deep scan of {}", url);
            commands::deep_scan(url, profile, max_pages, chunk_size, resume, output).await
        }
        Commands::Daemon { profile } => {
            info!("Starting scheduler daemon");
            commands::daemon(profile).await
        }
        Commands::History {
            schedule_id,
            limit,
            stats,
            profile,
        } => commands::history(schedule_id, limit, stats, profile).await,
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles().await
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name).await
            } else {
                info!("Showing current configuration");
                commands::show_config().await
            }
        }
    }
}
