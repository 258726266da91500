//! BufMon command line
//!
//! Maintenance commands for the state shared between instrumented builds and runs:
//! the identifier checkpoint and the distance segment.

use anyhow::{Context, Result};
use bufmon::checkpoint::{CheckpointLease, IdCounters};
use bufmon::config::DEFAULT_ID_FILE;
use bufmon_rt::channel::{SegmentReader, SharedSegment};
use bufmon_rt::config::SHARED_MEM_SIZE;
use bufmon_rt::RuntimeConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "bufmon", version, about = "Buffer distance monitor utilities")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the next identifiers, or reset them
    Ids {
        #[arg(long, env = "BUFMON_ID_FILE", default_value = DEFAULT_ID_FILE)]
        file: PathBuf,
        /// Restart both counters at 1
        #[arg(long)]
        reset: bool,
    },
    /// Print the distances published in the shared-memory segment
    Dump(SegmentArgs),
    /// Zero the shared-memory segment
    Clear(SegmentArgs),
}

#[derive(clap::Args)]
struct SegmentArgs {
    /// File whose inode derives the segment key
    #[arg(long, env = "BUFMON_SHM_KEY")]
    key: Option<PathBuf>,
    /// Segment size in bytes
    #[arg(long, default_value_t = SHARED_MEM_SIZE)]
    size: usize,
}

impl SegmentArgs {
    fn attach(&self) -> Result<SharedSegment> {
        let config = RuntimeConfig::default();
        let key = self.key.as_ref().unwrap_or(&config.shm_key_path);
        SharedSegment::attach(key, config.shm_project_id, self.size)
            .with_context(|| format!("Could not attach segment for {}", key.display()))
    }
}

fn main() -> ExitCode {
    let log_level = std::env::var("BUFMON_LOG").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Ids { file, reset } => {
            let mut lease = CheckpointLease::acquire(&file);
            if reset {
                lease.counters = IdCounters::default();
                lease.commit()?;
                info!("Reset identifiers in {}", file.display());
            } else {
                println!(
                    "next buffer id: {}\nnext access site id: {}",
                    lease.counters.peek_buffer_id(),
                    lease.counters.peek_site_id()
                );
            }
        }
        Command::Dump(args) => {
            let segment = args.attach()?;
            let mut count = 0usize;
            for distance in SegmentReader::new(segment.as_ref()) {
                println!(
                    "buffer_id: {}, access_site_id: {}, distance: {}",
                    distance.buffer_id, distance.site, distance.distance
                );
                count += 1;
            }
            info!("{} records", count);
        }
        Command::Clear(args) => {
            let mut segment = args.attach()?;
            segment.as_mut().fill(0);
            info!("Cleared {} byte segment", segment.len());
        }
    }
    Ok(())
}
