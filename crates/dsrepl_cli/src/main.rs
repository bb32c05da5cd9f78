//! dsrepl CLI
//!
//! Command-line tools for dsrepl replication servers.
//!
//! # Commands
//!
//! - `serve` - Run a replication server
//! - `dump-changelog` - Print the changelog records of a domain
//! - `inspect-state` - Display persisted server states
//! - `verify` - Check every changelog segment and state file
//! - `ecl` - Print the external changelog from a cookie

mod commands;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// dsrepl replication server tools.
#[derive(Parser)]
#[command(name = "dsrepl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the server root directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a replication server
    Serve {
        /// Server id (1-65535)
        #[arg(short, long)]
        server_id: u16,

        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:8989")]
        bind: SocketAddr,

        /// Base DN to open at startup (repeatable)
        #[arg(short, long = "domain")]
        domains: Vec<String>,

        /// Base DN to keep out of the external changelog (repeatable)
        #[arg(long = "ecl-exclude")]
        ecl_excluded: Vec<String>,

        /// Seconds before changelog records may be purged
        #[arg(long, default_value = "259200")]
        purge_delay: u64,

        /// Maximum number of concurrent replica sessions
        #[arg(long, default_value = "1000")]
        max_sessions: usize,
    },

    /// Print the changelog records of a domain
    DumpChangelog {
        /// Base DN of the domain
        #[arg(short, long)]
        base_dn: String,

        /// Only records from this replica
        #[arg(short, long)]
        replica: Option<u16>,

        /// Start after this server state (space-separated CSNs)
        #[arg(long)]
        after: Option<String>,

        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display persisted server states
    InspectState {
        /// Only this domain
        #[arg(short, long)]
        base_dn: Option<String>,

        /// Show changelog segments per replica
        #[arg(short, long)]
        segments: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check every changelog segment and state file
    Verify,

    /// Print the external changelog
    Ecl {
        /// Resume after this cookie
        #[arg(short, long)]
        cookie: Option<String>,

        /// Maximum number of records to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            server_id,
            bind,
            domains,
            ecl_excluded,
            purge_delay,
            max_sessions,
        } => {
            let path = cli.path.ok_or("Root path required for serve")?;
            let options = commands::serve::ServeOptions {
                server_id,
                bind,
                domains,
                ecl_excluded,
                purge_delay_secs: purge_delay,
                max_sessions,
            };
            commands::serve::run(&path, options)?;
        }
        Commands::DumpChangelog {
            base_dn,
            replica,
            after,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Root path required for dump-changelog")?;
            commands::dump_changelog::run(
                &path,
                &base_dn,
                replica,
                after.as_deref(),
                limit,
                &format,
            )?;
        }
        Commands::InspectState {
            base_dn,
            segments,
            format,
        } => {
            let path = cli.path.ok_or("Root path required for inspect-state")?;
            commands::inspect_state::run(&path, base_dn.as_deref(), segments, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Root path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Ecl {
            cookie,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Root path required for ecl")?;
            commands::ecl::run(&path, cookie.as_deref(), limit, &format)?;
        }
        Commands::Version => {
            println!("dsrepl CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "replication protocol v{}",
                dsrepl_protocol::PROTOCOL_VERSION
            );
        }
    }

    Ok(())
}
