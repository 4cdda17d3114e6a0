//! photoid CLI - operator entry points for identity resolution over a
//! local redb database.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

/// photoid - find the people in a photo library.
///
/// Faces come from an upstream detector as JSON lines. The database keeps
/// faces, people, photo associations and dismissed merge pairs.
#[derive(Parser)]
#[command(name = "photoid")]
#[command(about = "Identity resolution for a personal photo library")]
#[command(version)]
pub struct Cli {
    /// Database file
    #[arg(long, global = true, default_value = "photoid.redb")]
    pub db: String,

    /// Engine config file (YAML)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Output as JSON (for piping)
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Import detected faces from a JSON-lines file ("-" for stdin)
    Ingest {
        file: String,
    },
    /// Assign unlabeled faces to existing people
    Match {
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Create placeholder people from unlabeled faces
    Discover {
        #[arg(long)]
        eps: Option<f32>,
        #[arg(long)]
        min_samples: Option<usize>,
    },
    /// List likely duplicate people
    Suggest {
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Fold SOURCE into TARGET
    Merge {
        source: String,
        target: String,
    },
    /// Never suggest merging A and B again
    Dismiss {
        a: String,
        b: String,
    },
    /// Run the full pass: match, discover, sync, suggest, auto-merge
    Cluster {
        /// Report planned auto-merges without executing them
        #[arg(long)]
        dry_run: bool,
    },
    /// List people
    People {
        /// Include hidden people
        #[arg(long)]
        hidden: bool,
    },
    /// People who look like the given person
    Similar {
        id: String,
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Check a person's faces, photos and avatar for consistency
    Diagnose {
        id: String,
    },
    /// Delete a person and return its faces to the unlabeled pool
    Release {
        id: String,
    },
    /// Hide a person from listings and suggestions
    Hide {
        id: String,
    },
    Unhide {
        id: String,
    },
    Star {
        id: String,
    },
    Unstar {
        id: String,
    },
    Rename {
        id: String,
        name: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    commands::run(&cli)
}
