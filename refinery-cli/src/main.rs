//! Refinery CLI: import datasets, preview and apply cleaning pipelines,
//! manage recipes, and export pipelines as code.

mod commands;

use clap::Parser;
use refinery_core::export::ExportTarget;
use refinery_core::recipes::Visibility;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Refinery: composable data-cleaning pipelines with versioned apply
#[derive(Parser, Debug)]
#[command(name = "refinery", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Import and inspect dataset versions
    Dataset {
        #[command(subcommand)]
        action: DatasetAction,
    },
    /// Browse the transformation catalog
    Transforms {
        #[command(subcommand)]
        action: TransformsAction,
    },
    /// Check a pipeline against its source version's schema
    Validate {
        /// Pipeline file (JSON or refinery script)
        pipeline: PathBuf,
        /// Source version, required for scripts and overriding JSON files
        #[arg(long)]
        source: Option<String>,
    },
    /// Run a pipeline on a sample without committing anything
    Preview {
        /// Pipeline file (JSON or refinery script)
        pipeline: PathBuf,
        /// Sample size (default and cap come from config)
        #[arg(long)]
        rows: Option<usize>,
        #[arg(long)]
        source: Option<String>,
    },
    /// Run a pipeline over the full dataset and commit a new version
    Apply {
        /// Pipeline file (JSON or refinery script)
        pipeline: PathBuf,
        /// Identity recorded on the lineage edge
        #[arg(short, long)]
        user: String,
        /// Name of the new version (defaults to the source's name)
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        source: Option<String>,
    },
    /// Export a pipeline as code
    Export {
        /// Pipeline file (JSON or refinery script)
        pipeline: PathBuf,
        /// Output format: pandas or script
        #[arg(short, long, default_value = "pandas")]
        target: ExportTarget,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        source: Option<String>,
    },
    /// Manage reusable recipes
    Recipe {
        #[command(subcommand)]
        action: RecipeAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum DatasetAction {
    /// Import a JSON array or JSON Lines file as a new root version
    Import {
        file: PathBuf,
        #[arg(short, long)]
        name: String,
    },
    /// List every version
    List,
    /// Show a version's schema and statistics
    Show {
        id: String,
        /// Also print the first N rows
        #[arg(long)]
        head: Option<usize>,
    },
    /// Show the ancestry and children of a version
    Lineage {
        id: String,
    },
    /// Verify that versions form a tree with intact hash chains
    Verify,
}

#[derive(clap::Subcommand, Debug)]
enum TransformsAction {
    /// List every transformation type by category
    List,
    /// Show the parameters of one transformation type
    Show { id: String },
}

#[derive(clap::Subcommand, Debug)]
enum RecipeAction {
    /// Create a recipe from a pipeline file or from the pipeline that produced a version
    Create {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        user: String,
        #[arg(long, conflicts_with = "from_version")]
        pipeline: Option<PathBuf>,
        #[arg(long)]
        from_version: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "private")]
        visibility: Visibility,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// List recipes
    List {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        public: bool,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long, default_value = "1")]
        page: usize,
        #[arg(long, default_value = "20")]
        per_page: usize,
    },
    /// Show a recipe
    Show { id: String },
    /// Apply a recipe to a dataset version
    Apply {
        id: String,
        #[arg(long)]
        version: String,
        #[arg(short, long)]
        user: String,
    },
    /// Create a revised copy of a recipe with new steps
    Revise {
        id: String,
        #[arg(long)]
        pipeline: PathBuf,
        #[arg(short, long)]
        user: String,
    },
    /// Change a recipe's name, description, visibility, or tags (owner only)
    Update {
        id: String,
        #[arg(short, long)]
        user: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        visibility: Option<Visibility>,
        /// Replaces all tags
        #[arg(long = "tag")]
        tags: Option<Vec<String>>,
    },
    /// Delete a recipe (owner only)
    Delete {
        id: String,
        #[arg(short, long)]
        user: String,
    },
    /// Rate a recipe from 1 to 5
    Rate {
        id: String,
        #[arg(short, long)]
        user: String,
        #[arg(long)]
        score: u8,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default configuration file in the workspace
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "refinery", "refinery")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "refinery.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace).await
}
