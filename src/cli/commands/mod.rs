//! CLI parser and dispatch to command modules.

mod detect;
mod import;
mod init;
mod process;
mod status;
mod template;
mod work;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::helpers::parse_rect;
use crate::config::{load_settings_with_options, LoadOptions};
use crate::models::Rect;

#[derive(Parser)]
#[command(name = "drawmeta")]
#[command(about = "Drawing set ingestion and title-block metadata extraction")]
#[command(version)]
pub struct Cli {
    /// Target data directory (overrides config file).
    #[arg(long, short = 't', global = true)]
    target: Option<PathBuf>,

    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Resolve relative paths from current working directory instead of config file location
    #[arg(long, global = true)]
    cwd: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and database
    Init,

    /// Store a drawing set PDF and queue it for processing
    Import {
        /// PDF file to import
        pdf: PathBuf,
        /// Project the set belongs to
        #[arg(short, long)]
        project: i32,
        /// Display name (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Queue a drawing set for rendering again
    Process {
        /// Drawing set ID
        set_id: i32,
    },

    /// Queue metadata extraction for one sheet
    Extract {
        /// Sheet ID
        sheet_id: i32,
        /// Template to use instead of automatic matching
        #[arg(long)]
        template: Option<i32>,
    },

    /// Queue extraction again for failed and review sheets of a set
    Retry {
        /// Drawing set ID
        set_id: i32,
        /// Include sheets that already succeeded
        #[arg(long)]
        force: bool,
    },

    /// Link extracted sheets that are missing from their drawing's revision history
    Relink {
        /// Drawing set ID
        set_id: i32,
    },

    /// Run queued jobs
    Work {
        /// Concurrent jobs (default: from config)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Keep polling for new jobs
        #[arg(long)]
        daemon: bool,
        /// Seconds between polls in daemon mode (default: from config)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Show a drawing set's progress and extracted sheets
    Status {
        /// Drawing set ID
        set_id: i32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage title-block templates
    Template {
        #[command(subcommand)]
        command: TemplateCommands,
    },

    /// List text lines detected on a sheet
    DetectText {
        /// Sheet ID
        sheet_id: i32,
        /// Region to read as x,y,w,h (fractions of the page; default: whole page)
        #[arg(long, value_parser = parse_rect)]
        region: Option<Rect>,
    },
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// Add a template
    Add {
        #[arg(short, long)]
        project: i32,
        #[arg(short, long)]
        name: String,
        /// Title-block region as x,y,w,h (fractions of the page)
        #[arg(long, value_parser = parse_rect)]
        crop: Rect,
        /// Only match pages with this orientation
        #[arg(long, value_parser = ["landscape", "portrait"])]
        orientation: Option<String>,
        /// Only match pages of this rendered size, e.g. 7000x4950
        #[arg(long)]
        size_bucket: Option<String>,
        /// Labels expected inside the title block (comma separated)
        #[arg(long, value_delimiter = ',')]
        anchors: Vec<String>,
        /// JSON file mapping field names to regions inside the crop
        #[arg(long)]
        field_mappings: Option<PathBuf>,
    },
    /// List a project's templates
    List {
        #[arg(short, long)]
        project: i32,
    },
    /// Show how templates score against a sheet
    Match {
        /// Sheet ID
        sheet_id: i32,
    },
    /// Delete a template
    Delete {
        /// Template ID
        id: i32,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        use_cwd: cli.cwd,
        target: cli.target,
    };
    let (settings, _config) = load_settings_with_options(options).await;

    match cli.command {
        Commands::Init => init::cmd_init(&settings).await,
        Commands::Import { pdf, project, name } => {
            import::cmd_import(&settings, &pdf, project, name.as_deref()).await
        }
        Commands::Process { set_id } => process::cmd_process(&settings, set_id).await,
        Commands::Extract { sheet_id, template } => {
            process::cmd_extract(&settings, sheet_id, template).await
        }
        Commands::Retry { set_id, force } => process::cmd_retry(&settings, set_id, force).await,
        Commands::Relink { set_id } => process::cmd_relink(&settings, set_id).await,
        Commands::Work {
            workers,
            daemon,
            interval,
        } => {
            let workers = workers.unwrap_or(settings.workers);
            let interval = interval.unwrap_or(settings.poll_interval_secs);
            work::cmd_work(&settings, workers, daemon, interval).await
        }
        Commands::Status { set_id, json } => status::cmd_status(&settings, set_id, json).await,
        Commands::Template { command } => match command {
            TemplateCommands::Add {
                project,
                name,
                crop,
                orientation,
                size_bucket,
                anchors,
                field_mappings,
            } => {
                template::cmd_template_add(
                    &settings,
                    template::NewTemplate {
                        project,
                        name,
                        crop,
                        orientation,
                        size_bucket,
                        anchors,
                        field_mappings,
                    },
                )
                .await
            }
            TemplateCommands::List { project } => {
                template::cmd_template_list(&settings, project).await
            }
            TemplateCommands::Match { sheet_id } => {
                template::cmd_template_match(&settings, sheet_id).await
            }
            TemplateCommands::Delete { id } => template::cmd_template_delete(&settings, id).await,
        },
        Commands::DetectText { sheet_id, region } => {
            detect::cmd_detect_text(&settings, sheet_id, region).await
        }
    }
}
