use clap::{Parser, Subcommand};
use log::{error, info};
use processc::config::{DEFAULT_CONFIG_PATH, ProjectStore};
use processc::monitor::{DEFAULT_OUTPUT_DIR, RunOptions, run_project};
use processc::utils::errors::MonitoringError;
use processc::utils::logger;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "processc")]
#[command(version)]
#[command(about = "Energy and carbon emission tracking for process-based models")]
struct Cli {
    /// Project configuration store
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: SubCmd,
}

#[derive(Subcommand)]
enum SubCmd {
    /// List configured projects
    List,

    /// Print one project's configuration
    Show { project: String },

    /// Monitor one run of a project and write its report
    Run(RunArgs),
}

#[derive(Parser)]
struct RunArgs {
    project: String,

    /// Directory for the report CSV
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// Directory for the CPU and GPU sampling logs
    #[arg(long, default_value = ".")]
    log_dir: PathBuf,

    /// Estimate CPU energy from the configured TDP when no power logger is installed
    #[arg(long)]
    tdp_fallback: bool,
}

async fn execute(cli: Cli) -> Result<(), MonitoringError> {
    let store = ProjectStore::load(&cli.config)?;
    match cli.command {
        SubCmd::List => {
            for (i, name) in store.project_names().iter().enumerate() {
                println!("{}: '{}'", i + 1, name);
            }
        }
        SubCmd::Show { project } => {
            println!("{}", serde_json::to_string_pretty(store.project(&project)?)?);
        }
        SubCmd::Run(args) => {
            let project = store.project(&args.project)?;
            let options = RunOptions {
                log_dir: args.log_dir,
                output_dir: args.output_dir,
                tdp_fallback: args.tdp_fallback,
            };
            let report = run_project(project, &options).await?;
            report.print()?;
            report.write_csv(&options.output_dir)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    logger::setup_logger();
    info!("Application started");

    if let Err(e) = execute(Cli::parse()).await {
        error!("{}", e);
        std::process::exit(1);
    }
    info!("Program ended successfully.");
}
