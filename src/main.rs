use rust_archiver::cli::{Cli, Commands};
use rust_archiver::commands;
use rust_archiver::error::Result;
use rust_archiver::logger;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse_args();

    // Initialize logging system
    logger::init(args.verbose, args.log_json)?;

    debug!("rustarchiver starting");

    match run(args).await {
        Ok(_) => {
            info!("Operation completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Operation failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Cli) -> Result<()> {
    let config = args.config;
    let inventory = args.inventory;
    match args.command {
        Commands::Check { detailed } => commands::check::execute(config, detailed).await,

        Commands::Plan { root, set, fs, json } => {
            commands::plan::execute(config, inventory, root, fs, set, json).await
        }

        Commands::Volumes { set, json } => commands::volumes::execute(config, inventory, set, json).await,

        Commands::Run {
            root,
            set,
            fs,
            file_delay,
            timeout,
            directives,
        } => {
            commands::run::execute(config, inventory, root, fs, set, file_delay, timeout, directives).await
        }
    }
}
