use std::path::PathBuf;

use anyhow::{Context, Result};
use autopin::config::{AutopinConfig, DEFAULT_CONFIG_FILE};
use autopin::data_logger::ExternalLogger;
use autopin::os::OsServices;
use autopin::os::proc_fs::ProcEnumerator;
use autopin::{ErrorKind, ObservedProcess, ProcessEvent, ProcessTree, StaticPinning};
use clap::{Args, Parser, Subcommand};
use log::info;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser, Debug)]
#[command(name = "autopin")]
#[command(version, about = "Pin the threads of an application to CPU cores", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start or attach to the configured process and pin its threads until it exits
    Run(RunArgs),
    /// Print the process tree of a running process as JSON
    Tree {
        /// Root of the tree
        pid: i32,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the configuration file
    #[arg(short, long, env = "AUTOPIN_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_observed(args).await,
        Commands::Tree { pid } => print_tree(pid),
    }
}

async fn run_observed(args: RunArgs) -> Result<()> {
    let config = AutopinConfig::load_from_path(&args.config).context(format!(
        "Failed to load the configuration at {}",
        args.config.display()
    ))?;

    let mut os = OsServices::init().context("Failed to initialize the OS services")?;
    let mut process = ObservedProcess::init(&config.process, os.enumerator())?;
    let mut events = process.subscribe();
    let pinning = StaticPinning::new(config.pinning.clone());

    let logger = config
        .external_logger
        .clone()
        .map(|logger_config| ExternalLogger::spawn(logger_config, Vec::new()))
        .transpose()
        .context("Failed to start the external data logger")?;

    let result = observe(
        &mut os,
        &mut process,
        &mut events,
        &pinning,
        logger.as_ref(),
    )
    .await;
    process.deinit(&mut os);
    result
}

async fn run_logger(logger: Option<&ExternalLogger>) -> autopin::Result<()> {
    match logger {
        Some(logger) => logger.run().await,
        None => std::future::pending().await,
    }
}

async fn observe(
    os: &mut OsServices,
    process: &mut ObservedProcess,
    events: &mut UnboundedReceiver<ProcessEvent>,
    pinning: &StaticPinning,
    logger: Option<&ExternalLogger>,
) -> Result<()> {
    process
        .start(os)
        .await
        .context("Failed to start the observed process")?;

    let logging = run_logger(logger);
    tokio::pin!(logging);

    loop {
        while let Ok(event) = events.try_recv() {
            pinning.handle_event(&event, process, os.enumerator());
        }

        tokio::select! {
            event = os.next_event() => {
                match process.handle_os_event(event?) {
                    Err(e) if e.kind() == ErrorKind::Process && e.tag() == "terminated" => {
                        info!("{}", e.message());
                        return Ok(());
                    }
                    handled => handled?,
                }
            }
            logged = &mut logging => {
                logged.context("The external data logger failed")?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, releasing process {}", process.pid());
                return Ok(());
            }
        }
    }
}

fn print_tree(pid: i32) -> Result<()> {
    let tree = ProcessTree::build(&ProcEnumerator::new(), pid)
        .context(format!("Could not determine the process tree of {pid}"))?;
    println!("{}", tree.to_json()?);
    Ok(())
}
