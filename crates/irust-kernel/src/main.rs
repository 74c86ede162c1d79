//! irust-kernel CLI entry point.
//!
//! Jupyter launches `irust-kernel run --connection-file {connection_file}`;
//! `console` drives the same dispatcher from the terminal.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use irust_kernel::bridge::{Protocol, Transport};
use irust_kernel::kernel::{self, KernelServer};
use irust_kernel::settings::{self, KernelSettings};

#[derive(Parser, Debug)]
#[command(name = "irust-kernel")]
#[command(about = "Jupyter kernel for the IRust interpreter")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Settings file (default: <config dir>/irust-kernel/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve a notebook over the Jupyter protocol
    Run {
        /// Connection file written by the Jupyter server
        #[arg(long, short = 'f')]
        connection_file: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Evaluate stdin line by line, one line per cell
    Console {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Print the effective settings as JSON
    Settings {
        /// Write the effective settings back to the settings file
        #[arg(long)]
        save: bool,

        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Per-invocation overrides of the settings file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Interpreter protocol
    #[arg(long, value_enum)]
    protocol: Option<Protocol>,

    /// Path to the `re` interpreter
    #[arg(long)]
    interpreter: Option<PathBuf>,

    /// Evaluation timeout in seconds (0 disables it)
    #[arg(long)]
    timeout: Option<u64>,
}

impl Overrides {
    fn apply(self, settings: &mut KernelSettings) {
        if let Some(protocol) = self.protocol {
            settings.protocol = protocol;
        }
        if let Some(interpreter) = self.interpreter {
            settings.interpreter = Some(interpreter);
        }
        if let Some(timeout) = self.timeout {
            settings.eval_timeout_secs = Some(timeout);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let settings_path = cli.settings.unwrap_or_else(settings::settings_path);
    let mut settings = settings::load_settings(&settings_path);

    match cli.command {
        Some(Commands::Run {
            connection_file,
            overrides,
        }) => {
            overrides.apply(&mut settings);
            run_kernel(connection_file, &settings).await
        }
        Some(Commands::Console { overrides }) => {
            overrides.apply(&mut settings);
            run_console(&settings).await
        }
        Some(Commands::Settings { save, overrides }) => {
            overrides.apply(&mut settings);
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if save {
                settings::save_settings(&settings_path, &settings)?;
                eprintln!("Saved to {}", settings_path.display());
            }
            Ok(())
        }
        None => {
            anyhow::bail!("No command given; Jupyter starts the kernel with `irust-kernel run --connection-file <file>`")
        }
    }
}

async fn run_kernel(connection_file: PathBuf, settings: &KernelSettings) -> Result<()> {
    info!("[kernel] irust-kernel {} starting", irust_kernel::KERNEL_VERSION);
    info!("[kernel] Connection file: {:?}", connection_file);

    let connection_info = kernel::read_connection_file(&connection_file).await?;
    let dispatcher = kernel::start_dispatcher(settings)?;

    KernelServer::new(connection_info, dispatcher).run().await
}

async fn run_console(settings: &KernelSettings) -> Result<()> {
    let mut dispatcher = kernel::start_dispatcher(settings)?;
    info!(
        "[console] Using {} protocol",
        dispatcher.transport().protocol()
    );

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = std::io::stdout();
    let result = irust_kernel::console::run(&mut dispatcher, stdin, &mut stdout)
        .await
        .context("console session failed");

    dispatcher.shutdown().await;
    result
}
