use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use toolbridge::app::{handle_fatal_error, init_logging, AppConfig};
use toolbridge::config::load_config;
use toolbridge::subprocess::{RunOptions, StreamOptions, ToolCommand, ToolCommandBuilder};
use toolbridge::ToolClient;

/// Drive an external command-line tool through a persistent worker process
#[derive(Parser)]
#[command(name = "toolbridge")]
#[command(about = "Run commands against a long-lived tool worker", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Tool executable to drive, overriding the configuration
    #[arg(long, global = true)]
    tool: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on the persistent worker
    Run {
        /// Command words, e.g. `resolve queries`
        #[arg(required = true)]
        words: Vec<String>,

        /// Ask for JSON output and pretty-print it
        #[arg(long)]
        json: bool,

        /// Arguments passed after `--`
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Run a command in its own process
    Exec {
        words: Vec<String>,

        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Run a command in its own process and print each NUL-delimited JSON
    /// record on its own line
    Stream {
        words: Vec<String>,

        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Print the tool version
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let app = AppConfig::new(cli.verbose)
        .with_config_path(cli.config)
        .with_tool_path(cli.tool);
    init_logging(&app);

    if let Err(e) = run(cli.command, &app).await {
        handle_fatal_error(e, app.verbose);
    }
}

async fn run(command: Commands, app: &AppConfig) -> anyhow::Result<()> {
    let mut config = load_config(app.config_path.as_deref())
        .await
        .context("Failed to load configuration")?;
    if let Some(tool) = &app.tool_path {
        config.tool_path = tool.clone();
    }
    debug!("Driving {}", config.tool_path.display());

    let client = ToolClient::new(config);
    let result = dispatch(&client, command).await;
    client.shutdown().await;
    result
}

async fn dispatch(client: &ToolClient, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run { words, json, args } => {
            let command = build_command(&words, &args);
            if json {
                let value: serde_json::Value = client.run_json(command).await?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                print!("{}", client.run(command).await?);
            }
        }
        Commands::Exec { words, args } => {
            let options = RunOptions::default().with_cancellation(interrupt_token());
            let output = client
                .run_ephemeral(&build_command(&words, &args), options)
                .await?;
            print!("{output}");
        }
        Commands::Stream { words, args } => {
            let options = StreamOptions {
                cancellation: Some(interrupt_token()),
                silent: false,
            };
            let mut events = client
                .stream::<serde_json::Value>(&build_command(&words, &args), options)
                .await?;
            while let Some(event) = events.next().await {
                println!("{}", serde_json::to_string(&event?)?);
            }
        }
        Commands::Version => {
            println!("{}", client.version().await?);
        }
    }
    Ok(())
}

fn build_command(words: &[String], args: &[String]) -> ToolCommand {
    ToolCommandBuilder::new(words).args(args).build()
}

/// Cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let on_interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });
    token
}
