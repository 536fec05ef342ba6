use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use mkbridge::{Binding, BridgeConfig, LoopbackLibrary, NetTest, TestKind};

#[derive(Parser)]
#[command(
    name = "mkbridge",
    about = "Drive native network-measurement tests and collect their entries",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the native library and bindings versions
    Version,

    /// List the test kinds the native library can run
    Kinds,

    /// Configure and run one test, printing its entries
    Run {
        /// Test kind (e.g. tcp_connect, web-connectivity)
        kind: String,

        /// Test option as key=value (repeatable)
        #[arg(short = 'o', long = "option", value_parser = parse_key_value)]
        options: Vec<(String, String)>,

        /// File to read test inputs from, one per line
        #[arg(long)]
        input: Option<PathBuf>,

        /// File to append the report entries to
        #[arg(long)]
        output: Option<PathBuf>,

        /// Increase native log verbosity (repeatable)
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,

        /// Ask the native library for JSON log lines
        #[arg(long)]
        json_log: bool,

        /// Start from the kind's preset options
        #[arg(long)]
        preset: bool,

        /// Execution mode
        #[arg(long, value_enum, default_value_t = Mode::Deferred)]
        mode: Mode,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Blocking,
    Async,
    Deferred,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

fn print_entry(raw: &str) {
    match mkbridge::decode_entry(raw) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{}", pretty),
            Err(_) => println!("{}", raw),
        },
        Err(e) => tracing::warn!(error = %e, "skipping malformed entry"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::load_or_default(),
    };
    mkbridge::telemetry::init(&config.logging)?;

    let binding = Binding::with_config(Arc::new(LoopbackLibrary::new()), &config)
        .context("failed to load native library")?;

    match cli.command {
        Commands::Version => {
            println!("mkbridge {}", env!("CARGO_PKG_VERSION"));
            println!("native library {}", binding.library_version());
            println!("combined {}", binding.version());
        }
        Commands::Kinds => {
            for kind in TestKind::ALL {
                println!("{:<28} {}", kind.native_name(), kind.description());
            }
        }
        Commands::Run {
            kind,
            options,
            input,
            output,
            verbose,
            json_log,
            preset,
            mode,
        } => {
            let kind: TestKind = kind.parse()?;
            let mut test = if preset {
                binding.preset(kind)?
            } else {
                binding.create(kind)?
            };
            for (key, value) in options {
                test.set_option(key, value)?;
            }
            if let Some(path) = &input {
                test.set_input_path(path)?;
            }
            if let Some(path) = &output {
                test.set_output_path(path)?;
            }
            for _ in 0..verbose {
                test.increase_verbosity()?;
            }
            if json_log {
                let verbosity = test.config().verbosity.with_json(true);
                test.set_verbosity(verbosity)?;
            }
            tracing::info!(%kind, ?mode, "running test");
            run(test, mode).await?;
        }
    }

    Ok(())
}

async fn run(mut test: NetTest, mode: Mode) -> Result<()> {
    match mode {
        Mode::Blocking => {
            test.on_entry(print_entry)?;
            tokio::task::spawn_blocking(move || test.run())
                .await
                .context("blocking run panicked")??;
        }
        Mode::Async => {
            test.on_entry(print_entry)?;
            let (tx, rx) = tokio::sync::oneshot::channel();
            test.run_async(move || {
                let _ = tx.send(());
            })?;
            rx.await.context("test never completed")?;
        }
        Mode::Deferred => {
            let outcome = test.run_deferred()?.await?;
            for entry in &outcome.entries {
                println!("{}", serde_json::to_string_pretty(entry)?);
            }
            for error in &outcome.errors {
                tracing::warn!(%error, "entry could not be decoded");
            }
        }
    }
    Ok(())
}
