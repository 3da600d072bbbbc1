#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps,
    dead_code
)]

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};
use xyrelay::codec::{self, Decoded};
use xyrelay::token::TokenOutcome;
use xyrelay::Config;

/// `xyrelay` - keeps marketplace IM sessions online and automates fulfilment.
#[derive(Parser, Debug)]
#[command(name = "xyrelay")]
#[command(version)]
#[command(about = "Marketplace IM relay with auto-delivery and keyword replies.", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run sessions for every enabled account until Ctrl+C
    Run,

    /// Request an access token for one account and print it
    Token {
        /// Account id from config.toml
        #[arg(long)]
        account: String,
    },

    /// Decode a sync push payload (base64 MessagePack) to JSON
    Decode {
        payload: String,
    },

    /// Encode a JSON document as a sync push payload
    Encode {
        json: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Dump the full configuration JSON Schema to stdout
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install default crypto provider for Rustls TLS.
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: Failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.as_os_str().is_empty() {
            bail!("--config-dir cannot be empty");
        }
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Decode { payload } => {
            match codec::decode_payload(&payload) {
                Decoded::Tree(tree) => println!("{}", serde_json::to_string_pretty(&tree)?),
                Decoded::Text(text) => {
                    tracing::warn!("payload is not a MessagePack record; showing raw text");
                    println!("{text}");
                }
            }
            Ok(())
        }
        Commands::Encode { json } => {
            let tree: serde_json::Value = serde_json::from_str(&json)?;
            println!("{}", codec::encode_payload(&tree)?);
            Ok(())
        }
        Commands::Config { config_command } => match config_command {
            ConfigCommands::Schema => {
                let schema = schemars::schema_for!(Config);
                println!("{}", serde_json::to_string_pretty(&schema)?);
                Ok(())
            }
        },
        Commands::Token { account } => {
            let config = Config::load_or_init(cli.config_dir.as_deref()).await?;
            match xyrelay::daemon::issue_token(&config, &account).await? {
                TokenOutcome::Issued(state) => {
                    println!("{}", state.credential);
                    Ok(())
                }
                TokenOutcome::VerificationRequired { url } => {
                    bail!("verification required for {account}: {url}")
                }
            }
        }
        Commands::Run => {
            let config = Config::load_or_init(cli.config_dir.as_deref()).await?;
            xyrelay::daemon::run(config).await
        }
    }
}
