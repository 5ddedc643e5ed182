//! CLI for the nacl-host loader process host.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

#[cfg(unix)]
mod launch;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use nacl_host::HostConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nacl-host", version, about = "Launch sandboxed native-code loaders")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a loader and echo a line through its data sockets.
    #[cfg(unix)]
    Launch(Box<launch::LaunchArgs>),

    /// Display the resolved runtime image and host limits.
    Info {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for info commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = Cli::parse().dispatch().await {
        eprintln!("nacl-host: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            #[cfg(unix)]
            Command::Launch(args) => args.run().await,
            Command::Info { format } => info(format),
            Command::Completion { shell } => {
                clap_complete::generate(
                    shell,
                    &mut Self::command(),
                    "nacl-host",
                    &mut std::io::stdout(),
                );
                Ok(())
            }
        }
    }
}

fn info(format: OutputFormat) -> Result<()> {
    let config = HostConfig::from_env();
    let image = nacl_host::image::resolve_path(config.irt_path_override(), config.install_dir_path());
    let exists = image.as_deref().is_some_and(std::path::Path::is_file);

    if matches!(format, OutputFormat::Json) {
        let obj = serde_json::json!({
            "arch": nacl_host::image::ARCH,
            "runtime_image": image,
            "runtime_image_present": exists,
            "loader": config.loader_path(),
            "max_sockets": nacl_host::MAX_SOCKETS,
            "exception_handling": config.exception_handling_enabled(),
            "version": config.version_string(),
        });
        println!("{}", serde_json::to_string_pretty(&obj)?);
        return Ok(());
    }

    println!("arch:       {}", nacl_host::image::ARCH);
    match &image {
        Some(path) if exists => println!("image:      {}", path.display()),
        Some(path) => println!("image:      {} (missing)", path.display()),
        None => println!("image:      unresolved"),
    }
    match config.loader_path() {
        Some(path) => println!("loader:     {}", path.display()),
        None => println!("loader:     unresolved"),
    }
    println!("sockets:    at most {}", nacl_host::MAX_SOCKETS);
    println!(
        "exceptions: {}",
        if config.exception_handling_enabled() { "enabled" } else { "disabled" }
    );
    println!("version:    {}", config.version_string());
    Ok(())
}
