use std::io::Read as _;

use clap::{Parser, Subcommand};
use tracing::info;

use vgpu_core::RuntimeConfig;
use vgpu_server::Workspace;

#[derive(Parser)]
#[command(name = "vgpu")]
#[command(about = "VGPU - GPU API virtualization runtime with live checkpoint and migration")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the workspace daemon (transport attaches to this process).
    Serve {
        /// Configuration file path
        #[arg(short, long, default_value = "vgpu.toml")]
        config: String,
    },

    /// Print the effective configuration after file and environment merge.
    DumpConfig {
        /// Configuration file path
        #[arg(short, long, default_value = "vgpu.toml")]
        config: String,
    },
}

fn main() {
    vgpu_common::logging::init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let config = RuntimeConfig::load_or_default(&config);
            info!(?config, "starting workspace");
            let workspace = Workspace::with_sim_driver(config);

            // The transport layer owns the listening socket and calls
            // `workspace.process` per frame; standalone runs just hold the
            // workspace open until stdin closes, then drain.
            info!("workspace up; close stdin to stop");
            let mut sink = Vec::new();
            let _ = std::io::stdin().read_to_end(&mut sink);

            workspace.shutdown();
            info!("workspace drained, bye");
        }

        Commands::DumpConfig { config } => {
            let config = RuntimeConfig::load_or_default(&config);
            match toml::to_string_pretty(&config) {
                Ok(text) => println!("{text}"),
                Err(err) => eprintln!("config serialization failed: {err}"),
            }
        }
    }
}
