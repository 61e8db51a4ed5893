use clap::{Parser, Subcommand};
use msgscript::config::AppConfig;
use msgscript::supervisor::Supervisor;
use msgscript::telemetry;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the broker server.
    Run {
        /// Storage backend to use (etcd, file, memory).
        #[arg(short, long)]
        backend: Option<String>,

        /// Comma-separated etcd endpoints.
        #[arg(long)]
        kv_endpoints: Option<String>,

        /// URL of the bus server.
        #[arg(long)]
        bus_url: Option<String>,

        /// HTTP port the gateway binds to.
        #[arg(short, long)]
        port: Option<u16>,

        /// Script directory for the file backend.
        #[arg(long)]
        script_dir: Option<String>,

        /// Library directory for the file backend.
        #[arg(long)]
        library_dir: Option<String>,

        /// Path to a configuration file.
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let provider = telemetry::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { backend, kv_endpoints, bus_url, port, script_dir, library_dir, config } => {
            run_server(backend, kv_endpoints, bus_url, port, script_dir, library_dir, config).await
        }
    };

    telemetry::shutdown(provider);
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_server(
    backend: Option<String>,
    kv_endpoints: Option<String>,
    bus_url: Option<String>,
    port: Option<u16>,
    script_dir: Option<String>,
    library_dir: Option<String>,
    config_path: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::new(config_path.as_deref())?;

    // Flags win over the config file.
    if let Some(backend) = backend {
        config.backend = backend;
    }
    if let Some(kv_endpoints) = kv_endpoints {
        config.kv_endpoints = kv_endpoints;
    }
    if let Some(bus_url) = bus_url {
        config.bus_url = Some(bus_url);
    }
    if let Some(port) = port {
        config.http_port = port;
    }
    if let Some(script_dir) = script_dir {
        config.script_dir = script_dir;
    }
    if let Some(library_dir) = library_dir {
        config.library_dir = Some(library_dir);
    }

    let supervisor = Supervisor::builder().config(config).build().await?;
    tracing::info!("supervisor initialized, starting message watch...");
    supervisor.run().await?;

    Ok(())
}
