use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vl_gateway::cli::{Cli, Command, ConfigCommand};
use vl_gateway::runtime::resolver::{InMemoryTenantStore, ProjectRegistry};
use vl_gateway::server;
use vl_gateway::state::AppState;
use vl_sessions::sink::{HttpArtifactSink, LogSink};
use vl_sessions::ArtifactSink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = vl_gateway::cli::load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            if !vl_gateway::cli::validate(&cli.config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            vl_gateway::cli::show(&cli.config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("voiceline {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vl_gateway=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_server(config: Arc<vl_domain::config::Config>) -> anyhow::Result<()> {
    let providers = vl_providers::registry::build(&config)
        .map_err(|e| anyhow::anyhow!("provider setup failed: {e}"))?;

    let sink: Arc<dyn ArtifactSink> = match &config.sink.artifact_sink_url {
        Some(url) => Arc::new(
            HttpArtifactSink::new(url.clone())
                .map_err(|e| anyhow::anyhow!("sink setup failed: {e}"))?,
        ),
        None => Arc::new(LogSink),
    };

    let tenants = InMemoryTenantStore::from_entries(config.tenants.clone());
    tracing::info!(tenants = tenants.len(), "tenant store loaded");

    let state = AppState {
        config,
        llm: providers.llm,
        asr: providers.asr,
        tts: providers.tts,
        tenants: Arc::new(tenants),
        projects: Arc::new(ProjectRegistry::new()),
        sink,
        active_calls: Arc::new(AtomicUsize::new(0)),
    };

    server::serve(state).await
}
