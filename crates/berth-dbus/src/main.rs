use berth_core::{install_signal_handler, Agent, AgentConfig};
use berth_runtime::{check_lxc_prereqs, format_missing};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "berth-agent", version, about = "Container agent for sandboxed applications")]
struct Cli {
    /// Agent configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding per-container scaffolding.
    #[arg(long)]
    container_root: Option<PathBuf>,

    /// Container backend: lxc or mock.
    #[arg(long)]
    backend: Option<String>,

    /// Serve on the session bus instead of the system bus.
    #[arg(long)]
    session: bool,

    /// Leave containers running when the agent stops.
    #[arg(long)]
    keep_containers_alive: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn load_config(&self) -> Result<AgentConfig, berth_core::CoreError> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::load(path)?,
            None => AgentConfig::default(),
        };
        if let Some(root) = &self.container_root {
            config.container_root.clone_from(root);
        }
        if let Some(backend) = &self.backend {
            config.backend.clone_from(backend);
        }
        config.use_session_bus |= self.session;
        config.keep_containers_alive |= self.keep_containers_alive;
        config.validate()?;
        Ok(config)
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.load_config()?;
    info!(
        "berth-agent starting, container root: {}",
        config.container_root.display()
    );

    if config.backend == "lxc" {
        let missing = check_lxc_prereqs(&config.dbus_proxy);
        if !missing.is_empty() {
            warn!("{}", format_missing(&missing));
        }
    }

    install_signal_handler();
    let agent = tokio::task::spawn_blocking(move || Agent::new(config)).await??;
    berth_dbus::run_service(Arc::new(agent)).await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BERTH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
