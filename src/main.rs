//! pinentryd binary entry point.
//!
//! Loads settings, starts the server through the [`Supervisor`], and
//! runs until a termination signal arrives.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use mimalloc::MiMalloc;
use pinentryd::{CommandPrompt, Settings, Supervisor};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(
    name = "pinentryd",
    version,
    about = "Assuan pinentry server on a Unix domain socket"
)]
struct Cli {
    /// Socket path to listen on (overrides config file and PINENTRYD_SOCKET)
    #[arg(long)]
    socket: Option<String>,

    /// Shell command run to ask the human for a secret (overrides config)
    #[arg(long)]
    prompt_command: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut settings = Settings::load()?;
    if let Some(socket) = cli.socket {
        settings.socket_path = Some(socket);
        settings.enabled = true;
    }
    if let Some(command) = cli.prompt_command {
        settings.prompt_command = Some(command);
    }

    if !settings.enabled {
        anyhow::bail!("pinentryd is disabled; pass --socket or set PINENTRYD_ENABLED=1");
    }
    let Some(program) = settings.prompt_command.clone() else {
        anyhow::bail!(
            "no prompt command configured; pass --prompt-command or set PINENTRYD_PROMPT_COMMAND"
        );
    };

    let mut supervisor = Supervisor::new(Arc::new(CommandPrompt::new(program)));
    supervisor.reconcile(&settings).await?;
    if !supervisor.is_running() {
        anyhow::bail!("no socket path configured; pass --socket or set PINENTRYD_SOCKET");
    }
    log::info!("pinentryd v{} running", env!("CARGO_PKG_VERSION"));

    wait_for_shutdown_signal().await?;
    supervisor.stop().await;
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => log::info!("SIGTERM received, shutting down"),
        _ = sighup.recv() => log::info!("SIGHUP received, shutting down"),
    }
    Ok(())
}
