//! Authentication core server and operator commands.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use authn_core::{
    AuthenticationStrategy, Integrations,
    audit::TracingAuditSink,
    cli::{Cli, Command},
    config::Config,
    handler,
    policy::InMemoryPolicyStore,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }

    let store = Arc::new(match &config.policy_file {
        Some(path) => InMemoryPolicyStore::load(path)
            .with_context(|| format!("Failed to load policy file {}", path.display()))?,
        None => InMemoryPolicyStore::new(),
    });
    let strategy =
        AuthenticationStrategy::from_config(&config, store, Integrations::default(), Arc::new(TracingAuditSink))
            .context("Failed to build authenticators")?;

    match cli.command {
        Some(Command::Authenticators { account }) => {
            let account = account.unwrap_or_else(|| config.account.clone());
            let list = strategy.list_authenticators(&account).await?;
            println!("{}", serde_json::to_string_pretty(&list)?);
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Status {
            authenticator,
            service_id,
            account,
        }) => {
            let account = account.unwrap_or_else(|| config.account.clone());
            match strategy.status(&authenticator, &account, service_id, None).await {
                Ok(()) => {
                    println!("ok");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    println!("{}: {e}", e.kind().as_str());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Some(Command::Serve) | None => {
            let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
                .parse()
                .context("Invalid server address")?;
            info!(
                version = env!("CARGO_PKG_VERSION"),
                %addr,
                account = %config.account,
                "Starting authentication core"
            );
            handler::serve(addr, Arc::new(strategy)).await?;
            info!("Shutdown complete");
            Ok(ExitCode::SUCCESS)
        }
    }
}
