//! Multi-tenant SFTP server with pluggable storage backends

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use sftpgate::auth::MemoryUserProvider;
use sftpgate::config::Config;
use sftpgate::error::Error;
use sftpgate::server::{Server, ServerConfig};

#[derive(Parser)]
#[command(name = "sftpgate")]
#[command(version, about = "Multi-tenant SFTP server with pluggable storage backends", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "ftpserver.json")]
    conf: PathBuf,

    /// Only create the configuration file, then exit
    #[arg(long)]
    conf_only: bool,

    /// Port to listen on
    #[arg(short, long, env = "SFTP_PORT", default_value_t = 2022)]
    port: u16,

    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    address: String,

    /// Base directory for persisted state (host key)
    #[arg(long, default_value = ".")]
    base: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("sftpgate=info".parse().unwrap()),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    // A bare invocation is probably a local quick run; seed a default
    // configuration instead of failing.
    if !cli.conf.exists() {
        warn!(conf = %cli.conf.display(), "no conf file, creating one");
        Config::write_default(&cli.conf)?;
    }

    if cli.conf_only {
        warn!("only creating conf");
        return Ok(());
    }

    let config = Config::load(&cli.conf)?;
    let provider = Arc::new(MemoryUserProvider::from_accesses(&config.accesses));

    let server_config = ServerConfig::new()
        .address(cli.address)
        .port(cli.port)
        .base_path(cli.base);

    Server::new(server_config, provider, config.accesses).run().await
}
