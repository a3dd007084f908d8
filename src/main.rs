use clap::Parser;
use log::error;
use std::process::exit;
use vpnlens::cli::{self, Cli};
use vpnlens::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Charger la configuration pour déterminer le niveau de log
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration illisible {}: {}", cli.config.display(), e);
            exit(2);
        }
    };

    env_logger::init_from_env(env_logger::Env::default().default_filter_or(&config.log_level));

    if let Err(e) = cli::execute(cli, config).await {
        error!("{:#}", e);
        eprintln!("Erreur: {:#}", e);
        exit(1);
    }
    Ok(())
}
