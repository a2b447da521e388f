use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use sshchat::auth::keystore::KeyStore;
use sshchat::auth::pubkey;
use sshchat::cli::{Cli, Command};

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::CheckConfig) => {
            let cfg = cli.load_config()?;
            println!("Configuration is valid.");
            println!("  Listen:    {}", cfg.server.listen_addr());
            println!("  Instances: {}", cfg.server.instances);
            println!("  Mode:      {}", cfg.chat.mode);
            println!("  Policy:    {}", cfg.auth.policy);
            match &cfg.auth.authorized_keys {
                Some(path) => {
                    let store = KeyStore::load(path)?;
                    println!("  Key file:  {} ({} users)", path.display(), store.len());
                }
                None => println!("  Key file:  none"),
            }
            return Ok(());
        }
        Some(Command::Fingerprint { key }) => {
            let content = std::fs::read_to_string(key)?;
            let store = KeyStore::parse(&content);
            for user in store.users() {
                for k in store.lookup(&user) {
                    println!("{}\t{}", user, pubkey::fingerprint(&k));
                }
            }
            return Ok(());
        }
        None => {}
    }

    let app_config = cli.load_config()?;
    sshchat::logging::setup_logging(&cli.log_level(&app_config), app_config.logging.format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %app_config.server.listen_addr(),
        instances = app_config.server.instances,
        mode = %app_config.chat.mode,
        "Starting sshchat"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if let Err(e) = sshchat::server::run(app_config).await {
            error!(error = %e, "Server error");
            std::process::exit(1);
        }
    });

    Ok(())
}
