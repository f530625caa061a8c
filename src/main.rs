use clap::Parser;

use relay_gateway::cli::{Cli, Command, ConfigCommand};
use relay_gateway::{config, init_tracing, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start => {
            let cfg = config::load_config()?;
            init_tracing(&cfg.server.log_level, &cfg.server.log_format);
            server::run(cfg).await
        }
        Command::Config { command } => match command {
            ConfigCommand::Show => {
                let mut cfg = config::load_config()?;
                for key in &mut cfg.api_keys {
                    key.key = "<redacted>".to_string();
                }
                for channel in &mut cfg.channels {
                    channel.api_key = "<redacted>".to_string();
                }
                println!("{}", toml::to_string_pretty(&cfg)?);
                Ok(())
            }
            ConfigCommand::Validate => {
                config::load_config()?;
                println!("Configuration OK");
                Ok(())
            }
        },
    }
}
