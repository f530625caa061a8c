use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "relay-gateway", version, about = "Relay gateway for asynchronous AI generation APIs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway server
    Start,
    /// Configuration utilities
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration with secrets redacted
    Show,
    /// Load and validate the configuration, then exit
    Validate,
}
