use clap::{Parser, Subcommand};
use shared::error::BridgeError;

use crate::commands;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("migration failure: {0}")]
    Migration(String),
    #[error("{0}")]
    Other(#[from] BridgeError),
}

#[derive(Parser)]
#[command(name = "hearth", version, about = "MCP bridge for a home-automation hub")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the bridge server
    Serve,
    /// Operate directly on the store (server may be stopped)
    #[command(subcommand)]
    Admin(AdminCommands),
}

#[derive(Subcommand)]
pub enum AdminCommands {
    /// Reset a user's password; their sessions are revoked and rotation is
    /// required at next login
    ResetPassword {
        username: String,
        /// New password; a random temporary one is generated when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// Rotate a system key (`hub_token_encryption` or `jwt_signing`)
    RotateKey { purpose: String },
    /// List user accounts
    ListUsers,
}

pub async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Serve => commands::serve::cmd_serve().await,
        Commands::Admin(command) => commands::admin::cmd_admin(command).await,
    }
}
