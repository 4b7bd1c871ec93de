use clap::Parser;

mod cli;
mod commands;
mod config;
mod server;

use cli::{Cli, CliError};

#[tokio::main]
async fn main() {
    shared::env::load_optional_env_files();

    let cli = Cli::parse();
    match cli::run(cli).await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(match e {
                CliError::Config(_) => 2,
                CliError::Migration(_) => 3,
                CliError::Other(_) => 1,
            });
        }
    }
}
