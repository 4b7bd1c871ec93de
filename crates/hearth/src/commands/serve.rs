use crate::cli::CliError;
use crate::config::Config;
use crate::server::run_server;

pub async fn cmd_serve() -> Result<(), CliError> {
    let config = Config::from_env()?;
    run_server(config).await
}
