use std::str::FromStr;

use base64::Engine;
use encryption::logic::CryptoService;
use encryption::logic::keys::{KeyPurpose, rotate_system_key};
use identity::repository::UserRepositoryLike;
use rand::RngCore;
use shared::libsql::{open_database, run_migrations};

use crate::cli::{AdminCommands, CliError};
use crate::config::Config;
use crate::server::all_migrations;

/// Admin subcommands operate directly on the store file; they share the
/// migration step with `serve` so a fresh store works everywhere.
pub async fn cmd_admin(command: AdminCommands) -> Result<(), CliError> {
    shared::logging::configure_stdout_logging()
        .map_err(|e| CliError::Config(format!("failed to configure logging: {e}")))?;
    let config = Config::from_env()?;

    let (_db, conn) = open_database(&config.db_path).await?;
    run_migrations(&conn, all_migrations()?)
        .await
        .map_err(|e| CliError::Migration(e.to_string()))?;

    match command {
        AdminCommands::ResetPassword { username, password } => {
            let identity_repo = identity::repository::Repository::new(conn);
            let password = match password {
                Some(password) => password,
                None => generate_temporary_password(),
            };
            identity::logic::user::reset_password(&identity_repo, &username, &password).await?;
            println!("password for '{username}' reset; rotation required at next login");
            println!("temporary password: {password}");
            Ok(())
        }
        AdminCommands::RotateKey { purpose } => {
            let purpose = KeyPurpose::from_str(&purpose)?;
            let key_repo = encryption::repository::Repository::new(conn.clone());

            let (old, new) = rotate_system_key(&key_repo, purpose).await?;

            if purpose == KeyPurpose::HubTokenEncryption {
                let Some(old) = old else {
                    println!("rotated {purpose}; no previous key, nothing to re-encrypt");
                    return Ok(());
                };
                let hub_repo = hub::repository::Repository::new(conn);
                let old_crypto = CryptoService::from_system_key(&old)?;
                let new_crypto = CryptoService::from_system_key(&new)?;
                let rotated =
                    hub::logic::config::reencrypt_all_tokens(&hub_repo, &old_crypto, &new_crypto)
                        .await?;
                println!("rotated {purpose}; re-encrypted {rotated} hub token(s)");
            } else {
                println!("rotated {purpose}; existing access tokens are now invalid");
            }
            Ok(())
        }
        AdminCommands::ListUsers => {
            let identity_repo = identity::repository::Repository::new(conn);
            let users = identity_repo.list_users().await?;

            println!("{:<6} {:<24} {:<32} {:<6} {:<9}", "id", "username", "email", "admin", "disabled");
            for user in users {
                println!(
                    "{:<6} {:<24} {:<32} {:<6} {:<9}",
                    user.id,
                    user.username,
                    user.email,
                    user.is_admin,
                    user.is_disabled,
                );
            }
            Ok(())
        }
    }
}

fn generate_temporary_password() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
