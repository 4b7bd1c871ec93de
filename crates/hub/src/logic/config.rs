use encryption::logic::CryptoService;
use serde::Deserialize;
use shared::error::BridgeError;
use shared::primitives::WrappedChronoDateTime;
use tracing::info;
use url::Url;
use utoipa::ToSchema;
use zeroize::Zeroizing;

use crate::repository::{HubConfig, HubConfigRepositoryLike};

/// Wire payload for create/update; `token` is accepted in clear over the
/// (authenticated) management API and encrypted before it touches the store.
#[derive(Debug, Deserialize, ToSchema)]
pub struct HubConfigParams {
    pub name: String,
    pub url: String,
    pub token: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

/// Absolute http/https URLs only; loopback is rejected when deployment
/// policy says so.
pub fn validate_hub_url(raw: &str, forbid_loopback: bool) -> Result<Url, BridgeError> {
    let url = Url::parse(raw).map_err(|_e| BridgeError::InvalidArgument {
        msg: "hub url must be absolute".to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(BridgeError::InvalidArgument {
            msg: "hub url scheme must be http or https".to_string(),
        });
    }
    if url.host_str().is_none() {
        return Err(BridgeError::InvalidArgument {
            msg: "hub url must have a host".to_string(),
        });
    }

    if forbid_loopback {
        let loopback = match url.host() {
            Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
            Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
            Some(url::Host::Domain(host)) => host.eq_ignore_ascii_case("localhost"),
            None => false,
        };
        if loopback {
            return Err(BridgeError::InvalidArgument {
                msg: "loopback hub urls are not allowed by deployment policy".to_string(),
            });
        }
    }

    Ok(url)
}

pub async fn create_config<R: HubConfigRepositoryLike>(
    repository: &R,
    crypto: &CryptoService,
    user_id: i64,
    params: HubConfigParams,
    forbid_loopback: bool,
) -> Result<HubConfig, BridgeError> {
    validate_hub_url(&params.url, forbid_loopback)?;
    let token = params.token.ok_or_else(|| BridgeError::InvalidArgument {
        msg: "a hub token is required".to_string(),
    })?;
    if params.name.trim().is_empty() {
        return Err(BridgeError::InvalidArgument {
            msg: "config name must not be empty".to_string(),
        });
    }

    let config = HubConfig {
        id: uuid::Uuid::new_v4().to_string(),
        user_id,
        name: params.name.trim().to_string(),
        url: params.url.trim_end_matches('/').to_string(),
        token_cipher: crypto.encrypt(&token)?,
        last_probe_at: None,
        last_probe_status: None,
        last_probe_latency_ms: None,
        last_probe_version: None,
        last_probe_entities: None,
        is_default: false,
        created_at: WrappedChronoDateTime::now(),
    };
    repository.insert_config(&config).await?;

    if params.is_default {
        repository.set_default_config(user_id, &config.id).await?;
    }

    info!(user_id, config_id = %config.id, "created hub config");
    repository
        .get_config(&config.id, user_id)
        .await?
        .ok_or_else(|| BridgeError::internal("hub config vanished after insert"))
}

pub async fn update_config<R: HubConfigRepositoryLike>(
    repository: &R,
    crypto: &CryptoService,
    user_id: i64,
    id: &str,
    params: HubConfigParams,
    forbid_loopback: bool,
) -> Result<HubConfig, BridgeError> {
    validate_hub_url(&params.url, forbid_loopback)?;

    let token_cipher = params
        .token
        .as_deref()
        .map(|token| crypto.encrypt(token))
        .transpose()?;

    repository
        .update_config(
            id,
            user_id,
            params.name.trim(),
            params.url.trim_end_matches('/'),
            token_cipher.as_ref(),
        )
        .await?;

    if params.is_default {
        repository.set_default_config(user_id, id).await?;
    }

    repository
        .get_config(id, user_id)
        .await?
        .ok_or_else(|| BridgeError::NotFound {
            msg: "hub config not found".to_string(),
            lookup_id: id.to_string(),
        })
}

/// Decrypt a config's upstream token. The plaintext lives in a zeroizing
/// buffer scoped to the call that needed it.
pub fn decrypt_token(
    crypto: &CryptoService,
    config: &HubConfig,
) -> Result<Zeroizing<String>, BridgeError> {
    crypto.decrypt(&config.token_cipher)
}

/// The config a tool call should use: the explicit default when set;
/// otherwise the most recently successfully probed config. With several
/// configs and no way to pick, the call is a Conflict rather than a guess.
pub async fn resolve_active_config<R: HubConfigRepositoryLike>(
    repository: &R,
    user_id: i64,
) -> Result<HubConfig, BridgeError> {
    if let Some(config) = repository.get_default_config(user_id).await? {
        return Ok(config);
    }

    let mut configs = repository.list_configs_for_user(user_id).await?;
    match configs.len() {
        0 => Err(BridgeError::NotFound {
            msg: "no hub config for user".to_string(),
            lookup_id: user_id.to_string(),
        }),
        1 => Ok(configs.remove(0)),
        _ => {
            let best = configs
                .into_iter()
                .filter(|c| c.last_probe_status.as_deref() == Some("ok"))
                .max_by_key(|c| c.last_probe_at);
            best.ok_or(BridgeError::Conflict {
                msg: "multiple hub configs and no default; set one or probe them".to_string(),
            })
        }
    }
}

/// Re-encrypt every stored hub token under a new key. Called by key
/// rotation; a token whose ciphertext no longer authenticates is a hard
/// failure so rotation never silently drops a credential.
pub async fn reencrypt_all_tokens<R: HubConfigRepositoryLike>(
    repository: &R,
    old_crypto: &CryptoService,
    new_crypto: &CryptoService,
) -> Result<u64, BridgeError> {
    let mut rotated = 0u64;
    for config in repository.list_all_configs().await? {
        let plaintext = old_crypto.decrypt(&config.token_cipher)?;
        let cipher = new_crypto.encrypt(&plaintext)?;
        repository.update_token_cipher(&config.id, &cipher).await?;
        rotated += 1;
    }
    Ok(rotated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation() {
        assert!(validate_hub_url("http://hub.local:8123", false).is_ok());
        assert!(validate_hub_url("https://ha.example.com", false).is_ok());
        assert!(validate_hub_url("ftp://hub.local", false).is_err());
        assert!(validate_hub_url("hub.local:8123", false).is_err());
        assert!(validate_hub_url("/relative/path", false).is_err());
    }

    #[test]
    fn loopback_policy() {
        assert!(validate_hub_url("http://127.0.0.1:8123", false).is_ok());
        assert!(validate_hub_url("http://127.0.0.1:8123", true).is_err());
        assert!(validate_hub_url("http://localhost:8123", true).is_err());
        assert!(validate_hub_url("http://[::1]:8123", true).is_err());
        assert!(validate_hub_url("http://hub.local:8123", true).is_ok());
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::repository::Repository;
    use encryption::logic::keys::{KeyPurpose, generate_system_key};
    use identity::logic::user::{CreateUserParams, create_user};

    async fn setup() -> (Repository, CryptoService, i64) {
        shared::setup_test!();
        let (_db, conn) = shared::test_utils::repository::setup_in_memory_database(vec![
            identity::repository::Repository::migrations(),
            Repository::migrations(),
        ])
        .await
        .unwrap();

        let users = identity::repository::Repository::new(conn.clone());
        let user = create_user(
            &users,
            CreateUserParams {
                username: "alice".into(),
                email: "alice@example.com".into(),
                password: "Correct123".into(),
                is_admin: false,
            },
        )
        .await
        .unwrap();

        let crypto =
            CryptoService::from_system_key(&generate_system_key(KeyPurpose::HubTokenEncryption))
                .unwrap();

        (Repository::new(conn), crypto, user.id)
    }

    fn params(name: &str, token: Option<&str>) -> HubConfigParams {
        HubConfigParams {
            name: name.to_string(),
            url: "http://hub.local:8123".to_string(),
            token: token.map(|t| t.to_string()),
            is_default: false,
        }
    }

    #[tokio::test]
    async fn token_is_encrypted_at_rest_and_roundtrips() {
        let (repo, crypto, user_id) = setup().await;

        let config = create_config(
            &repo,
            &crypto,
            user_id,
            params("home", Some("llat-supersecret")),
            false,
        )
        .await
        .unwrap();

        // Stored form never contains the plaintext
        assert!(!config.token_cipher.0.contains("llat-supersecret"));
        // Serialized form never contains the ciphertext either
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains(&config.token_cipher.0));

        // create → read → decrypted token equals the original
        let decrypted = decrypt_token(&crypto, &config).unwrap();
        assert_eq!(&*decrypted, "llat-supersecret");
    }

    #[tokio::test]
    async fn resolve_prefers_default_then_probed() {
        let (repo, crypto, user_id) = setup().await;

        let a = create_config(&repo, &crypto, user_id, params("a", Some("t")), false)
            .await
            .unwrap();
        let b = create_config(&repo, &crypto, user_id, params("b", Some("t")), false)
            .await
            .unwrap();

        // Two configs, no default, none probed: Conflict
        let unresolved = resolve_active_config(&repo, user_id).await;
        assert!(matches!(unresolved, Err(BridgeError::Conflict { .. })));

        // A successful probe breaks the tie
        repo.record_probe(
            &b.id,
            &crate::repository::ProbeRecord {
                at: WrappedChronoDateTime::now(),
                status: "ok".to_string(),
                latency_ms: Some(10),
                version: None,
                entities: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(resolve_active_config(&repo, user_id).await.unwrap().id, b.id);

        // An explicit default wins over probe recency
        repo.set_default_config(user_id, &a.id).await.unwrap();
        assert_eq!(resolve_active_config(&repo, user_id).await.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn single_config_needs_no_default() {
        let (repo, crypto, user_id) = setup().await;
        let only = create_config(&repo, &crypto, user_id, params("only", Some("t")), false)
            .await
            .unwrap();
        assert_eq!(resolve_active_config(&repo, user_id).await.unwrap().id, only.id);
    }

    #[tokio::test]
    async fn key_rotation_reencrypts_every_token() {
        let (repo, crypto, user_id) = setup().await;

        create_config(&repo, &crypto, user_id, params("a", Some("token-a")), false)
            .await
            .unwrap();
        create_config(&repo, &crypto, user_id, params("b", Some("token-b")), false)
            .await
            .unwrap();

        let new_crypto =
            CryptoService::from_system_key(&generate_system_key(KeyPurpose::HubTokenEncryption))
                .unwrap();

        let rotated = reencrypt_all_tokens(&repo, &crypto, &new_crypto).await.unwrap();
        assert_eq!(rotated, 2);

        for config in repo.list_configs_for_user(user_id).await.unwrap() {
            // Old key can no longer decrypt; new key can
            assert!(crypto.decrypt(&config.token_cipher).is_err());
            let plain = new_crypto.decrypt(&config.token_cipher).unwrap();
            assert!(plain.starts_with("token-"));
        }
    }

    #[tokio::test]
    async fn update_without_token_keeps_old_cipher() {
        let (repo, crypto, user_id) = setup().await;

        let created = create_config(&repo, &crypto, user_id, params("home", Some("secret")), false)
            .await
            .unwrap();

        let updated = update_config(
            &repo,
            &crypto,
            user_id,
            &created.id,
            params("renamed", None),
            false,
        )
        .await
        .unwrap();

        assert_eq!(updated.name, "renamed");
        assert_eq!(&*decrypt_token(&crypto, &updated).unwrap(), "secret");
    }
}
