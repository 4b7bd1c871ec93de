use encryption::logic::token::{display_prefix, generate_api_token, hash_token};
use serde::{Deserialize, Serialize};
use shared::error::BridgeError;
use shared::primitives::{WrappedChronoDateTime, WrappedJsonValue};
use utoipa::ToSchema;

use crate::repository::{ApiToken, UserRepositoryLike};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateApiTokenParams {
    pub name: String,
    /// Optional expiry; never-expiring tokens are allowed but discouraged.
    pub expires_at: Option<WrappedChronoDateTime>,
    /// Optional allow-list of tool names this token may call. Absent means
    /// the token inherits the full permission set of its user.
    pub allowed_tools: Option<Vec<String>>,
}

/// The only response that ever carries the plaintext token.
#[derive(Debug, Serialize, ToSchema)]
pub struct CreateApiTokenResponse {
    pub id: String,
    pub name: String,
    pub prefix: String,
    /// The raw API token value (only returned once, not stored)
    pub token: String,
}

pub async fn create_api_token<R: UserRepositoryLike>(
    repository: &R,
    user_id: i64,
    params: CreateApiTokenParams,
) -> Result<CreateApiTokenResponse, BridgeError> {
    if params.name.trim().is_empty() {
        return Err(BridgeError::InvalidArgument {
            msg: "token name must not be empty".to_string(),
        });
    }
    if let Some(expires_at) = &params.expires_at {
        if *expires_at.get_inner() <= chrono::Utc::now() {
            return Err(BridgeError::InvalidArgument {
                msg: "token expiry must be in the future".to_string(),
            });
        }
    }

    let raw_token = generate_api_token();
    let token = ApiToken {
        id: uuid::Uuid::new_v4().to_string(),
        user_id,
        name: params.name.trim().to_string(),
        token_hash: hash_token(&raw_token),
        prefix: display_prefix(&raw_token),
        permissions_json: params
            .allowed_tools
            .map(|tools| WrappedJsonValue::new(serde_json::json!({ "allowed_tools": tools }))),
        created_at: WrappedChronoDateTime::now(),
        expires_at: params.expires_at,
        last_used_at: None,
        revoked: false,
    };

    repository.create_api_token(&token).await?;

    Ok(CreateApiTokenResponse {
        id: token.id,
        name: token.name,
        prefix: token.prefix,
        token: raw_token,
    })
}

pub async fn list_api_tokens<R: UserRepositoryLike>(
    repository: &R,
    user_id: i64,
) -> Result<Vec<ApiToken>, BridgeError> {
    repository.list_api_tokens_for_user(user_id).await
}

pub async fn revoke_api_token<R: UserRepositoryLike>(
    repository: &R,
    user_id: i64,
    token_id: &str,
    is_admin: bool,
) -> Result<(), BridgeError> {
    // A user may only revoke their own tokens; admins may revoke any
    if !is_admin {
        let owned = repository
            .list_api_tokens_for_user(user_id)
            .await?
            .into_iter()
            .any(|t| t.id == token_id);
        if !owned {
            return Err(BridgeError::NotFound {
                msg: "api token not found".to_string(),
                lookup_id: token_id.to_string(),
            });
        }
    }

    repository.revoke_api_token(token_id).await
}

/// Whether a token's optional scope allows a tool. Tokens without a scope
/// inherit the user's full permission set.
pub fn token_allows_tool(token: &ApiToken, tool_name: &str) -> bool {
    let Some(permissions) = &token.permissions_json else {
        return true;
    };
    match permissions.get_inner().get("allowed_tools") {
        Some(serde_json::Value::Array(tools)) => {
            tools.iter().any(|t| t.as_str() == Some(tool_name))
        }
        _ => true,
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::logic::user::{CreateUserParams, create_user};
    use crate::repository::Repository;

    async fn setup() -> (Repository, i64) {
        shared::setup_test!();
        let (_db, conn) =
            shared::test_utils::repository::setup_in_memory_database(vec![Repository::migrations()])
                .await
                .unwrap();
        let repo = Repository::new(conn);
        let user = create_user(
            &repo,
            CreateUserParams {
                username: "alice".into(),
                email: "alice@example.com".into(),
                password: "Correct123".into(),
                is_admin: false,
            },
        )
        .await
        .unwrap();
        (repo, user.id)
    }

    #[tokio::test]
    async fn plaintext_is_returned_once_and_never_stored() {
        let (repo, user_id) = setup().await;

        let created = create_api_token(
            &repo,
            user_id,
            CreateApiTokenParams {
                name: "automation".into(),
                expires_at: None,
                allowed_tools: None,
            },
        )
        .await
        .unwrap();

        assert!(created.token.starts_with("hb_"));
        assert!(created.token.starts_with(&created.prefix));

        let stored = repo.list_api_tokens_for_user(user_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        // Only hash and display prefix persist
        assert_ne!(stored[0].token_hash, created.token);
        assert_eq!(stored[0].prefix.len(), 8);
        let row_json = serde_json::to_string(&stored[0]).unwrap();
        assert!(!row_json.contains(&created.token));
    }

    #[tokio::test]
    async fn lookup_by_hash_matches_the_issued_token() {
        let (repo, user_id) = setup().await;

        let created = create_api_token(
            &repo,
            user_id,
            CreateApiTokenParams {
                name: "automation".into(),
                expires_at: None,
                allowed_tools: None,
            },
        )
        .await
        .unwrap();

        let found = repo
            .get_api_token_by_hash(&hash_token(&created.token))
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, created.id);
    }

    #[tokio::test]
    async fn scope_restricts_tools() {
        let (repo, user_id) = setup().await;

        let created = create_api_token(
            &repo,
            user_id,
            CreateApiTokenParams {
                name: "read-only bot".into(),
                expires_at: None,
                allowed_tools: Some(vec!["get_entities".into(), "get_history".into()]),
            },
        )
        .await
        .unwrap();

        let token = repo
            .get_api_token_by_hash(&hash_token(&created.token))
            .await
            .unwrap()
            .unwrap();
        assert!(token_allows_tool(&token, "get_entities"));
        assert!(!token_allows_tool(&token, "call_service"));
    }

    #[tokio::test]
    async fn users_cannot_revoke_foreign_tokens() {
        let (repo, user_id) = setup().await;
        let bob = create_user(
            &repo,
            CreateUserParams {
                username: "bob".into(),
                email: "bob@example.com".into(),
                password: "Correct123".into(),
                is_admin: false,
            },
        )
        .await
        .unwrap();

        let created = create_api_token(
            &repo,
            user_id,
            CreateApiTokenParams {
                name: "automation".into(),
                expires_at: None,
                allowed_tools: None,
            },
        )
        .await
        .unwrap();

        // Bob cannot revoke Alice's token, admin can
        assert!(
            revoke_api_token(&repo, bob.id, &created.id, false)
                .await
                .is_err()
        );
        revoke_api_token(&repo, bob.id, &created.id, true)
            .await
            .unwrap();
    }
}
