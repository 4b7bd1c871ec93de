use serde::{Deserialize, Serialize};
use shared::error::BridgeError;
use telemetry::repository::TelemetryRepositoryLike;
use telemetry::{LogCategory, LogStore};
use utoipa::ToSchema;

use crate::logic::api_token::token_allows_tool;
use crate::logic::auth_client::Identity;
use crate::repository::{EffectivePermission, UserRepositoryLike};

/// The permission bit a tool call needs, decided by the tool's declared
/// operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PermissionBit {
    Read,
    Write,
    Execute,
}

impl PermissionBit {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionBit::Read => "read",
            PermissionBit::Write => "write",
            PermissionBit::Execute => "execute",
        }
    }
}

fn bit_granted(permission: &EffectivePermission, bit: PermissionBit) -> bool {
    if !permission.bits.enabled {
        return false;
    }
    match bit {
        PermissionBit::Read => permission.bits.can_read,
        PermissionBit::Write => permission.bits.can_write,
        PermissionBit::Execute => permission.bits.can_execute,
    }
}

/// Authorize a tool call for a resolved identity. Denials name the tool
/// but never the missing bit, and always leave a WARN audit entry.
pub async fn check_tool_access<R, T>(
    repository: &R,
    logstore: &LogStore<T>,
    identity: &Identity,
    tool_name: &str,
    bit: PermissionBit,
) -> Result<(), BridgeError>
where
    R: UserRepositoryLike,
    T: TelemetryRepositoryLike,
{
    let denied = |reason: &'static str| async move {
        logstore
            .warn(
                LogCategory::Auth,
                "tool access denied",
                serde_json::json!({
                    "user_id": identity.user_id,
                    "tool": tool_name,
                    "bit": bit.as_str(),
                    "reason": reason,
                }),
            )
            .await;
        Err(BridgeError::Forbidden {
            msg: format!("access to tool '{tool_name}' denied"),
        })
    };

    // Token scope is an extra restriction on top of user permissions
    if let Some(token) = &identity.api_token {
        if !token_allows_tool(token, tool_name) {
            return denied("token_scope").await;
        }
    }

    let permission = repository
        .get_effective_permission(identity.user_id, tool_name)
        .await?;

    if !permission.bits.enabled {
        return denied("disabled").await;
    }
    if !bit_granted(&permission, bit) {
        return denied("missing_bit").await;
    }

    Ok(())
}

/// Which of the catalogue's tools this user can see at all (used to filter
/// `tools/list`).
pub async fn visible_tools<R: UserRepositoryLike>(
    repository: &R,
    identity: &Identity,
    tools: &[(String, PermissionBit)],
) -> Result<Vec<String>, BridgeError> {
    let mut visible = Vec::new();
    for (tool_name, bit) in tools {
        if let Some(token) = &identity.api_token {
            if !token_allows_tool(token, tool_name) {
                continue;
            }
        }
        let permission = repository
            .get_effective_permission(identity.user_id, tool_name)
            .await?;
        if bit_granted(&permission, *bit) {
            visible.push(tool_name.clone());
        }
    }
    Ok(visible)
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::logic::user::{CreateUserParams, create_user};
    use crate::repository::{PermissionBits, Repository, ToolPermission};
    use telemetry::repository::Repository as TelemetryRepository;

    struct Fixture {
        repo: Repository,
        telemetry: TelemetryRepository,
        logstore: LogStore<TelemetryRepository>,
    }

    async fn setup() -> (Fixture, Identity) {
        shared::setup_test!();
        let (_db, conn) = shared::test_utils::repository::setup_in_memory_database(vec![
            Repository::migrations(),
            TelemetryRepository::migrations(),
        ])
        .await
        .unwrap();

        let repo = Repository::new(conn.clone());
        let telemetry = TelemetryRepository::new(conn);
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

        let identity = Identity {
            user_id: user.id,
            username: user.username,
            is_admin: false,
            session_id: None,
            api_token: None,
        };

        (
            Fixture {
                repo,
                telemetry: telemetry.clone(),
                logstore: LogStore::new(telemetry),
            },
            identity,
        )
    }

    #[tokio::test]
    async fn default_grants_apply() {
        let (f, identity) = setup().await;
        f.repo
            .set_default_permission("get_entities", PermissionBits::read_only())
            .await
            .unwrap();

        check_tool_access(
            &f.repo,
            &f.logstore,
            &identity,
            "get_entities",
            PermissionBit::Read,
        )
        .await
        .unwrap();

        // Read-only default does not grant write
        let denied = check_tool_access(
            &f.repo,
            &f.logstore,
            &identity,
            "get_entities",
            PermissionBit::Write,
        )
        .await;
        assert!(matches!(denied, Err(BridgeError::Forbidden { .. })));
    }

    #[tokio::test]
    async fn disabled_override_denies_and_audits() {
        let (f, identity) = setup().await;
        f.repo
            .set_default_permission("call_service", PermissionBits::all())
            .await
            .unwrap();
        f.repo
            .set_tool_permission(&ToolPermission {
                user_id: identity.user_id,
                tool_name: "call_service".to_string(),
                bits: PermissionBits {
                    can_read: true,
                    can_write: true,
                    can_execute: true,
                    enabled: false,
                },
            })
            .await
            .unwrap();

        let denied = check_tool_access(
            &f.repo,
            &f.logstore,
            &identity,
            "call_service",
            PermissionBit::Write,
        )
        .await;

        match denied {
            Err(BridgeError::Forbidden { msg }) => {
                assert!(msg.contains("call_service"));
                assert!(!msg.contains("write"), "must not name the missing bit");
            }
            other => panic!("expected Forbidden, got {other:?}"),
        }

        // Denial left a WARN entry in the auth category
        use telemetry::repository::TelemetryRepositoryLike;
        let logs = f
            .telemetry
            .list_recent_logs(10, Some(LogCategory::Auth))
            .await
            .unwrap();
        assert!(logs.iter().any(|l| l.level == "WARN"));
    }

    #[tokio::test]
    async fn visible_tools_filters_by_grant() {
        let (f, identity) = setup().await;
        f.repo
            .set_default_permission("get_entities", PermissionBits::read_only())
            .await
            .unwrap();
        f.repo
            .set_default_permission("call_service", PermissionBits::denied())
            .await
            .unwrap();

        let catalogue = vec![
            ("get_entities".to_string(), PermissionBit::Read),
            ("call_service".to_string(), PermissionBit::Write),
        ];
        let visible = visible_tools(&f.repo, &identity, &catalogue).await.unwrap();
        assert_eq!(visible, vec!["get_entities".to_string()]);
    }
}
