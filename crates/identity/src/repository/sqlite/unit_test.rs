use super::*;
use encryption::logic::token::{generate_refresh_token, hash_token};

async fn setup_test_db() -> Repository {
    shared::setup_test!();

    let (_db, conn) =
        shared::test_utils::repository::setup_in_memory_database(vec![Repository::migrations()])
            .await
            .unwrap();

    Repository::new(conn)
}

fn test_user(username: &str, is_admin: bool) -> NewUser {
    NewUser {
        username: username.to_string(),
        email: format!("{username}@example.com"),
        password_hash: "pbkdf2-sha256$1$c2FsdA$aGFzaA".to_string(),
        is_admin,
        must_rotate_password: false,
    }
}

fn test_session(user_id: i64, jti: &str, refresh_hash: &str) -> Session {
    let now = chrono::Utc::now();
    Session {
        id: uuid::Uuid::new_v4().to_string(),
        user_id,
        access_token_jti: jti.to_string(),
        refresh_token_hash: refresh_hash.to_string(),
        issued_at: WrappedChronoDateTime::new(now),
        expires_at: WrappedChronoDateTime::new(now + chrono::Duration::hours(1)),
        refresh_expires_at: WrappedChronoDateTime::new(now + chrono::Duration::days(7)),
        user_agent: Some("test-agent".to_string()),
        remote_addr: Some("127.0.0.1".to_string()),
        revoked: false,
    }
}

#[tokio::test]
async fn create_and_fetch_user() {
    let repo = setup_test_db().await;

    let user = repo.create_user(&test_user("alice", false)).await.unwrap();
    assert!(user.id > 0);
    assert!(!user.is_admin);
    assert_eq!(user.failed_logins, 0);

    let by_name = repo.get_user_by_username("alice").await.unwrap().unwrap();
    assert_eq!(by_name.id, user.id);

    // Usernames are case-sensitive
    assert!(repo.get_user_by_username("Alice").await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_username_is_a_conflict() {
    let repo = setup_test_db().await;

    repo.create_user(&test_user("alice", false)).await.unwrap();
    match repo.create_user(&test_user("alice", false)).await {
        Err(BridgeError::Conflict { .. }) => {}
        other => panic!("expected Conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn admin_existence_check() {
    let repo = setup_test_db().await;
    assert!(!repo.any_admin_exists().await.unwrap());

    let admin = repo.create_user(&test_user("admin", true)).await.unwrap();
    assert!(repo.any_admin_exists().await.unwrap());

    // A disabled admin does not count
    repo.set_disabled(admin.id, true).await.unwrap();
    assert!(!repo.any_admin_exists().await.unwrap());
}

#[tokio::test]
async fn login_failure_bookkeeping() {
    let repo = setup_test_db().await;
    let user = repo.create_user(&test_user("alice", false)).await.unwrap();

    let locked_until =
        WrappedChronoDateTime::new(chrono::Utc::now() + chrono::Duration::minutes(5));
    repo.record_login_failure(user.id, 5, Some(locked_until), WrappedChronoDateTime::now())
        .await
        .unwrap();

    let user = repo.get_user_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(user.failed_logins, 5);
    assert!(user.locked_until.is_some());

    repo.record_login_success(user.id).await.unwrap();
    let user = repo.get_user_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(user.failed_logins, 0);
    assert!(user.locked_until.is_none());
}

#[tokio::test]
async fn session_rotation_invalidates_old_refresh_hash() {
    let repo = setup_test_db().await;
    let user = repo.create_user(&test_user("alice", false)).await.unwrap();

    let old_refresh = hash_token(&generate_refresh_token());
    let session = test_session(user.id, "jti-1", &old_refresh);
    repo.insert_session(&session).await.unwrap();

    let new_refresh = hash_token(&generate_refresh_token());
    let now = chrono::Utc::now();
    repo.rotate_session(
        &session.id,
        &SessionRotation {
            access_token_jti: "jti-2".to_string(),
            refresh_token_hash: new_refresh.clone(),
            issued_at: WrappedChronoDateTime::new(now),
            expires_at: WrappedChronoDateTime::new(now + chrono::Duration::hours(1)),
        },
    )
    .await
    .unwrap();

    assert!(
        repo.get_session_by_refresh_hash(&old_refresh)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        repo.get_session_by_refresh_hash(&new_refresh)
            .await
            .unwrap()
            .is_some()
    );
    assert!(repo.get_session_by_jti("jti-1").await.unwrap().is_none());
    assert!(repo.get_session_by_jti("jti-2").await.unwrap().is_some());
}

#[tokio::test]
async fn rotating_a_revoked_session_fails() {
    let repo = setup_test_db().await;
    let user = repo.create_user(&test_user("alice", false)).await.unwrap();

    let session = test_session(user.id, "jti-1", "refresh-hash");
    repo.insert_session(&session).await.unwrap();
    repo.revoke_session(&session.id).await.unwrap();

    let now = chrono::Utc::now();
    let result = repo
        .rotate_session(
            &session.id,
            &SessionRotation {
                access_token_jti: "jti-2".to_string(),
                refresh_token_hash: "new-hash".to_string(),
                issued_at: WrappedChronoDateTime::new(now),
                expires_at: WrappedChronoDateTime::new(now + chrono::Duration::hours(1)),
            },
        )
        .await;
    assert!(matches!(result, Err(BridgeError::TokenRevoked)));
}

#[tokio::test]
async fn expired_sessions_are_swept() {
    let repo = setup_test_db().await;
    let user = repo.create_user(&test_user("alice", false)).await.unwrap();

    let mut stale = test_session(user.id, "jti-old", "hash-old");
    let past = chrono::Utc::now() - chrono::Duration::days(30);
    stale.issued_at = WrappedChronoDateTime::new(past);
    stale.expires_at = WrappedChronoDateTime::new(past + chrono::Duration::hours(1));
    stale.refresh_expires_at = WrappedChronoDateTime::new(past + chrono::Duration::days(7));
    repo.insert_session(&stale).await.unwrap();

    let fresh = test_session(user.id, "jti-new", "hash-new");
    repo.insert_session(&fresh).await.unwrap();

    let swept = repo
        .sweep_expired_sessions(WrappedChronoDateTime::now())
        .await
        .unwrap();
    assert_eq!(swept, 1);
    assert!(repo.get_session_by_jti("jti-old").await.unwrap().is_none());
    assert!(repo.get_session_by_jti("jti-new").await.unwrap().is_some());
}

#[tokio::test]
async fn api_tokens_cascade_with_user() {
    let repo = setup_test_db().await;
    let user = repo.create_user(&test_user("alice", false)).await.unwrap();

    let token = ApiToken {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user.id,
        name: "automation".to_string(),
        token_hash: "hash-1".to_string(),
        prefix: "hb_abc12".to_string(),
        permissions_json: None,
        created_at: WrappedChronoDateTime::now(),
        expires_at: None,
        last_used_at: None,
        revoked: false,
    };
    repo.create_api_token(&token).await.unwrap();

    assert!(repo.get_api_token_by_hash("hash-1").await.unwrap().is_some());

    repo.connection()
        .execute("DELETE FROM user WHERE id = ?", [user.id])
        .await
        .unwrap();
    assert!(repo.get_api_token_by_hash("hash-1").await.unwrap().is_none());
}

#[tokio::test]
async fn effective_permission_prefers_user_override() {
    let repo = setup_test_db().await;
    let user = repo.create_user(&test_user("alice", false)).await.unwrap();

    repo.set_default_permission("call_service", PermissionBits::all())
        .await
        .unwrap();

    // Default applies when no override exists
    let effective = repo
        .get_effective_permission(user.id, "call_service")
        .await
        .unwrap();
    assert_eq!(effective.source, PermissionSource::Default);
    assert!(effective.bits.can_write);

    // Per-user override wins
    repo.set_tool_permission(&ToolPermission {
        user_id: user.id,
        tool_name: "call_service".to_string(),
        bits: PermissionBits {
            can_read: true,
            can_write: false,
            can_execute: false,
            enabled: false,
        },
    })
    .await
    .unwrap();

    let effective = repo
        .get_effective_permission(user.id, "call_service")
        .await
        .unwrap();
    assert_eq!(effective.source, PermissionSource::UserOverride);
    assert!(!effective.bits.enabled);

    // Clearing the override falls back to the default
    repo.clear_tool_permission(user.id, "call_service")
        .await
        .unwrap();
    let effective = repo
        .get_effective_permission(user.id, "call_service")
        .await
        .unwrap();
    assert_eq!(effective.source, PermissionSource::Default);
}

#[tokio::test]
async fn unknown_tool_is_denied() {
    let repo = setup_test_db().await;
    let user = repo.create_user(&test_user("alice", false)).await.unwrap();

    let effective = repo
        .get_effective_permission(user.id, "no_such_tool")
        .await
        .unwrap();
    assert_eq!(effective.source, PermissionSource::Unknown);
    assert!(!effective.bits.enabled);
}

#[tokio::test]
async fn seeding_defaults_does_not_clobber_edits() {
    let repo = setup_test_db().await;

    repo.seed_default_permissions(&[("get_entities".to_string(), PermissionBits::all())])
        .await
        .unwrap();

    // Operator tightens the default
    repo.set_default_permission("get_entities", PermissionBits::denied())
        .await
        .unwrap();

    // Re-seed on restart must not undo the edit
    repo.seed_default_permissions(&[("get_entities".to_string(), PermissionBits::all())])
        .await
        .unwrap();

    let user = repo.create_user(&test_user("alice", false)).await.unwrap();
    let effective = repo
        .get_effective_permission(user.id, "get_entities")
        .await
        .unwrap();
    assert!(!effective.bits.enabled);
}
