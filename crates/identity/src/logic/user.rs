use encryption::logic::password::hash_password;
use serde::Deserialize;
use shared::error::BridgeError;
use tracing::info;
use utoipa::ToSchema;

use crate::repository::{NewUser, User, UserRepositoryLike};

/// Well-known seed credential; the account is created with
/// `must_rotate_password` set so it cannot stay on this password quietly.
pub const DEFAULT_ADMIN_USERNAME: &str = "admin";
pub const DEFAULT_ADMIN_PASSWORD: &str = "Admin123!";

pub const USERNAME_MIN: usize = 3;
pub const USERNAME_MAX: usize = 50;
pub const PASSWORD_MIN: usize = 8;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateUserParams {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
}

pub fn validate_username(username: &str) -> Result<(), BridgeError> {
    let len = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        return Err(BridgeError::InvalidArgument {
            msg: format!("username must be {USERNAME_MIN}-{USERNAME_MAX} characters"),
        });
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(BridgeError::InvalidArgument {
            msg: "username may only contain letters, digits, '-', '_' and '.'".to_string(),
        });
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<(), BridgeError> {
    let invalid = || BridgeError::InvalidArgument {
        msg: "invalid email address".to_string(),
    };

    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.is_empty() || email.contains(' ') {
        return Err(invalid());
    }
    let (host, tld) = domain.rsplit_once('.').ok_or_else(invalid)?;
    if host.is_empty() || tld.is_empty() {
        return Err(invalid());
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), BridgeError> {
    if password.chars().count() < PASSWORD_MIN {
        return Err(BridgeError::InvalidArgument {
            msg: format!("password must be at least {PASSWORD_MIN} characters"),
        });
    }
    Ok(())
}

pub async fn create_user<R: UserRepositoryLike>(
    repository: &R,
    params: CreateUserParams,
) -> Result<User, BridgeError> {
    validate_username(&params.username)?;
    validate_email(&params.email)?;
    validate_password(&params.password)?;

    let user = repository
        .create_user(&NewUser {
            username: params.username,
            email: params.email,
            password_hash: hash_password(&params.password),
            is_admin: params.is_admin,
            must_rotate_password: false,
        })
        .await?;

    info!(user_id = user.id, username = %user.username, "created user");
    Ok(user)
}

/// Guarantee the bootstrap invariant: an admin account always exists.
/// Returns true when the seed account was created on this call.
pub async fn seed_default_admin<R: UserRepositoryLike>(
    repository: &R,
) -> Result<bool, BridgeError> {
    if repository.any_admin_exists().await? {
        return Ok(false);
    }

    repository
        .create_user(&NewUser {
            username: DEFAULT_ADMIN_USERNAME.to_string(),
            email: "admin@localhost.local".to_string(),
            password_hash: hash_password(DEFAULT_ADMIN_PASSWORD),
            is_admin: true,
            must_rotate_password: true,
        })
        .await?;

    info!(
        username = DEFAULT_ADMIN_USERNAME,
        "seeded default admin account; password rotation required on first login"
    );
    Ok(true)
}

/// Self-service password change: verifies the current password, then
/// replaces the hash and clears the rotation flag.
pub async fn change_password<R: UserRepositoryLike>(
    repository: &R,
    user_id: i64,
    current_password: &str,
    new_password: &str,
) -> Result<(), BridgeError> {
    validate_password(new_password)?;

    let user = repository
        .get_user_by_id(user_id)
        .await?
        .ok_or_else(|| BridgeError::NotFound {
            msg: "user not found".to_string(),
            lookup_id: user_id.to_string(),
        })?;

    if !encryption::logic::password::verify_password(current_password, &user.password_hash)? {
        return Err(BridgeError::Unauthorized {
            msg: "invalid credentials".to_string(),
            source: None,
        });
    }

    repository
        .update_password(user_id, &hash_password(new_password), false)
        .await
}

/// Administrative reset: no current password needed, but the user must
/// rotate at next login. Active sessions are revoked.
pub async fn reset_password<R: UserRepositoryLike>(
    repository: &R,
    username: &str,
    new_password: &str,
) -> Result<(), BridgeError> {
    validate_password(new_password)?;

    let user = repository
        .get_user_by_username(username)
        .await?
        .ok_or_else(|| BridgeError::NotFound {
            msg: "user not found".to_string(),
            lookup_id: username.to_string(),
        })?;

    repository
        .update_password(user.id, &hash_password(new_password), true)
        .await?;
    repository.revoke_sessions_for_user(user.id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_bounds() {
        assert!(validate_username("ab").is_err());
        assert!(validate_username("abc").is_ok());
        assert!(validate_username(&"a".repeat(50)).is_ok());
        assert!(validate_username(&"a".repeat(51)).is_err());
        assert!(validate_username("with space").is_err());
        assert!(validate_username("dot.dash-under_score1").is_ok());
    }

    #[test]
    fn email_shape() {
        assert!(validate_email("a@b.co").is_ok());
        assert!(validate_email("a.b+tag@sub.domain.org").is_ok());
        assert!(validate_email("missing-at.example.com").is_err());
        assert!(validate_email("@no-local.com").is_err());
        assert!(validate_email("no-domain@").is_err());
        assert!(validate_email("no-tld@host").is_err());
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::repository::Repository;

    async fn setup_test_db() -> Repository {
        shared::setup_test!();
        let (_db, conn) =
            shared::test_utils::repository::setup_in_memory_database(vec![Repository::migrations()])
                .await
                .unwrap();
        Repository::new(conn)
    }

    #[tokio::test]
    async fn seed_admin_is_idempotent() {
        let repo = setup_test_db().await;

        assert!(seed_default_admin(&repo).await.unwrap());
        assert!(!seed_default_admin(&repo).await.unwrap());

        let admin = repo
            .get_user_by_username(DEFAULT_ADMIN_USERNAME)
            .await
            .unwrap()
            .unwrap();
        assert!(admin.is_admin);
        assert!(admin.must_rotate_password);
        assert!(
            encryption::logic::password::verify_password(
                DEFAULT_ADMIN_PASSWORD,
                &admin.password_hash
            )
            .unwrap()
        );
    }

    #[tokio::test]
    async fn change_password_requires_current() {
        let repo = setup_test_db().await;
        let user = create_user(
            &repo,
            CreateUserParams {
                username: "alice".into(),
                email: "alice@example.com".into(),
                password: "OldPass123".into(),
                is_admin: false,
            },
        )
        .await
        .unwrap();

        assert!(
            change_password(&repo, user.id, "wrong", "NewPass123")
                .await
                .is_err()
        );
        change_password(&repo, user.id, "OldPass123", "NewPass123")
            .await
            .unwrap();

        let updated = repo.get_user_by_id(user.id).await.unwrap().unwrap();
        assert!(
            encryption::logic::password::verify_password("NewPass123", &updated.password_hash)
                .unwrap()
        );
    }

    #[tokio::test]
    async fn admin_reset_forces_rotation() {
        let repo = setup_test_db().await;
        create_user(
            &repo,
            CreateUserParams {
                username: "alice".into(),
                email: "alice@example.com".into(),
                password: "OldPass123".into(),
                is_admin: false,
            },
        )
        .await
        .unwrap();

        reset_password(&repo, "alice", "Temporary123").await.unwrap();

        let updated = repo.get_user_by_username("alice").await.unwrap().unwrap();
        assert!(updated.must_rotate_password);
    }
}
