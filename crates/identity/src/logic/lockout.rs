use shared::primitives::WrappedChronoDateTime;

use crate::repository::User;

/// Consecutive failures before the account locks.
pub const LOCKOUT_THRESHOLD: i64 = 5;
/// First lock duration; doubles with each further failure.
pub const LOCKOUT_BASE_SECS: i64 = 60;
/// Lock duration cap.
pub const LOCKOUT_MAX_SECS: i64 = 3600;
/// Failures older than this no longer count toward the threshold.
pub const FAILURE_WINDOW_SECS: i64 = 900;

/// How many failures still count, given when the last one happened.
pub fn effective_failures(user: &User, now: chrono::DateTime<chrono::Utc>) -> i64 {
    match user.last_failed_at {
        Some(last) if (now - *last.get_inner()).num_seconds() <= FAILURE_WINDOW_SECS => {
            user.failed_logins
        }
        _ => 0,
    }
}

/// Lock expiry after the `failures`-th consecutive failure, if the
/// threshold has been reached: base duration doubling per extra strike,
/// capped.
pub fn next_lockout(
    failures: i64,
    now: chrono::DateTime<chrono::Utc>,
) -> Option<WrappedChronoDateTime> {
    if failures < LOCKOUT_THRESHOLD {
        return None;
    }

    let exponent = (failures - LOCKOUT_THRESHOLD).min(16) as u32;
    let duration_secs = LOCKOUT_BASE_SECS
        .saturating_mul(1i64 << exponent)
        .min(LOCKOUT_MAX_SECS);

    Some(WrappedChronoDateTime::new(
        now + chrono::Duration::seconds(duration_secs),
    ))
}

/// Milliseconds until the lock expires, if the account is locked at `now`.
/// An attempt exactly at `locked_until` is allowed.
pub fn lock_remaining_ms(user: &User, now: chrono::DateTime<chrono::Utc>) -> Option<u64> {
    let locked_until = user.locked_until?;
    let remaining = *locked_until.get_inner() - now;
    if remaining > chrono::Duration::zero() {
        Some(remaining.num_milliseconds().max(0) as u64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with(
        failed_logins: i64,
        locked_until: Option<chrono::DateTime<chrono::Utc>>,
        last_failed_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> User {
        User {
            id: 1,
            username: "alice".into(),
            email: "alice@example.com".into(),
            password_hash: String::new(),
            is_admin: false,
            is_disabled: false,
            must_rotate_password: false,
            failed_logins,
            locked_until: locked_until.map(WrappedChronoDateTime::new),
            last_failed_at: last_failed_at.map(WrappedChronoDateTime::new),
            created_at: WrappedChronoDateTime::now(),
        }
    }

    #[test]
    fn no_lock_below_threshold() {
        let now = chrono::Utc::now();
        assert!(next_lockout(LOCKOUT_THRESHOLD - 1, now).is_none());
        assert!(next_lockout(0, now).is_none());
    }

    #[test]
    fn lock_duration_doubles_and_caps() {
        let now = chrono::Utc::now();
        let at = |failures: i64| {
            (*next_lockout(failures, now).unwrap().get_inner() - now).num_seconds()
        };

        assert_eq!(at(LOCKOUT_THRESHOLD), 60);
        assert_eq!(at(LOCKOUT_THRESHOLD + 1), 120);
        assert_eq!(at(LOCKOUT_THRESHOLD + 2), 240);
        assert_eq!(at(LOCKOUT_THRESHOLD + 20), LOCKOUT_MAX_SECS);
    }

    #[test]
    fn attempt_exactly_at_lock_expiry_is_allowed() {
        let now = chrono::Utc::now();
        let user = user_with(5, Some(now), None);
        assert!(lock_remaining_ms(&user, now).is_none());

        let user = user_with(5, Some(now + chrono::Duration::seconds(30)), None);
        let remaining = lock_remaining_ms(&user, now).unwrap();
        assert!(remaining > 29_000 && remaining <= 30_000);
    }

    #[test]
    fn stale_failures_fall_out_of_the_window() {
        let now = chrono::Utc::now();
        let recent = user_with(4, None, Some(now - chrono::Duration::seconds(60)));
        assert_eq!(effective_failures(&recent, now), 4);

        let stale = user_with(
            4,
            None,
            Some(now - chrono::Duration::seconds(FAILURE_WINDOW_SECS + 1)),
        );
        assert_eq!(effective_failures(&stale, now), 0);

        let never = user_with(4, None, None);
        assert_eq!(effective_failures(&never, now), 0);
    }
}
