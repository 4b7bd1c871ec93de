use std::path::PathBuf;
use std::str::FromStr;

use crate::error::BridgeError;

fn traverse_up_for_env_file(file_name: &str) -> Option<PathBuf> {
    let relative_workspace_root = PathBuf::from("./../../").join(file_name);

    if PathBuf::from(file_name).exists() {
        Some(PathBuf::from(file_name))
    } else if relative_workspace_root.exists() {
        Some(relative_workspace_root)
    } else {
        None
    }
}

/// Load `.env` from the current directory or the workspace root, if present.
pub fn load_optional_env_files() {
    if let Some(path) = traverse_up_for_env_file(".env") {
        dotenv::from_filename(path).ok();
    }
}

/// Read an environment variable, falling back to a default when unset.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read and parse an environment variable, falling back to a default when
/// unset. Set-but-unparseable values are a configuration error.
pub fn env_parse<T>(key: &str, default: T) -> Result<T, BridgeError>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|e| BridgeError::InvalidArgument {
            msg: format!("invalid value for {key}: {e}"),
        }),
        Err(_) => Ok(default),
    }
}

/// Read a boolean flag: `1`, `true`, `yes` (case-insensitive) are truthy.
pub fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_rejects_garbage() {
        // SAFETY: test-only mutation of this process's environment
        unsafe { std::env::set_var("SHARED_ENV_TEST_PORT", "not-a-number") };
        let result: Result<u16, _> = env_parse("SHARED_ENV_TEST_PORT", 8700);
        assert!(result.is_err());
        unsafe { std::env::remove_var("SHARED_ENV_TEST_PORT") };
    }

    #[test]
    fn env_parse_defaults_when_unset() {
        let value: u16 = env_parse("SHARED_ENV_TEST_MISSING", 42).unwrap();
        assert_eq!(value, 42);
    }
}
