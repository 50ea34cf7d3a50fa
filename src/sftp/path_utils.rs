//! Path and naming helpers for remote (always `/`) and local paths.

use std::path::{Path, PathBuf};

use chrono::Utc;

/// Join remote path components using `/` separator.
///
/// Remote paths always use `/` regardless of the local or remote OS.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Final component of a remote path.
pub fn remote_file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Quote `value` for a POSIX shell.
///
/// Single quotes everywhere; embedded `'` becomes `'\''`.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// True when `name` is usable as an environment variable name.
pub fn is_env_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Temp file name unique per session and per call:
/// `<prefix>_<session prefix>_<utc timestamp>.<ext>`.
pub fn unique_temp_name(prefix: &str, session_id: &str, extension: &str) -> String {
    let session_prefix: String = session_id.chars().filter(|c| *c != '-').take(8).collect();
    format!(
        "{}_{}_{}.{}",
        prefix,
        session_prefix,
        Utc::now().format("%Y%m%d%H%M%S%3f"),
        extension
    )
}

/// Local temp directory: the configured one, or the OS default.
pub fn local_temp_dir(configured: Option<&Path>) -> PathBuf {
    configured
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/tmp", "a.zip"), "/tmp/a.zip");
        assert_eq!(join_remote_path("/tmp/", "a.zip"), "/tmp/a.zip");
        assert_eq!(join_remote_path("/", "home"), "/home");
    }

    #[test]
    fn test_remote_file_name() {
        assert_eq!(remote_file_name("/tmp/x/a.zip"), "a.zip");
        assert_eq!(remote_file_name("a.zip"), "a.zip");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/opt/nms/java"), "'/opt/nms/java'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("$HOME; rm -rf /"), "'$HOME; rm -rf /'");
    }

    #[test]
    fn test_env_var_names() {
        assert!(is_env_var_name("NMS_HOME"));
        assert!(is_env_var_name("_x1"));
        assert!(!is_env_var_name(""));
        assert!(!is_env_var_name("1ABC"));
        assert!(!is_env_var_name("A-B"));
        assert!(!is_env_var_name("A;ls"));
    }

    #[test]
    fn test_unique_temp_name_shape() {
        let name = unique_temp_name("provision", "0b9f2c1e-aaaa-bbbb", "zip");
        assert!(name.starts_with("provision_0b9f2c1e_"));
        assert!(name.ends_with(".zip"));
    }
}
