//! Socket path helpers for the OpenCT IPC.

use std::path::{Path, PathBuf};

/// Default directory holding reader sockets and the status file.
pub const DEFAULT_SOCKET_DIR: &str = "/var/run/openct";

/// Environment variable to override the socket directory.
pub const SOCKET_DIR_ENV_VAR: &str = "OPENCT_SOCKETDIR";

/// Name of the daemon-wide control socket.
pub const MASTER_SOCKET_NAME: &str = "master";

/// Name of the shared status file.
pub const STATUS_FILE_NAME: &str = "status";

/// Get the socket directory to use for IPC.
///
/// Checks the `OPENCT_SOCKETDIR` environment variable first,
/// falling back to `/var/run/openct`.
#[must_use]
pub fn get_socket_dir() -> PathBuf {
    std::env::var(SOCKET_DIR_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET_DIR))
}

/// Socket of reader `index` inside `dir`.
#[must_use]
pub fn reader_socket_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(index.to_string())
}

#[must_use]
pub fn master_socket_path(dir: &Path) -> PathBuf {
    dir.join(MASTER_SOCKET_NAME)
}

#[must_use]
pub fn status_file_path(dir: &Path) -> PathBuf {
    dir.join(STATUS_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_socket_dir_constant() {
        assert_eq!(DEFAULT_SOCKET_DIR, "/var/run/openct");
    }

    #[test]
    fn test_get_socket_dir_returns_path() {
        let path = get_socket_dir();
        assert!(!path.as_os_str().is_empty());
    }

    #[test]
    fn test_paths_inside_dir() {
        let dir = Path::new("/tmp/openct");
        assert_eq!(reader_socket_path(dir, 3), PathBuf::from("/tmp/openct/3"));
        assert_eq!(master_socket_path(dir), PathBuf::from("/tmp/openct/master"));
        assert_eq!(status_file_path(dir), PathBuf::from("/tmp/openct/status"));
    }

    #[test]
    #[ignore = "requires unsafe env manipulation, run with --ignored"]
    fn test_socket_dir_override() {
        // SAFETY: Test is run in isolation with --test-threads=1
        unsafe {
            std::env::set_var(SOCKET_DIR_ENV_VAR, "/tmp/openct-test");
        }

        assert_eq!(get_socket_dir(), PathBuf::from("/tmp/openct-test"));

        // SAFETY: Test is run in isolation with --test-threads=1
        unsafe {
            std::env::remove_var(SOCKET_DIR_ENV_VAR);
        }
    }
}
