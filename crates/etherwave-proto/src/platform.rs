use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9742;

const DAEMON_TCP_HOST: &str = "127.0.0.1";

pub fn daemon_address() -> String {
    format!("{}:{}", DAEMON_TCP_HOST, DAEMON_TCP_PORT)
}

#[cfg(unix)]
pub fn engine_socket_path() -> PathBuf {
    std::env::temp_dir().join("etherwave-mpv.sock")
}

#[cfg(unix)]
pub fn engine_socket_arg() -> String {
    format!("--input-ipc-server={}", engine_socket_path().display())
}

/// Locate the mpv binary on PATH.
pub fn find_engine_binary() -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join("mpv");
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

pub fn data_dir() -> PathBuf {
    // XDG-style ~/.local/share/etherwave on all unixes (including macOS,
    // where Application Support is deliberately avoided for consistency).
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".local")
        .join("share")
        .join("etherwave")
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("etherwave")
}

pub fn cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".cache")
        .join("etherwave")
}
