//! Platform-specific paths for the device's FieldSign files

use std::path::PathBuf;

/// Get the platform-specific data directory for the queue database
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\FieldSign
/// - macOS: ~/Library/Application Support/FieldSign
/// - Linux/Other: ~/.local/share/FieldSign
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("FieldSign")
}

/// Get the platform-specific config directory
///
/// Returns:
/// - Windows: %APPDATA%\FieldSign
/// - macOS: ~/Library/Application Support/FieldSign
/// - Linux/Other: ~/.config/FieldSign
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("FieldSign")
}

/// Get the default queue database path
pub fn get_default_queue_path() -> PathBuf {
    get_data_dir().join("queue.db")
}

/// Get the default enrollment material path
pub fn get_default_enrollment_path() -> PathBuf {
    get_config_dir().join("enrollment.json")
}

/// Get the default configuration file path
pub fn get_default_config_path() -> PathBuf {
    get_config_dir().join("config.toml")
}

/// Ensure the data directory exists, creating it if necessary
pub fn ensure_data_dir() -> std::io::Result<PathBuf> {
    let dir = get_data_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
