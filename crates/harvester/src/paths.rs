use std::path::PathBuf;

pub const APP_NAME: &str = "harvester";

pub fn config_dir() -> PathBuf {
	if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|d| !d.is_empty()) {
		PathBuf::from(dir).join(APP_NAME)
	} else if let Some(home) = home_dir() {
		home.join(".config").join(APP_NAME)
	} else {
		PathBuf::from("/etc").join(APP_NAME)
	}
}

/// Where the configuration is read from when `--config` is not given.
pub fn default_config_path() -> PathBuf {
	config_dir().join("config.toml")
}

fn home_dir() -> Option<PathBuf> {
	std::env::var_os("HOME").filter(|h| !h.is_empty()).map(PathBuf::from)
}
