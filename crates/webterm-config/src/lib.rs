//! Configuration for webterm servers and clients.

use std::time::Duration;

const DEFAULT_SHELL: &str = "/bin/sh";

/// Main configuration structure.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub shell: ShellConfig,
    pub sessions: SessionsConfig,
    pub liveness: LivenessConfig,
    pub client: ClientConfig,
    pub keybinds: KeybindConfig,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub host: String,
    pub port: u16,
    /// Bootstrap page served at `/`. The built-in page is used when unset.
    pub index: Option<std::path::PathBuf>,
    /// Messages queued for one connection before it is dropped as stalled.
    pub outbound_capacity: usize,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell to spawn. Falls back to $SHELL, then "/bin/sh".
    pub program: Option<String>,
    /// Arguments for `program`. Ignored when `program` is unset.
    pub args: Vec<String>,
    /// Value of TERM in the spawned shell.
    pub term: String,
    /// Working directory. Falls back to the home directory.
    pub cwd: Option<std::path::PathBuf>,
}

/// What happens to a connection's sessions when it goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// Destroy every session the connection owned.
    Destroy,
    /// Leave sessions running; only the liveness sweep removes them.
    Keep,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub cols: u16,
    pub rows: u16,
    /// Maximum number of live sessions. Unlimited when unset.
    pub max: Option<usize>,
    /// When the session cap is reached, attach new spawners to the oldest
    /// session instead of failing.
    pub share: bool,
    pub on_disconnect: DisconnectPolicy,
    /// Time a destroyed shell gets to exit after SIGHUP before SIGKILL.
    pub kill_grace_ms: u64,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub sweep_interval_ms: u64,
    /// Sessions not pinged for this long are destroyed.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server to connect to, e.g. "ws://127.0.0.1:8080/ws".
    pub url: String,
    /// Interval between ping/process polls.
    pub poll_interval_ms: u64,
    /// Average glyph cell size in pixels, used to turn window pixels into a grid.
    pub cell_width: u32,
    pub cell_height: u32,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct KeybindConfig {
    /// Keybind that closes the session in `webterm open`.
    /// Format: "Alt-q", "Ctrl-]", etc.
    pub close: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: webterm_protocol::DEFAULT_PORT,
            index: None,
            outbound_capacity: 1024,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            term: "xterm-color".to_string(),
            cwd: None,
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            cols: webterm_protocol::DEFAULT_COLS,
            rows: webterm_protocol::DEFAULT_ROWS,
            max: None,
            share: false,
            on_disconnect: DisconnectPolicy::Destroy,
            kill_grace_ms: 2000,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1000,
            timeout_secs: 60,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: format!(
                "ws://127.0.0.1:{}{}",
                webterm_protocol::DEFAULT_PORT,
                webterm_protocol::WS_PATH
            ),
            poll_interval_ms: 1000,
            cell_width: 7,
            cell_height: 14,
        }
    }
}

impl Default for KeybindConfig {
    fn default() -> Self {
        Self {
            close: "Ctrl-]".to_string(),
        }
    }
}

impl LivenessConfig {
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SessionsConfig {
    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl ClientConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Returns the config file path: ~/.config/webterm/config.toml
#[must_use]
pub fn config_path() -> std::path::PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("~/.config"))
        .join("webterm")
        .join("config.toml")
}

/// Load configuration from default path, falling back to defaults if not found.
pub fn load() -> eyre::Result<Config> {
    load_from(&config_path())
}

/// Load configuration from `path`, falling back to defaults if it does not exist.
pub fn load_from(path: &std::path::Path) -> eyre::Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}

/// Get the effective shell command line.
#[must_use]
pub fn shell_command(config: &ShellConfig) -> Vec<String> {
    if let Some(program) = &config.program {
        let mut command = vec![program.clone()];
        command.extend(config.args.iter().cloned());
        return command;
    }

    let shell = std::env::var("SHELL").unwrap_or_else(|_| DEFAULT_SHELL.to_string());
    // Force interactive mode for shells that need it to load their rc files
    if shell.ends_with("/nu") || shell.ends_with("/nushell") {
        vec![shell, "-l".to_string()]
    } else if shell.ends_with("/bash") || shell.ends_with("/zsh") {
        vec![shell, "-i".to_string()]
    } else {
        vec![shell]
    }
}

/// Get the working directory for new shells.
#[must_use]
pub fn shell_cwd(config: &ShellConfig) -> std::path::PathBuf {
    config
        .cwd
        .clone()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| std::path::PathBuf::from("/"))
}

/// Parsed keybind representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keybind {
    Alt(char),
    Ctrl(char),
}

impl Keybind {
    /// Parse a keybind string like "Alt-q" or "Ctrl-]".
    pub fn parse(s: &str) -> eyre::Result<Self> {
        let (modifier, key) = s
            .split_once('-')
            .ok_or_else(|| eyre::eyre!("Invalid keybind format: {s}"))?;
        let mut chars = key.chars();
        let key = chars
            .next()
            .ok_or_else(|| eyre::eyre!("Missing key in keybind: {s}"))?;
        if chars.next().is_some() {
            eyre::bail!("Keybind must name a single key: {s}");
        }

        match modifier.to_lowercase().as_str() {
            "alt" => Ok(Keybind::Alt(key)),
            "ctrl" => Ok(Keybind::Ctrl(key.to_ascii_lowercase())),
            other => eyre::bail!("Unknown modifier: {other}"),
        }
    }

    /// Find this keybind in `bytes`, returning the offset it starts at.
    #[must_use]
    pub fn find(&self, bytes: &[u8]) -> Option<usize> {
        match self {
            // Alt-key is ESC followed by the character
            Keybind::Alt(c) => bytes
                .windows(2)
                .position(|w| w[0] == 0x1b && w[1] == *c as u8),
            // Ctrl-key is the character with upper bits cleared
            Keybind::Ctrl(c) => {
                let ctrl_byte = (*c as u8) & 0x1f;
                bytes.iter().position(|&b| b == ctrl_byte)
            }
        }
    }
}
