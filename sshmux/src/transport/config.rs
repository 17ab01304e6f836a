//! Channel configuration.

use indexmap::IndexMap;
use serde::Deserialize;

/// Default read/write chunk size.
pub const DEFAULT_BUFFER_SIZE: usize = 0x4000;

/// Terminal type announced when a pty is requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PtyTerminal {
    /// Plain terminal without capabilities.
    #[default]
    Vanilla,
    Vt100,
    Vt102,
    Vt220,
    Ansi,
    Xterm,
}

impl PtyTerminal {
    /// The terminal name sent in the pty request.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vanilla => "vanilla",
            Self::Vt100 => "vt100",
            Self::Vt102 => "vt102",
            Self::Vt220 => "vt220",
            Self::Ansi => "ansi",
            Self::Xterm => "xterm",
        }
    }
}

impl std::fmt::Display for PtyTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-channel configuration.
///
/// Every field has a default, so a partial document deserializes:
///
/// ```rust
/// use sshmux::ChannelConfig;
///
/// let config = ChannelConfig::default()
///     .with_pty(sshmux::PtyTerminal::Xterm)
///     .with_env("LANG", "C");
/// assert!(config.request_pty);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelConfig {
    /// Chunk size for reads and writes.
    pub buffer_size: usize,

    /// Whether to negotiate a pty when the channel opens.
    pub request_pty: bool,

    /// Terminal type for the pty request.
    #[serde(rename = "ptyTerminalType")]
    pub pty_terminal: PtyTerminal,

    /// Terminal width for the pty request.
    pub terminal_width: u32,

    /// Terminal height for the pty request.
    pub terminal_height: u32,

    /// Environment variables applied to every new channel, in order.
    #[serde(rename = "environmentVariables")]
    pub environment: IndexMap<String, String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            request_pty: false,
            pty_terminal: PtyTerminal::default(),
            terminal_width: 80,
            terminal_height: 24,
            environment: IndexMap::new(),
        }
    }
}

impl ChannelConfig {
    /// Set the read/write chunk size. Zero falls back to the default.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Request a pty of the given terminal type.
    pub fn with_pty(mut self, terminal: PtyTerminal) -> Self {
        self.request_pty = true;
        self.pty_terminal = terminal;
        self
    }

    /// Set terminal dimensions for the pty request.
    pub fn with_terminal_size(mut self, width: u32, height: u32) -> Self {
        self.terminal_width = width;
        self.terminal_height = height;
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// The chunk size actually used for I/O.
    pub fn chunk_size(&self) -> usize {
        if self.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.buffer_size
        }
    }
}
