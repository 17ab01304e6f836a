//! Transport session interface.
//!
//! The transport owns the authenticated, encrypted connection. sshmux only
//! drives it through the [`Transport`] trait: every call either completes,
//! fails, or returns [`TransportError::WouldBlock`] when the session is in
//! non-blocking mode and cannot make progress yet.

pub mod config;
#[cfg(test)]
pub(crate) mod mock;
pub mod readiness;

use std::os::unix::io::RawFd;
use std::path::Path;

pub use config::{ChannelConfig, PtyTerminal};
pub use readiness::{Deadline, Interest, ReadinessWaiter};

use crate::error::TransportError;

/// Result type for transport primitives.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Metadata of a remote file announced when an SCP download starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScpFileStat {
    /// File length in bytes.
    pub size: u64,

    /// Permission bits.
    pub mode: u32,
}

/// The session-level primitives a channel is built on.
///
/// Implementations wrap an already authenticated session. Handles are
/// freed by dropping them; [`close`](Self::close) and
/// [`wait_closed`](Self::wait_closed) perform the graceful protocol close
/// beforehand.
pub trait Transport: Send + Sync + 'static {
    /// Transport-level channel handle.
    type Handle: Send + 'static;

    /// Switch the session between blocking and non-blocking mode.
    fn set_blocking(&self, blocking: bool);

    /// Open a new session channel.
    fn open_channel(&self) -> TransportResult<Self::Handle>;

    /// Run a command on the channel.
    fn exec(&self, handle: &mut Self::Handle, command: &str) -> TransportResult<()>;

    /// Request a pseudo-terminal.
    fn request_pty(
        &self,
        handle: &mut Self::Handle,
        terminal: &str,
        width: u32,
        height: u32,
    ) -> TransportResult<()>;

    /// Change the size of an allocated pseudo-terminal.
    fn request_pty_size(
        &self,
        handle: &mut Self::Handle,
        width: u32,
        height: u32,
    ) -> TransportResult<()>;

    /// Set an environment variable for the remote process.
    fn set_env(&self, handle: &mut Self::Handle, key: &str, value: &str) -> TransportResult<()>;

    /// Start the user's login shell on the channel.
    fn shell(&self, handle: &mut Self::Handle) -> TransportResult<()>;

    /// Read from the channel's stdout stream.
    fn read(&self, handle: &mut Self::Handle, buf: &mut [u8]) -> TransportResult<usize>;

    /// Read from the channel's stderr stream.
    fn read_stderr(&self, handle: &mut Self::Handle, buf: &mut [u8]) -> TransportResult<usize>;

    /// Write to the channel's stdin stream.
    fn write(&self, handle: &mut Self::Handle, buf: &[u8]) -> TransportResult<usize>;

    /// Exit status reported by the remote process, 0 until one arrives.
    fn exit_status(&self, handle: &Self::Handle) -> i32;

    /// Signal end of input.
    fn send_eof(&self, handle: &mut Self::Handle) -> TransportResult<()>;

    /// Whether the remote end has sent EOF.
    fn is_eof(&self, handle: &Self::Handle) -> bool;

    /// Wait for the remote end to acknowledge our EOF.
    fn wait_eof(&self, handle: &mut Self::Handle) -> TransportResult<()>;

    /// Send the channel close message.
    fn close(&self, handle: &mut Self::Handle) -> TransportResult<()>;

    /// Wait for the remote close acknowledgement.
    fn wait_closed(&self, handle: &mut Self::Handle) -> TransportResult<()>;

    /// Open a channel that writes a remote file of `size` bytes.
    fn scp_send(&self, path: &Path, mode: u32, size: u64) -> TransportResult<Self::Handle>;

    /// Open a channel that reads a remote file.
    fn scp_recv(&self, path: &Path) -> TransportResult<(Self::Handle, ScpFileStat)>;

    /// The socket the session runs on, for readiness polling.
    fn socket(&self) -> RawFd;

    /// Human-readable description of the last session error.
    fn last_error(&self) -> String;
}
