//! Error types for sshmux.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for sshmux operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel lifecycle errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Command execution errors
    #[error("Exec error: {0}")]
    Exec(#[from] ExecError),

    /// Interactive shell errors
    #[error("Shell error: {0}")]
    Shell(#[from] ShellError),

    /// Shell write errors
    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    /// File transfer errors
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
}

/// Errors reported by the underlying transport session.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The non-blocking transport has no data or buffer space right now.
    ///
    /// This is a retry signal and never leaves the crate as an error.
    #[error("Operation would block")]
    WouldBlock,

    /// Session-level failure with the transport's own diagnostic text
    #[error("Session error {code}: {message}")]
    Session { code: i32, message: String },

    /// I/O error on the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Build a session error from a code and message.
    pub fn session(code: i32, message: impl Into<String>) -> Self {
        Self::Session {
            code,
            message: message.into(),
        }
    }

    /// Whether this is the would-block retry signal.
    pub fn is_would_block(&self) -> bool {
        match self {
            Self::WouldBlock => true,
            Self::Io(e) => e.kind() == io::ErrorKind::WouldBlock,
            Self::Session { .. } => false,
        }
    }
}

/// Channel lifecycle errors (allocation, pty negotiation).
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The transport could not produce a channel handle
    #[error("Failed to allocate channel: {message}")]
    Allocation { message: String },

    /// Pty negotiation failed; the channel was closed again
    #[error("Failed to request pty '{terminal}': {message}")]
    RequestPty { terminal: String, message: String },
}

/// Command execution errors.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The command could not be dispatched
    #[error("Failed to execute '{command}': {message}")]
    Request { command: String, message: String },

    /// The remote command exited with a non-zero status
    #[error("Command exited with status {exit_status}: {stderr}")]
    Failed {
        exit_status: i32,
        stderr: String,
        stdout: String,
    },

    /// The deadline passed before the remote signalled EOF
    #[error("Command timed out after {timeout:?}")]
    Timeout { timeout: Duration, partial: String },

    /// A read failed for a reason other than would-block
    #[error("Failed to read command response: {message}")]
    Response { message: String },
}

/// Interactive shell errors.
#[derive(Error, Debug)]
pub enum ShellError {
    /// The remote refused (or never granted) the shell request
    #[error("Failed to request shell: {message}")]
    RequestShell { message: String },

    /// The socket readiness registration could not be created
    #[error("Failed to register shell events: {0}")]
    Registration(#[source] io::Error),
}

/// Shell write errors.
#[derive(Error, Debug)]
pub enum WriteError {
    /// No shell is active on the channel
    #[error("Channel closed")]
    ChannelClosed,

    /// The deadline passed before all bytes were written
    #[error("Connection timed out after writing {written} bytes")]
    TimedOut { written: usize },

    /// The transport rejected the write
    #[error("Write failed: {message}")]
    Transport { message: String },
}

/// File transfer errors.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Reading or writing the local file failed
    #[error("Local file error on {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The remote side refused the SCP channel
    #[error("Failed to open SCP channel for '{path}': {message}")]
    RemoteOpen { path: String, message: String },

    /// Writing to the SCP channel failed
    #[error("SCP write failed after {transferred} bytes: {message}")]
    Write { transferred: u64, message: String },

    /// Reading from the SCP channel failed
    #[error("SCP read failed after {transferred} bytes: {message}")]
    Read { transferred: u64, message: String },

    /// The remote closed the channel before the announced size arrived
    #[error("Remote EOF after {transferred} of {expected} bytes")]
    UnexpectedEof { transferred: u64, expected: u64 },
}

/// Result type alias using sshmux's Error.
pub type Result<T> = std::result::Result<T, Error>;
