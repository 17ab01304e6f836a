//! # sshmux
//!
//! Channel multiplexing over a single non-blocking SSH transport session.
//!
//! A [`Channel`] sits on top of any session implementing [`Transport`] and
//! runs one operation at a time on it: remote command execution, an
//! interactive shell, or an SCP file transfer. The transport stays
//! non-blocking; whenever it reports would-block the caller's thread waits
//! on the session socket with a [`ReadinessWaiter`].
//!
//! ## Features
//!
//! - Command execution with deadlines and exit-status capture
//! - Interactive shells with output pushed to a [`ShellDelegate`]
//! - SCP upload and download with cancellable progress reporting
//! - Optional pty negotiation and environment propagation via [`ChannelConfig`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::ops::ControlFlow;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use sshmux::{Channel, ChannelConfig, PtyTerminal, ShellDelegate, Transport};
//!
//! struct Printer;
//!
//! impl ShellDelegate for Printer {
//!     fn on_data(&self, text: &str) {
//!         print!("{text}");
//!     }
//! }
//!
//! fn run<T: Transport>(session: Arc<T>) -> Result<(), sshmux::Error> {
//!     let config = ChannelConfig::default()
//!         .with_pty(PtyTerminal::Xterm)
//!         .with_env("LANG", "C.UTF-8");
//!     let channel = Channel::new(session, config);
//!
//!     let kernel = channel.execute("uname -r", Duration::from_secs(10))?;
//!     println!("kernel: {}", kernel.trim());
//!
//!     channel.upload_file("build/app.tar.gz", "/tmp/", |p| {
//!         println!("{:.0}%", p.fraction() * 100.0);
//!         ControlFlow::Continue(())
//!     })?;
//!
//!     channel.start_shell(Arc::new(Printer), Some(Duration::from_secs(5)))?;
//!     channel.write("ls /tmp\n", Duration::from_secs(5))?;
//!     channel.close_shell();
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod driver;
pub mod error;
pub mod transport;

// Re-export main types for convenience
pub use channel::{Channel, Mode, Utf8Decoder};
pub use driver::{ShellDelegate, TransferOutcome, TransferProgress};
pub use error::{Error, Result};
pub use transport::{
    ChannelConfig, Deadline, Interest, PtyTerminal, ReadinessWaiter, ScpFileStat, Transport,
};
