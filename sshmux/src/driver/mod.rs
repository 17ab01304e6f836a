//! Operations that run on a [`Channel`](crate::Channel).
//!
//! Each driver takes the channel over in its own mode for the duration of
//! the operation and hands it back closed:
//!
//! - `exec`: one remote command, stdout collected as text
//! - `shell`: an interactive session fed by a background event pump
//! - `scp`: file upload and download with progress reporting

mod exec;
pub(crate) mod scp;
pub(crate) mod shell;

pub use scp::{TransferOutcome, TransferProgress};
pub use shell::ShellDelegate;
