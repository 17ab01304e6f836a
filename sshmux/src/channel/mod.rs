//! Channel state machine.
//!
//! A [`Channel`] owns at most one transport handle at a time and switches
//! it between exclusive modes (see [`Mode`]). All access to the handle goes
//! through one mutex. Exec and SCP handles are closed after they have been
//! detached and the lock released. A shell is shut down entirely under the
//! lock because the event pump may do it concurrently with a new open.
//!
//! The exec, shell and SCP operations live in [`crate::driver`] as further
//! `impl Channel` blocks.

mod decoder;
mod state;

pub use decoder::Utf8Decoder;
pub use state::Mode;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

pub(crate) use state::ChannelState;

use crate::driver::shell::ShellRegistration;
use crate::error::{ChannelError, Result, TransportError};
use crate::transport::{ChannelConfig, Deadline, Interest, ReadinessWaiter, Transport};

/// A logical channel bound to one transport session.
///
/// Create one per session and reuse it for sequential operations; starting
/// an operation closes whatever the previous one left open. Dropping the
/// channel force-closes any open handle.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use sshmux::{Channel, ChannelConfig, Transport};
///
/// fn uname<T: Transport>(session: Arc<T>) -> Result<String, sshmux::Error> {
///     let channel = Channel::new(session, ChannelConfig::default());
///     channel.execute("uname -a", Duration::from_secs(10))
/// }
/// ```
pub struct Channel<T: Transport> {
    pub(crate) shared: Arc<ChannelShared<T>>,
}

/// State shared between the caller and the shell event pump.
pub(crate) struct ChannelShared<T: Transport> {
    pub(crate) transport: Arc<T>,
    pub(crate) config: ChannelConfig,
    pub(crate) waiter: ReadinessWaiter,
    state: Mutex<ChannelState<T::Handle>>,
    shell: Mutex<Option<Arc<ShellRegistration>>>,
}

impl<T: Transport> Channel<T> {
    /// Create a closed channel on `transport`.
    pub fn new(transport: Arc<T>, config: ChannelConfig) -> Self {
        Self::with_waiter(transport, config, ReadinessWaiter::default())
    }

    /// Create a channel with a custom readiness waiter.
    pub fn with_waiter(transport: Arc<T>, config: ChannelConfig, waiter: ReadinessWaiter) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                transport,
                config,
                waiter,
                state: Mutex::new(ChannelState::default()),
                shell: Mutex::new(None),
            }),
        }
    }

    /// The current mode.
    pub fn mode(&self) -> Mode {
        self.shared.lock_state().mode()
    }

    /// Whether a transport handle is open.
    pub fn is_open(&self) -> bool {
        self.shared.lock_state().is_open()
    }

    /// Output captured by the most recent command execution.
    pub fn last_response(&self) -> Option<String> {
        self.shared.lock_state().last_response().map(str::to_owned)
    }

    /// The channel configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// The underlying transport session.
    pub fn transport(&self) -> &Arc<T> {
        &self.shared.transport
    }

    /// Close whatever is open. Idempotent.
    ///
    /// An active shell is shut down gracefully (EOF, then close) and its
    /// delegate is told the shell closed.
    pub fn close(&self) {
        self.shared.close_any();
    }

    /// Signal end of input. Returns `false` if no handle is open.
    pub fn send_eof(&self) -> bool {
        self.shared.send_eof()
    }

    /// Wait for the remote end to acknowledge EOF.
    pub fn wait_eof(&self) {
        self.shared.wait_eof()
    }
}

impl<T: Transport> Drop for Channel<T> {
    fn drop(&mut self) {
        self.shared.close_any();
    }
}

impl<T: Transport> ChannelShared<T> {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ChannelState<T::Handle>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn shell_slot(&self) -> MutexGuard<'_, Option<Arc<ShellRegistration>>> {
        self.shell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Describe a transport failure, preferring the session's own text.
    pub(crate) fn describe(&self, error: &TransportError) -> String {
        match error {
            TransportError::Session { message, .. } if !message.is_empty() => message.clone(),
            other => {
                let last = self.transport.last_error();
                if last.is_empty() {
                    other.to_string()
                } else {
                    last
                }
            }
        }
    }

    /// Open a session channel in `mode`, applying environment and pty.
    pub(crate) fn open(&self, mode: Mode) -> Result<()> {
        self.open_with(mode, |transport| {
            let mut handle = transport.open_channel().map_err(|e| ChannelError::Allocation {
                message: self.describe(&e),
            })?;

            for (key, value) in &self.config.environment {
                if let Err(e) = transport.set_env(&mut handle, key, value) {
                    debug!("skipping environment variable {}: {}", key, e);
                }
            }

            if self.config.request_pty {
                let terminal = self.config.pty_terminal;
                if let Err(e) = transport.request_pty(
                    &mut handle,
                    terminal.as_str(),
                    self.config.terminal_width,
                    self.config.terminal_height,
                ) {
                    let message = self.describe(&e);
                    self.release(handle);
                    return Err(ChannelError::RequestPty {
                        terminal: terminal.to_string(),
                        message,
                    }
                    .into());
                }
                debug!("pty negotiated: {}", terminal);
            }

            Ok((handle, ()))
        })
    }

    /// Close anything stale, then install the handle produced by `acquire`.
    ///
    /// `acquire` runs under the lock with the transport in blocking mode.
    pub(crate) fn open_with<R, F>(&self, mode: Mode, acquire: F) -> Result<R>
    where
        F: FnOnce(&T) -> Result<(T::Handle, R)>,
    {
        loop {
            self.close_any();

            let mut state = self.lock_state();
            if state.is_open() {
                // Another thread opened a handle between our close and lock
                continue;
            }

            self.transport.set_blocking(true);
            let (handle, extra) = acquire(&self.transport)?;
            state.install(handle, mode);
            debug!("channel opened in {} mode", mode);
            return Ok(extra);
        }
    }

    /// Close the handle, routing an active shell through its shutdown.
    pub(crate) fn close_any(&self) {
        self.close_shell();
        self.close();
    }

    /// Detach the handle under the lock, then close it outside of it.
    pub(crate) fn close(&self) {
        let detached = self.lock_state().take();
        if let Some(handle) = detached {
            self.release(handle);
        }
    }

    /// Gracefully close and free a detached handle.
    pub(crate) fn release(&self, mut handle: T::Handle) {
        self.transport.set_blocking(true);
        match self.transport.close(&mut handle) {
            Ok(()) => {
                if let Err(e) = self.transport.wait_closed(&mut handle) {
                    warn!("channel close was not acknowledged: {}", e);
                }
            }
            Err(e) => warn!("failed to close channel: {}", e),
        }
        drop(handle);
        debug!("channel closed");
    }

    pub(crate) fn send_eof(&self) -> bool {
        let mut state = self.lock_state();
        let Some(handle) = state.handle_mut() else {
            return false;
        };
        match self.transport.send_eof(handle) {
            Ok(()) => true,
            Err(e) => {
                debug!("failed to send EOF: {}", e);
                false
            }
        }
    }

    pub(crate) fn wait_eof(&self) {
        let result = self.waiter.retry(
            self.transport.socket(),
            Interest::Readable,
            &Deadline::never(),
            || {
                let mut state = self.lock_state();
                let Some(handle) = state.handle_mut() else {
                    return Ok(());
                };
                if self.transport.is_eof(handle) {
                    return Ok(());
                }
                self.transport.wait_eof(handle)
            },
        );
        if let Err(e) = result {
            debug!("waiting for remote EOF failed: {}", e);
        }
    }
}
