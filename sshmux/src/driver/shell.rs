//! Interactive shell sessions.
//!
//! Output is delivered by an event pump: a dedicated thread running a
//! single-threaded tokio runtime that waits for the transport socket to
//! become readable and then drains stdout and stderr into the registered
//! [`ShellDelegate`]. Writes, resizes and shutdown happen on the caller's
//! thread and only meet the pump at the channel lock.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;

use crate::channel::{Channel, ChannelShared, Mode, Utf8Decoder};
use crate::error::{Result, ShellError, TransportError, WriteError};
use crate::transport::readiness::RetryError;
use crate::transport::{Deadline, Interest, Transport};

/// How long a resize request may keep blocking.
const RESIZE_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives shell output and lifecycle notifications.
///
/// Every method has a no-op default, so implementors only override what
/// they use. Methods are called from the event pump thread.
pub trait ShellDelegate: Send + Sync {
    /// Decoded stdout text.
    fn on_data(&self, _text: &str) {}

    /// Raw stdout bytes.
    fn on_raw_data(&self, _data: &[u8]) {}

    /// Decoded stderr text.
    fn on_error(&self, _text: &str) {}

    /// Raw stderr bytes.
    fn on_raw_error(&self, _data: &[u8]) {}

    /// The shell has closed. Called exactly once per shell session.
    fn on_shell_closed(&self) {}
}

/// The socket readiness registration of one shell session.
pub(crate) struct ShellRegistration {
    delegate: Arc<dyn ShellDelegate>,
    /// Channel generation of the shell handle this registration serves.
    generation: u64,
    cancelled: AtomicBool,
    finished: AtomicBool,
    wakeup: Notify,
}

impl ShellRegistration {
    fn new(delegate: Arc<dyn ShellDelegate>, generation: u64) -> Self {
        Self {
            delegate,
            generation,
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            wakeup: Notify::new(),
        }
    }

    /// Stop the event pump. Idempotent.
    pub(crate) fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            // notify_one keeps a permit if the pump is not waiting yet
            self.wakeup.notify_one();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if !self.is_cancelled() {
            self.wakeup.notified().await;
        }
    }

    /// Deliver the terminal notification, once.
    fn finish(&self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.delegate.on_shell_closed();
        }
    }
}

/// Borrowed socket descriptor for `AsyncFd`; never closes the fd.
struct SocketFd(RawFd);

impl AsRawFd for SocketFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// What one drain pass found.
#[derive(Debug, PartialEq, Eq)]
enum Drain {
    /// Nothing more to read for now.
    Idle,
    /// EOF or a read error; the channel should close.
    Finished,
    /// The channel was closed or handed to another operation.
    Detached,
}

#[derive(Debug, PartialEq, Eq)]
enum PumpExit {
    Cancelled,
    RemoteClosed,
}

/// Output of one locked read pass.
#[derive(Default)]
struct Chunk {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    finished: bool,
}

impl<T: Transport> Channel<T> {
    /// Start an interactive shell, delivering output to `delegate`.
    ///
    /// Opens the channel (negotiating a pty if configured), registers the
    /// event pump and requests the shell, retrying until `timeout` if the
    /// transport keeps blocking. `None` waits indefinitely.
    pub fn start_shell(
        &self,
        delegate: Arc<dyn ShellDelegate>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let shared = &self.shared;
        shared.open(Mode::Shell)?;
        shared.transport.set_blocking(false);

        let generation = shared.lock_state().generation();
        let registration = Arc::new(ShellRegistration::new(delegate, generation));
        *shared.shell_slot() = Some(registration.clone());
        if let Err(e) = spawn_pump(shared.clone(), registration.clone()) {
            shared.shell_slot().take();
            shared.close();
            return Err(ShellError::Registration(e).into());
        }

        let deadline = Deadline::from(timeout);
        let requested = shared.waiter.retry(
            shared.transport.socket(),
            Interest::Both,
            &deadline,
            || {
                let mut state = shared.lock_state();
                match state.handle_in(Mode::Shell) {
                    Some(handle) => shared.transport.shell(handle),
                    None => Err(TransportError::session(-1, "channel closed")),
                }
            },
        );

        if let Err(e) = requested {
            let message = match e {
                RetryError::TimedOut(timeout) => format!("no answer within {timeout:?}"),
                RetryError::Transport(e) => shared.describe(&e),
            };
            shared.close_shell();
            return Err(ShellError::RequestShell { message }.into());
        }

        debug!("shell started");
        Ok(())
    }

    /// Send input to the shell.
    ///
    /// Fails with [`WriteError::ChannelClosed`] unless a shell is active. A
    /// zero `timeout` waits as long as the transport keeps blocking.
    pub fn write(&self, data: impl AsRef<[u8]>, timeout: Duration) -> Result<()> {
        let data = data.as_ref();
        let shared = &self.shared;
        if shared.lock_state().mode() != Mode::Shell {
            return Err(WriteError::ChannelClosed.into());
        }

        let deadline = Deadline::after(timeout);
        let fd = shared.transport.socket();
        let mut written = 0;

        while written < data.len() {
            let step = shared.waiter.retry(fd, Interest::Writable, &deadline, || {
                let mut state = shared.lock_state();
                let Some(handle) = state.handle_in(Mode::Shell) else {
                    return Ok(None);
                };
                match shared.transport.write(handle, &data[written..])? {
                    0 => Err(TransportError::WouldBlock),
                    n => Ok(Some(n)),
                }
            });

            match step {
                Ok(Some(n)) => {
                    written += n;
                    trace!("shell: wrote {} of {} bytes", written, data.len());
                }
                Ok(None) => return Err(WriteError::ChannelClosed.into()),
                Err(RetryError::TimedOut(_)) => return Err(WriteError::TimedOut { written }.into()),
                Err(RetryError::Transport(e)) => {
                    return Err(WriteError::Transport {
                        message: shared.describe(&e),
                    }
                    .into());
                }
            }
        }

        Ok(())
    }

    /// Ask the remote to resize the pty. Best-effort.
    pub fn request_resize(&self, width: u32, height: u32) -> bool {
        let shared = &self.shared;
        let deadline = Deadline::after(RESIZE_TIMEOUT);
        let result = shared.waiter.retry(
            shared.transport.socket(),
            Interest::Both,
            &deadline,
            || {
                let mut state = shared.lock_state();
                match state.handle_mut() {
                    Some(handle) => shared
                        .transport
                        .request_pty_size(handle, width, height)
                        .map(|()| true),
                    None => Ok(false),
                }
            },
        );

        match result {
            Ok(resized) => resized,
            Err(e) => {
                debug!("resize to {}x{} failed: {}", width, height, e);
                false
            }
        }
    }

    /// Shut the shell down: stop the pump, send EOF and close.
    pub fn close_shell(&self) {
        self.shared.close_shell();
    }
}

impl<T: Transport> ChannelShared<T> {
    pub(crate) fn close_shell(&self) {
        let registration = self.shell_slot().take();
        self.shutdown_shell(registration);
    }

    /// Close the shell only if `registration` is still the active one.
    fn close_shell_for(&self, registration: &Arc<ShellRegistration>) {
        let taken = {
            let mut slot = self.shell_slot();
            match slot.as_ref() {
                Some(active) if Arc::ptr_eq(active, registration) => slot.take(),
                _ => return,
            }
        };
        self.shutdown_shell(taken);
    }

    /// Stop the pump, then EOF and close the shell handle.
    ///
    /// Runs under a single lock acquisition and only touches the shell
    /// handle `registration` was created for (any shell handle when there
    /// is none), so a shutdown that loses the race against a new operation
    /// leaves that operation's handle and blocking mode alone.
    fn shutdown_shell(&self, registration: Option<Arc<ShellRegistration>>) {
        if let Some(registration) = &registration {
            registration.cancel();
        }

        let mut state = self.lock_state();
        if let Some(registration) = &registration {
            if registration.generation != state.generation() {
                return;
            }
        }
        let Some(mut handle) = state.take_in(Mode::Shell) else {
            return;
        };
        self.transport.set_blocking(true);
        if let Err(e) = self.transport.send_eof(&mut handle) {
            debug!("shell: failed to send EOF: {}", e);
        }
        self.release(handle);
    }

    /// Read everything currently available and hand it to the delegate.
    fn drain_shell(
        &self,
        registration: &ShellRegistration,
        buf: &mut [u8],
        decoders: &mut (Utf8Decoder, Utf8Decoder),
    ) -> Drain {
        loop {
            let chunk = {
                let mut state = self.lock_state();
                if registration.is_cancelled() {
                    return Drain::Detached;
                }
                let Some(handle) = state.handle_in(Mode::Shell) else {
                    return Drain::Detached;
                };
                self.read_shell_pass(handle, buf)
            };

            let delegate = &registration.delegate;
            if !chunk.stdout.is_empty() {
                let text = decoders.0.decode(&chunk.stdout);
                if !text.is_empty() {
                    delegate.on_data(&text);
                }
                delegate.on_raw_data(&chunk.stdout);
            }
            if !chunk.stderr.is_empty() {
                let text = decoders.1.decode(&chunk.stderr);
                if !text.is_empty() {
                    delegate.on_error(&text);
                }
                delegate.on_raw_error(&chunk.stderr);
            }

            if chunk.finished {
                return Drain::Finished;
            }
            if chunk.stdout.is_empty() && chunk.stderr.is_empty() {
                return Drain::Idle;
            }
        }
    }

    /// One read of stdout and one of stderr.
    fn read_shell_pass(&self, handle: &mut T::Handle, buf: &mut [u8]) -> Chunk {
        let mut chunk = Chunk::default();

        match self.transport.read(handle, buf) {
            Ok(n) => chunk.stdout.extend_from_slice(&buf[..n]),
            Err(e) if e.is_would_block() => {}
            Err(e) => {
                debug!("shell: stdout read failed: {}", self.describe(&e));
                chunk.finished = true;
            }
        }
        match self.transport.read_stderr(handle, buf) {
            Ok(n) => chunk.stderr.extend_from_slice(&buf[..n]),
            Err(e) if e.is_would_block() => {}
            Err(e) => {
                debug!("shell: stderr read failed: {}", self.describe(&e));
                chunk.finished = true;
            }
        }

        // Only report EOF once everything before it has been delivered
        if chunk.stdout.is_empty() && chunk.stderr.is_empty() && self.transport.is_eof(handle) {
            debug!("shell: remote sent EOF");
            chunk.finished = true;
        }
        chunk
    }
}

/// Register the socket and start the event pump thread.
fn spawn_pump<T: Transport>(
    shared: Arc<ChannelShared<T>>,
    registration: Arc<ShellRegistration>,
) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;
    let socket = {
        let _guard = runtime.enter();
        AsyncFd::with_interest(
            SocketFd(shared.transport.socket()),
            tokio::io::Interest::READABLE,
        )?
    };

    thread::Builder::new()
        .name("sshmux-shell".into())
        .spawn(move || {
            let exit = runtime.block_on(pump(&shared, &registration, &socket));
            drop(socket);
            drop(runtime);

            if exit == PumpExit::RemoteClosed {
                shared.close_shell_for(&registration);
            }
            registration.finish();
            debug!("shell event pump stopped ({:?})", exit);
        })?;
    Ok(())
}

async fn pump<T: Transport>(
    shared: &ChannelShared<T>,
    registration: &ShellRegistration,
    socket: &AsyncFd<SocketFd>,
) -> PumpExit {
    let mut buf = vec![0u8; shared.config.chunk_size()];
    let mut decoders = (Utf8Decoder::new(), Utf8Decoder::new());

    loop {
        // Output may already be buffered in the transport, so drain first
        match shared.drain_shell(registration, &mut buf, &mut decoders) {
            Drain::Idle => {}
            Drain::Finished => return PumpExit::RemoteClosed,
            Drain::Detached => return PumpExit::Cancelled,
        }

        tokio::select! {
            _ = registration.cancelled() => return PumpExit::Cancelled,
            ready = socket.readable() => match ready {
                Ok(mut guard) => guard.clear_ready(),
                Err(e) => {
                    warn!("shell: socket readiness failed: {}", e);
                    return PumpExit::RemoteClosed;
                }
            },
        }
    }
}
