//! Socket readiness waiting.
//!
//! The transport never suspends the caller: in non-blocking mode it reports
//! [`TransportError::WouldBlock`] and expects to be called again once the
//! socket is ready. [`ReadinessWaiter`] turns that into a thread-blocking
//! wait with `poll(2)`, and [`ReadinessWaiter::retry`] is the one loop every
//! operation uses to retry a primitive until it stops blocking.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use log::trace;
use thiserror::Error;

use super::TransportResult;
use crate::error::TransportError;

/// Upper bound for a single `poll(2)` call.
///
/// Waits are sliced so that loops notice state changes made by other
/// threads (a channel closed underneath them) without a wakeup.
const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(250);

/// I/O direction to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    /// Either direction; used for control requests that may need both.
    Both,
}

impl Interest {
    fn poll_events(self) -> libc::c_short {
        match self {
            Self::Readable => libc::POLLIN,
            Self::Writable => libc::POLLOUT,
            Self::Both => libc::POLLIN | libc::POLLOUT,
        }
    }
}

/// An advisory deadline checked between poll iterations.
///
/// A zero timeout means the operation may wait forever.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
    timeout: Duration,
}

impl Deadline {
    /// Deadline `timeout` from now; zero means no deadline.
    pub fn after(timeout: Duration) -> Self {
        let at = if timeout.is_zero() {
            None
        } else {
            Instant::now().checked_add(timeout)
        };
        Self { at, timeout }
    }

    /// A deadline that never expires.
    pub fn never() -> Self {
        Self {
            at: None,
            timeout: Duration::ZERO,
        }
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// The timeout this deadline was created with.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl From<Option<Duration>> for Deadline {
    fn from(timeout: Option<Duration>) -> Self {
        timeout.map_or_else(Self::never, Self::after)
    }
}

/// Failure of [`ReadinessWaiter::retry`].
#[derive(Error, Debug)]
pub enum RetryError {
    /// The deadline passed while the transport kept blocking.
    #[error("Deadline of {0:?} exceeded")]
    TimedOut(Duration),

    /// The transport failed, or waiting on the socket did.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Blocks the calling thread until the transport socket is ready.
#[derive(Debug, Clone)]
pub struct ReadinessWaiter {
    max_wait: Duration,
}

impl Default for ReadinessWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WAIT)
    }
}

impl ReadinessWaiter {
    /// Create a waiter whose individual waits last at most `max_wait`.
    pub fn new(max_wait: Duration) -> Self {
        Self { max_wait }
    }

    /// Wait until `fd` is ready for `interest` or the deadline passes.
    ///
    /// Returns `Ok(true)` when the socket signalled readiness (including
    /// hang-up or error conditions) and `Ok(false)` on timeout.
    pub fn wait(&self, fd: RawFd, interest: Interest, deadline: &Deadline) -> io::Result<bool> {
        let wait = deadline
            .remaining()
            .map_or(self.max_wait, |remaining| remaining.min(self.max_wait));
        let millis = wait.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        let mut pollfd = libc::pollfd {
            fd,
            events: interest.poll_events(),
            revents: 0,
        };

        loop {
            // SAFETY: one valid pollfd, exclusively borrowed for the call.
            let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            trace!("poll fd={} {:?}: ready={}", fd, interest, rc > 0);
            return Ok(rc > 0);
        }
    }

    /// Run `op` until it stops reporting would-block.
    ///
    /// Between attempts the calling thread waits on `fd`. Once the deadline
    /// has passed, a would-block result ends the loop with
    /// [`RetryError::TimedOut`]; any other failure is returned as-is.
    pub fn retry<T, F>(
        &self,
        fd: RawFd,
        interest: Interest,
        deadline: &Deadline,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> TransportResult<T>,
    {
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_would_block() => {
                    if deadline.is_expired() {
                        return Err(RetryError::TimedOut(deadline.timeout()));
                    }
                    self.wait(fd, interest, deadline)
                        .map_err(TransportError::Io)?;
                }
                Err(e) => return Err(RetryError::Transport(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn test_zero_timeout_never_expires() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(!deadline.is_expired());
        assert!(deadline.remaining().is_none());
    }

    #[test]
    fn test_deadline_expires() {
        let deadline = Deadline::after(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_wait_times_out_on_idle_socket() {
        let (local, _peer) = UnixStream::pair().unwrap();
        let waiter = ReadinessWaiter::default();
        let deadline = Deadline::after(Duration::from_millis(10));

        let ready = waiter
            .wait(local.as_raw_fd(), Interest::Readable, &deadline)
            .unwrap();
        assert!(!ready);
    }

    #[test]
    fn test_wait_sees_readable_socket() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        peer.write_all(b"x").unwrap();

        let waiter = ReadinessWaiter::default();
        let ready = waiter
            .wait(local.as_raw_fd(), Interest::Readable, &Deadline::never())
            .unwrap();
        assert!(ready);
    }

    #[test]
    fn test_retry_until_ready() {
        let (local, _peer) = UnixStream::pair().unwrap();
        let waiter = ReadinessWaiter::new(Duration::from_millis(1));
        let mut attempts = 0;

        let value = waiter
            .retry(local.as_raw_fd(), Interest::Writable, &Deadline::never(), || {
                attempts += 1;
                if attempts < 3 {
                    Err(TransportError::WouldBlock)
                } else {
                    Ok(attempts)
                }
            })
            .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_retry_times_out() {
        let (local, _peer) = UnixStream::pair().unwrap();
        let waiter = ReadinessWaiter::new(Duration::from_millis(1));
        let deadline = Deadline::after(Duration::from_millis(5));

        let result: Result<(), _> = waiter.retry(local.as_raw_fd(), Interest::Readable, &deadline, || {
            Err(TransportError::WouldBlock)
        });
        assert!(matches!(result, Err(RetryError::TimedOut(_))));
    }

    #[test]
    fn test_retry_passes_through_errors() {
        let (local, _peer) = UnixStream::pair().unwrap();
        let waiter = ReadinessWaiter::default();

        let result: Result<(), _> = waiter.retry(local.as_raw_fd(), Interest::Both, &Deadline::never(), || {
            Err(TransportError::session(-7, "socket send failed"))
        });
        assert!(matches!(
            result,
            Err(RetryError::Transport(TransportError::Session { code: -7, .. }))
        ));
    }
}
