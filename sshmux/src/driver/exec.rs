//! Remote command execution.

use std::time::Duration;

use log::{debug, trace};

use crate::channel::{Channel, ChannelShared, Mode, Utf8Decoder};
use crate::error::{ExecError, Result, TransportError};
use crate::transport::readiness::RetryError;
use crate::transport::{Deadline, Interest, Transport};

/// Result of one read attempt on the exec channel.
enum ReadStep {
    Data { len: usize, eof: bool },
    Closed,
}

/// Why the read loop stopped.
enum Finish {
    Eof,
    TimedOut,
    Failed(String),
}

impl<T: Transport> Channel<T> {
    /// Run `command` and return its standard output.
    ///
    /// A zero `timeout` waits forever. A non-zero exit status is reported
    /// as [`ExecError::Failed`] once the remote signals EOF, together with
    /// the captured stderr.
    pub fn execute(&self, command: &str, timeout: Duration) -> Result<String> {
        let shared = &self.shared;
        shared.open(Mode::Exec)?;

        debug!("exec: {:?}", command);
        let dispatched = {
            let mut state = shared.lock_state();
            match state.handle_in(Mode::Exec) {
                Some(handle) => shared
                    .transport
                    .exec(handle, command)
                    .map_err(|e| shared.describe(&e)),
                None => Err("channel closed".to_string()),
            }
        };
        if let Err(message) = dispatched {
            shared.close();
            return Err(ExecError::Request {
                command: command.to_string(),
                message,
            }
            .into());
        }

        shared.transport.set_blocking(false);
        let deadline = Deadline::after(timeout);
        let fd = shared.transport.socket();

        let mut buf = vec![0u8; shared.config.chunk_size()];
        let mut decoder = Utf8Decoder::new();
        let mut output = String::new();
        let mut stderr: Option<(i32, Vec<u8>)> = None;

        let finish = loop {
            if deadline.is_expired() {
                break Finish::TimedOut;
            }

            let step = shared.waiter.retry(fd, Interest::Readable, &deadline, || {
                let mut state = shared.lock_state();
                let Some(handle) = state.handle_in(Mode::Exec) else {
                    return Ok(ReadStep::Closed);
                };
                let len = shared.transport.read(handle, &mut buf)?;
                capture_stderr(&*shared.transport, handle, &mut stderr);
                Ok(ReadStep::Data {
                    len,
                    eof: shared.transport.is_eof(handle),
                })
            });

            match step {
                Ok(ReadStep::Data { len, eof }) => {
                    trace!("exec: read {} bytes (eof={})", len, eof);
                    output.push_str(&decoder.decode(&buf[..len]));
                    if eof || len == 0 {
                        break Finish::Eof;
                    }
                }
                Ok(ReadStep::Closed) => break Finish::Failed("channel closed".to_string()),
                Err(RetryError::TimedOut(_)) => break Finish::TimedOut,
                Err(RetryError::Transport(e)) => break Finish::Failed(shared.describe(&e)),
            }
        };

        if let Finish::Failed(message) = finish {
            shared.close();
            return Err(ExecError::Response { message }.into());
        }

        drain_and_close(shared, &mut buf, &mut decoder, &mut output, &mut stderr);

        match finish {
            Finish::TimedOut => {
                debug!("exec: {:?} timed out after {:?}", command, timeout);
                Err(ExecError::Timeout {
                    timeout,
                    partial: output,
                }
                .into())
            }
            _ => match stderr {
                Some((exit_status, stderr)) => Err(ExecError::Failed {
                    exit_status,
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    stdout: output,
                }
                .into()),
                None => Ok(output),
            },
        }
    }
}

/// Harvest stderr the first time a non-zero exit status shows up.
///
/// This only records the failure; the read loop keeps going until EOF.
fn capture_stderr<T: Transport>(
    transport: &T,
    handle: &mut T::Handle,
    stderr: &mut Option<(i32, Vec<u8>)>,
) {
    if stderr.is_some() {
        return;
    }
    let status = transport.exit_status(handle);
    if status != 0 {
        let mut scratch = [0u8; 1024];
        let text = drain(&mut scratch, |buf| transport.read_stderr(handle, buf));
        debug!("exec: remote exited with status {}", status);
        *stderr = Some((status, text));
    }
}

/// Read until the stream stops yielding data.
fn drain<F>(buf: &mut [u8], mut read: F) -> Vec<u8>
where
    F: FnMut(&mut [u8]) -> std::result::Result<usize, TransportError>,
{
    let mut out = Vec::new();
    while let Ok(n) = read(buf) {
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

/// Collect residual stdout, store the last response and close the channel.
fn drain_and_close<T: Transport>(
    shared: &ChannelShared<T>,
    buf: &mut [u8],
    decoder: &mut Utf8Decoder,
    output: &mut String,
    stderr: &mut Option<(i32, Vec<u8>)>,
) {
    {
        let mut state = shared.lock_state();
        if let Some(handle) = state.handle_in(Mode::Exec) {
            let residual = drain(buf, |buf| shared.transport.read(handle, buf));
            output.push_str(&decoder.decode(&residual));
            capture_stderr(&*shared.transport, handle, stderr);
        }
        output.push_str(&decoder.finish());
        state.set_last_response(output.clone());
    }
    shared.close();
}
