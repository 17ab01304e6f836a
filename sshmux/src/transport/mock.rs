//! Scripted in-memory transport for tests.
//!
//! The session socket is one end of a `UnixStream` pair. Whenever the fake
//! remote produces output it writes a byte to the other end, so readiness
//! polling and the shell event pump behave as they would on a real socket.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::{ScpFileStat, Transport, TransportResult};
use crate::error::TransportError;

#[derive(Debug)]
enum HandleKind {
    Session,
    Shell,
    ScpSend {
        path: PathBuf,
        mode: u32,
        size: u64,
    },
    ScpRecv,
}

/// A fake channel. Dropping it frees it.
#[derive(Debug)]
pub(crate) struct MockHandle {
    pub(crate) id: u64,
    kind: HandleKind,
    stdout: VecDeque<Vec<u8>>,
    stderr: VecDeque<Vec<u8>>,
    received: Vec<u8>,
    exit_status: i32,
    eof: bool,
    fail_reads: bool,
    live: Arc<AtomicUsize>,
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Knobs and recordings of the fake remote.
#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub(crate) fail_open: bool,
    pub(crate) fail_pty: bool,
    pub(crate) fail_shell: bool,
    pub(crate) fail_eof: bool,
    /// Stall for this long whenever the shell pump thread switches to blocking.
    pub(crate) pump_blocking_delay: Option<Duration>,
    pub(crate) shell_would_block: usize,
    pub(crate) rejected_env: Vec<String>,
    pub(crate) write_limit: Option<usize>,
    pub(crate) recv_size_padding: u64,

    pub(crate) blocking: Vec<bool>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) pty: Option<(String, u32, u32)>,
    pub(crate) resizes: Vec<(u32, u32)>,
    pub(crate) commands: Vec<String>,
    pub(crate) shell_input: Vec<u8>,
    pub(crate) eof_sent: Vec<u64>,
    pub(crate) closed: Vec<u64>,
    pub(crate) opened: u64,
    pub(crate) max_live: usize,
    pub(crate) scp_writes: usize,
    pub(crate) files: HashMap<PathBuf, (Vec<u8>, u32)>,
    pub(crate) last_error: String,
}

pub(crate) struct MockTransport {
    local: UnixStream,
    peer: Mutex<UnixStream>,
    live: Arc<AtomicUsize>,
    pub(crate) state: Mutex<MockState>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        // RUST_LOG=sshmux=trace shows the channel traffic of a failing test
        let _ = env_logger::builder().is_test(true).try_init();

        let (local, peer) = UnixStream::pair().expect("socket pair");
        local.set_nonblocking(true).expect("non-blocking socket");
        Arc::new(Self {
            local,
            peer: Mutex::new(peer),
            live: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(MockState::default()),
        })
    }

    pub(crate) fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Number of handles currently allocated.
    pub(crate) fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn put_file(&self, path: impl Into<PathBuf>, data: &[u8], mode: u32) {
        self.state().files.insert(path.into(), (data.to_vec(), mode));
    }

    pub(crate) fn file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.state()
            .files
            .get(path.as_ref())
            .map(|(data, _)| data.clone())
    }

    /// Make the session socket readable.
    fn poke(&self) {
        let _ = self.peer.lock().unwrap().write_all(&[1]);
    }

    fn drain_socket(&self) {
        let mut scratch = [0u8; 256];
        while matches!((&self.local).read(&mut scratch), Ok(n) if n > 0) {}
    }

    fn new_handle(&self, kind: HandleKind) -> MockHandle {
        let mut state = self.state();
        state.opened += 1;
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_live = state.max_live.max(live);
        MockHandle {
            id: state.opened,
            kind,
            stdout: VecDeque::new(),
            stderr: VecDeque::new(),
            received: Vec::new(),
            exit_status: 0,
            eof: false,
            fail_reads: false,
            live: self.live.clone(),
        }
    }

    fn fail<T>(&self, message: &str) -> TransportResult<T> {
        self.state().last_error = message.to_string();
        Err(TransportError::session(-1, message))
    }

    fn read_stream(
        &self,
        stream: &mut VecDeque<Vec<u8>>,
        eof: bool,
        buf: &mut [u8],
    ) -> TransportResult<usize> {
        self.drain_socket();
        match stream.pop_front() {
            Some(mut chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    stream.push_front(chunk.split_off(n));
                }
                Ok(n)
            }
            None if eof => Ok(0),
            None => Err(TransportError::WouldBlock),
        }
    }

    fn respond_to_shell(&self, handle: &mut MockHandle, line: &[u8]) {
        match line {
            b"ls\n" => handle.stdout.push_back(b"Cargo.toml\nsrc\n".to_vec()),
            b"exit\n" => {
                handle.stdout.push_back(b"logout\n".to_vec());
                handle.eof = true;
            }
            other => {
                let mut msg = b"sh: ".to_vec();
                msg.extend_from_slice(other.strip_suffix(b"\n").unwrap_or(other));
                msg.extend_from_slice(b": not found\n");
                handle.stderr.push_back(msg);
            }
        }
        self.poke();
    }
}

impl Transport for MockTransport {
    type Handle = MockHandle;

    fn set_blocking(&self, blocking: bool) {
        let delay = self.state().pump_blocking_delay;
        if let Some(delay) = delay {
            if blocking && thread::current().name() == Some("sshmux-shell") {
                thread::sleep(delay);
            }
        }
        self.state().blocking.push(blocking);
    }

    fn open_channel(&self) -> TransportResult<MockHandle> {
        if self.state().fail_open {
            return self.fail("channel open failure");
        }
        Ok(self.new_handle(HandleKind::Session))
    }

    fn exec(&self, handle: &mut MockHandle, command: &str) -> TransportResult<()> {
        self.state().commands.push(command.to_string());
        if let Some(text) = command.strip_prefix("echo ") {
            handle.stdout.push_back(format!("{text}\n").into_bytes());
            handle.eof = true;
        } else if command == "split-utf8" {
            // "héllo\n" with the two bytes of 'é' in different reads
            handle.stdout.push_back(b"h\xc3".to_vec());
            handle.stdout.push_back(b"\xa9llo\n".to_vec());
            handle.eof = true;
        } else if command == "false" {
            handle.stdout.push_back(b"partial\n".to_vec());
            handle.stderr.push_back(b"command failed\n".to_vec());
            handle.exit_status = 1;
            handle.eof = true;
        } else if command == "broken" {
            handle.fail_reads = true;
        } else if command == "sleep" {
            // Never answers
        } else {
            return self.fail("unknown command");
        }
        self.poke();
        Ok(())
    }

    fn request_pty(
        &self,
        _handle: &mut MockHandle,
        terminal: &str,
        width: u32,
        height: u32,
    ) -> TransportResult<()> {
        if self.state().fail_pty {
            return self.fail("pty request denied");
        }
        self.state().pty = Some((terminal.to_string(), width, height));
        Ok(())
    }

    fn request_pty_size(
        &self,
        _handle: &mut MockHandle,
        width: u32,
        height: u32,
    ) -> TransportResult<()> {
        self.state().resizes.push((width, height));
        Ok(())
    }

    fn set_env(&self, _handle: &mut MockHandle, key: &str, value: &str) -> TransportResult<()> {
        let mut state = self.state();
        if state.rejected_env.iter().any(|k| k == key) {
            return Err(TransportError::session(-22, "env request denied"));
        }
        state.env.push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn shell(&self, handle: &mut MockHandle) -> TransportResult<()> {
        let mut state = self.state();
        if state.shell_would_block > 0 {
            state.shell_would_block -= 1;
            drop(state);
            self.poke();
            return Err(TransportError::WouldBlock);
        }
        if state.fail_shell {
            drop(state);
            return self.fail("shell request denied");
        }
        drop(state);
        handle.kind = HandleKind::Shell;
        handle.stdout.push_back(b"$ ".to_vec());
        self.poke();
        Ok(())
    }

    fn read(&self, handle: &mut MockHandle, buf: &mut [u8]) -> TransportResult<usize> {
        if handle.fail_reads {
            return self.fail("connection reset");
        }
        let eof = handle.eof;
        self.read_stream(&mut handle.stdout, eof, buf)
    }

    fn read_stderr(&self, handle: &mut MockHandle, buf: &mut [u8]) -> TransportResult<usize> {
        let eof = handle.eof;
        self.read_stream(&mut handle.stderr, eof, buf)
    }

    fn write(&self, handle: &mut MockHandle, buf: &[u8]) -> TransportResult<usize> {
        let n = match self.state().write_limit {
            Some(limit) => buf.len().min(limit),
            None => buf.len(),
        };
        match handle.kind {
            HandleKind::Shell => {
                self.state().shell_input.extend_from_slice(&buf[..n]);
                self.respond_to_shell(handle, &buf[..n]);
            }
            HandleKind::ScpSend { .. } => {
                self.state().scp_writes += 1;
                handle.received.extend_from_slice(&buf[..n]);
            }
            HandleKind::Session | HandleKind::ScpRecv => {
                handle.received.extend_from_slice(&buf[..n]);
            }
        }
        Ok(n)
    }

    fn exit_status(&self, handle: &MockHandle) -> i32 {
        handle.exit_status
    }

    fn send_eof(&self, handle: &mut MockHandle) -> TransportResult<()> {
        if self.state().fail_eof {
            return self.fail("eof rejected");
        }
        self.state().eof_sent.push(handle.id);
        if let HandleKind::ScpSend { path, mode, size } = &handle.kind {
            if handle.received.len() as u64 == *size {
                let data = handle.received.clone();
                self.state().files.insert(path.clone(), (data, *mode));
            }
        }
        Ok(())
    }

    fn is_eof(&self, handle: &MockHandle) -> bool {
        handle.eof
    }

    fn wait_eof(&self, handle: &mut MockHandle) -> TransportResult<()> {
        handle.eof = true;
        Ok(())
    }

    fn close(&self, handle: &mut MockHandle) -> TransportResult<()> {
        self.state().closed.push(handle.id);
        Ok(())
    }

    fn wait_closed(&self, _handle: &mut MockHandle) -> TransportResult<()> {
        Ok(())
    }

    fn scp_send(&self, path: &Path, mode: u32, size: u64) -> TransportResult<MockHandle> {
        if path.starts_with("/forbidden") {
            return self.fail("permission denied");
        }
        Ok(self.new_handle(HandleKind::ScpSend {
            path: path.to_path_buf(),
            mode,
            size,
        }))
    }

    fn scp_recv(&self, path: &Path) -> TransportResult<(MockHandle, ScpFileStat)> {
        let file = self.state().files.get(path).cloned();
        let Some((data, mode)) = file else {
            return self.fail("no such file");
        };
        let mut handle = self.new_handle(HandleKind::ScpRecv);
        let stat = ScpFileStat {
            size: data.len() as u64 + self.state().recv_size_padding,
            mode,
        };
        // Deliver in uneven pieces so short reads are exercised
        for chunk in data.chunks(7) {
            handle.stdout.push_back(chunk.to_vec());
        }
        handle.eof = true;
        Ok((handle, stat))
    }

    fn socket(&self) -> RawFd {
        self.local.as_raw_fd()
    }

    fn last_error(&self) -> String {
        self.state().last_error.clone()
    }
}
