//! SCP file transfers.
//!
//! Both directions run with the transport in blocking mode and report
//! progress after every chunk. The progress callback can stop a transfer
//! by returning [`ControlFlow::Break`]; the channel is then closed without
//! sending EOF, so the remote never commits a partial upload.

use std::fs::{self, File, Permissions};
use std::io::{self, Read, Write};
use std::ops::ControlFlow;
use std::os::unix::fs::PermissionsExt;
use std::path::{MAIN_SEPARATOR, Path, PathBuf};

use log::{debug, trace, warn};

use crate::channel::{Channel, ChannelShared, Mode};
use crate::error::{Result, TransferError, TransportError};
use crate::transport::readiness::RetryError;
use crate::transport::{Deadline, Interest, Transport};

/// Cumulative progress of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes moved so far.
    pub transferred: u64,
    /// Size of the file.
    pub total: u64,
}

impl TransferProgress {
    /// Completed fraction in `0.0..=1.0`. An empty file counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.transferred as f64 / self.total as f64
        }
    }
}

/// How a transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every byte was transferred.
    Completed { bytes: u64 },
    /// The progress callback stopped the transfer.
    Aborted { bytes: u64 },
}

impl TransferOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Bytes transferred before the transfer ended.
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Completed { bytes } | Self::Aborted { bytes } => *bytes,
        }
    }
}

impl<T: Transport> Channel<T> {
    /// Upload the local file at `local` to `remote`.
    ///
    /// A `remote` ending in `/` names a directory; the local file name is
    /// appended to it. The remote file gets the local permission bits.
    pub fn upload_file<F>(
        &self,
        local: impl AsRef<Path>,
        remote: impl AsRef<Path>,
        mut progress: F,
    ) -> Result<TransferOutcome>
    where
        F: FnMut(TransferProgress) -> ControlFlow<()>,
    {
        let shared = &self.shared;
        let local = local.as_ref();
        shared.close_any();

        let target = remote_destination(local, remote.as_ref());
        let local_io = |source: io::Error| TransferError::LocalIo {
            path: local.to_path_buf(),
            source,
        };
        let mut file = File::open(local).map_err(local_io)?;
        let metadata = file.metadata().map_err(local_io)?;
        let total = metadata.len();
        let mode = permission_bits(metadata.permissions().mode());

        shared.open_with(Mode::Scp, |transport| {
            let handle = transport.scp_send(&target, mode, total).map_err(|e| {
                TransferError::RemoteOpen {
                    path: target.display().to_string(),
                    message: shared.describe(&e),
                }
            })?;
            Ok((handle, ()))
        })?;
        debug!(
            "scp: uploading {} to {} ({} bytes, mode {:o})",
            local.display(),
            target.display(),
            total,
            mode
        );

        let mut buf = vec![0u8; shared.config.chunk_size()];
        let mut sent = 0u64;

        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    shared.close();
                    return Err(local_io(e).into());
                }
            };

            let mut offset = 0;
            while offset < n {
                let written = match write_chunk(shared, &buf[offset..n]) {
                    Ok(written) => written,
                    Err(message) => {
                        shared.close();
                        return Err(TransferError::Write {
                            transferred: sent,
                            message,
                        }
                        .into());
                    }
                };
                offset += written;
                sent += written as u64;
                trace!("scp: sent {} of {} bytes", sent, total);

                let report = TransferProgress {
                    transferred: sent,
                    total,
                };
                if progress(report).is_break() {
                    debug!("scp: upload of {} aborted after {} bytes", target.display(), sent);
                    shared.close();
                    return Ok(TransferOutcome::Aborted { bytes: sent });
                }
            }
        }

        if !shared.send_eof() {
            let message = match shared.transport.last_error() {
                last if last.is_empty() => "failed to send EOF".to_string(),
                last => last,
            };
            shared.close();
            return Err(TransferError::Write {
                transferred: sent,
                message,
            }
            .into());
        }
        shared.wait_eof();
        shared.close();
        debug!("scp: uploaded {} bytes to {}", sent, target.display());
        Ok(TransferOutcome::Completed { bytes: sent })
    }

    /// Download `remote` to the local path `local`.
    ///
    /// If `local` is an existing directory, or ends with a path separator,
    /// the remote file name is appended to it. An existing file is
    /// truncated. The remote permission bits are applied afterwards.
    pub fn download_file<F>(
        &self,
        remote: impl AsRef<Path>,
        local: impl AsRef<Path>,
        mut progress: F,
    ) -> Result<TransferOutcome>
    where
        F: FnMut(TransferProgress) -> ControlFlow<()>,
    {
        let shared = &self.shared;
        let remote = remote.as_ref();
        shared.close_any();

        let target = local_destination(remote, local.as_ref());
        let local_io = |source: io::Error| TransferError::LocalIo {
            path: target.clone(),
            source,
        };

        let stat = shared.open_with(Mode::Scp, |transport| {
            transport.scp_recv(remote).map_err(|e| {
                TransferError::RemoteOpen {
                    path: remote.display().to_string(),
                    message: shared.describe(&e),
                }
                .into()
            })
        })?;
        let total = stat.size;
        debug!(
            "scp: downloading {} to {} ({} bytes)",
            remote.display(),
            target.display(),
            total
        );

        let mut file = match File::create(&target) {
            Ok(file) => file,
            Err(e) => {
                shared.close();
                return Err(local_io(e).into());
            }
        };

        let mut buf = vec![0u8; shared.config.chunk_size()];
        let mut received = 0u64;

        while received < total {
            let want = usize::try_from(total - received).map_or(buf.len(), |left| left.min(buf.len()));
            let (n, eof) = match read_chunk(shared, &mut buf[..want]) {
                Ok(step) => step,
                Err(message) => {
                    shared.close();
                    return Err(TransferError::Read {
                        transferred: received,
                        message,
                    }
                    .into());
                }
            };

            if n == 0 {
                if eof {
                    shared.close();
                    return Err(TransferError::UnexpectedEof {
                        transferred: received,
                        expected: total,
                    }
                    .into());
                }
                continue;
            }

            if let Err(e) = file.write_all(&buf[..n]) {
                shared.close();
                return Err(local_io(e).into());
            }
            received += n as u64;
            trace!("scp: received {} of {} bytes", received, total);

            let report = TransferProgress {
                transferred: received,
                total,
            };
            if progress(report).is_break() {
                debug!("scp: download of {} aborted after {} bytes", remote.display(), received);
                shared.close();
                return Ok(TransferOutcome::Aborted { bytes: received });
            }
        }

        shared.close();
        drop(file);

        let mode = permission_bits(stat.mode);
        if let Err(e) = fs::set_permissions(&target, Permissions::from_mode(mode)) {
            warn!("could not apply mode {:o} to {}: {}", mode, target.display(), e);
        }
        debug!("scp: downloaded {} bytes to {}", received, target.display());
        Ok(TransferOutcome::Completed { bytes: received })
    }
}

/// Write part of `data` to the SCP channel, returning how much was taken.
fn write_chunk<T: Transport>(shared: &ChannelShared<T>, data: &[u8]) -> std::result::Result<usize, String> {
    shared
        .waiter
        .retry(shared.transport.socket(), Interest::Writable, &Deadline::never(), || {
            let mut state = shared.lock_state();
            let Some(handle) = state.handle_in(Mode::Scp) else {
                return Err(TransportError::session(-1, "channel closed"));
            };
            match shared.transport.write(handle, data)? {
                0 => Err(TransportError::WouldBlock),
                n => Ok(n),
            }
        })
        .map_err(|e| retry_message(shared, e))
}

/// Read from the SCP channel, also reporting whether the remote sent EOF.
fn read_chunk<T: Transport>(
    shared: &ChannelShared<T>,
    buf: &mut [u8],
) -> std::result::Result<(usize, bool), String> {
    shared
        .waiter
        .retry(shared.transport.socket(), Interest::Readable, &Deadline::never(), || {
            let mut state = shared.lock_state();
            let Some(handle) = state.handle_in(Mode::Scp) else {
                return Err(TransportError::session(-1, "channel closed"));
            };
            let n = shared.transport.read(handle, buf)?;
            Ok((n, shared.transport.is_eof(handle)))
        })
        .map_err(|e| retry_message(shared, e))
}

fn retry_message<T: Transport>(shared: &ChannelShared<T>, error: RetryError) -> String {
    match error {
        RetryError::Transport(e) => shared.describe(&e),
        timed_out => timed_out.to_string(),
    }
}

/// Permission bits carried across a transfer, including setuid, setgid and sticky.
fn permission_bits(mode: u32) -> u32 {
    mode & 0o7777
}

/// Remote target of an upload.
fn remote_destination(local: &Path, remote: &Path) -> PathBuf {
    let is_dir = remote.to_string_lossy().ends_with('/');
    match local.file_name() {
        Some(name) if is_dir => remote.join(name),
        _ => remote.to_path_buf(),
    }
}

/// Local target of a download.
fn local_destination(remote: &Path, local: &Path) -> PathBuf {
    let is_dir = local.is_dir() || local.to_string_lossy().ends_with(MAIN_SEPARATOR);
    match remote.file_name() {
        Some(name) if is_dir => local.join(name),
        _ => local.to_path_buf(),
    }
}
