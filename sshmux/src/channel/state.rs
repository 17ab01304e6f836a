//! Channel mode and the lock-guarded channel state.

use std::fmt;

/// What a channel is currently being used for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Mode {
    /// No handle is open.
    #[default]
    Closed,
    /// Running a single remote command.
    Exec,
    /// Interactive shell session.
    Shell,
    /// SCP upload or download.
    Scp,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Exec => "exec",
            Self::Shell => "shell",
            Self::Scp => "scp",
        };
        f.write_str(name)
    }
}

/// Everything the channel lock guards.
///
/// The handle and the mode only change together: a present handle always
/// comes with a mode other than [`Mode::Closed`].
#[derive(Debug)]
pub(crate) struct ChannelState<H> {
    handle: Option<H>,
    mode: Mode,
    /// Bumped on every install, so a stale owner can tell handles apart.
    generation: u64,
    last_response: Option<String>,
}

impl<H> Default for ChannelState<H> {
    fn default() -> Self {
        Self {
            handle: None,
            mode: Mode::Closed,
            generation: 0,
            last_response: None,
        }
    }
}

impl<H> ChannelState<H> {
    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// The handle, if the channel is open in `mode`.
    pub(crate) fn handle_in(&mut self, mode: Mode) -> Option<&mut H> {
        if self.mode == mode {
            self.handle.as_mut()
        } else {
            None
        }
    }

    /// The handle regardless of mode.
    pub(crate) fn handle_mut(&mut self) -> Option<&mut H> {
        self.handle.as_mut()
    }

    /// Install a freshly opened handle.
    pub(crate) fn install(&mut self, handle: H, mode: Mode) {
        debug_assert!(self.handle.is_none(), "channel handle already open");
        debug_assert!(mode != Mode::Closed, "open channel needs a mode");
        self.handle = Some(handle);
        self.mode = mode;
        self.generation += 1;
    }

    /// Identifies the currently installed handle.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Detach the handle and mark the channel closed.
    pub(crate) fn take(&mut self) -> Option<H> {
        self.mode = Mode::Closed;
        self.handle.take()
    }

    /// Detach the handle only if the channel is open in `mode`.
    pub(crate) fn take_in(&mut self, mode: Mode) -> Option<H> {
        if self.mode == mode {
            self.take()
        } else {
            None
        }
    }

    pub(crate) fn last_response(&self) -> Option<&str> {
        self.last_response.as_deref()
    }

    pub(crate) fn set_last_response(&mut self, response: String) {
        self.last_response = Some(response);
    }
}
