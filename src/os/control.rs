//! Server side of the control channel: a listening `SOCK_SEQPACKET` socket accepting exactly
//! one peer, the observed process.

use crate::prelude::*;
use autopin_shared::control::{ControlMessage, EventKind, MESSAGE_SIZE, SOCKET_PATH_MAX};
use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, Backlog, MsgFlags, SockFlag, SockType, UnixAddr, accept4, bind, listen, recv,
    send, socket,
};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

const ACCEPT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Unbound,
    Listening,
    Connected,
}

enum ChannelState {
    Unbound,
    Listening {
        listener: OwnedFd,
        path: PathBuf,
    },
    Connected {
        // Kept so the path stays bound until the channel is closed
        _listener: OwnedFd,
        path: PathBuf,
        peer: AsyncFd<OwnedFd>,
        hung_up: bool,
    },
}

pub struct ControlChannel {
    state: ChannelState,
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel {
    pub fn new() -> Self {
        Self {
            state: ChannelState::Unbound,
        }
    }

    pub fn status(&self) -> ChannelStatus {
        match self.state {
            ChannelState::Unbound => ChannelStatus::Unbound,
            ChannelState::Listening { .. } => ChannelStatus::Listening,
            ChannelState::Connected { .. } => ChannelStatus::Connected,
        }
    }

    /// Whether messages from the peer are still expected.
    pub fn is_receiving(&self) -> bool {
        matches!(self.state, ChannelState::Connected { hung_up: false, .. })
    }

    /// Binds a listening socket at `path`, replacing a stale socket file left behind there.
    pub fn open(&mut self, path: &Path) -> Result<()> {
        if !matches!(self.state, ChannelState::Unbound) {
            return Err(Error::comm(
                "already_initialized",
                "The communication channel is already open",
            ));
        }

        let length = path.as_os_str().len();
        if length + 1 > SOCKET_PATH_MAX {
            return Err(Error::comm(
                "comm_target",
                format!(
                    "The path for the communication socket is too long ({length} bytes): {}",
                    path.display()
                ),
            ));
        }

        if std::fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_socket()) {
            debug!("Removing stale socket {}", path.display());
            let _ = std::fs::remove_file(path);
        }

        let listener = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| Error::comm("socket", "Could not create a new socket").with_source(e))?;

        let address = UnixAddr::new(path)
            .map_err(|e| Error::comm("comm_target", "Invalid socket path").with_source(e))?;
        bind(listener.as_raw_fd(), &address).map_err(|e| {
            Error::comm(
                "socket",
                format!("Cannot bind the communication socket to {}", path.display()),
            )
            .with_source(e)
        })?;

        if let Err(e) = Backlog::new(1).and_then(|backlog| listen(&listener, backlog)) {
            let _ = std::fs::remove_file(path);
            return Err(Error::comm("socket", "Cannot listen on the communication socket")
                .with_source(e));
        }

        debug!("Control channel listening at {}", path.display());
        self.state = ChannelState::Listening {
            listener,
            path: path.to_path_buf(),
        };
        Ok(())
    }

    /// Accepts the peer, waiting up to `timeout_secs` seconds, then sends it `READY`.
    pub async fn connect(&mut self, timeout_secs: u64) -> Result<()> {
        let listener_fd = match &self.state {
            ChannelState::Listening { listener, .. } => listener.as_raw_fd(),
            ChannelState::Unbound => {
                return Err(Error::comm(
                    "not_initialized",
                    "The communication channel is not open",
                ));
            }
            ChannelState::Connected { .. } => {
                return Err(Error::comm(
                    "already_initialized",
                    "The observed process is already connected",
                ));
            }
        };

        let mut attempt = 0;
        let peer = loop {
            match accept4(listener_fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
                // SAFETY: accept4 returned a new descriptor that nothing else owns
                Ok(fd) => break unsafe { OwnedFd::from_raw_fd(fd) },
                Err(Errno::EAGAIN | Errno::EINTR) => {}
                Err(e) => {
                    return Err(Error::comm("connect", "Cannot accept the observed process")
                        .with_source(e));
                }
            }

            if attempt >= timeout_secs {
                return Err(Error::comm(
                    "connect",
                    format!("Cannot connect to the observed process (timeout {timeout_secs}s)"),
                ));
            }
            attempt += 1;
            tokio::time::sleep(ACCEPT_RETRY_INTERVAL).await;
        };

        let peer = AsyncFd::with_interest(peer, Interest::READABLE).map_err(|e| {
            Error::comm("connect", format!("Cannot watch the control socket: {e}"))
                .with_io_source(&e)
        })?;

        self.state = match std::mem::replace(&mut self.state, ChannelState::Unbound) {
            ChannelState::Listening { listener, path } => {
                info!("Observed process connected to {}", path.display());
                ChannelState::Connected {
                    _listener: listener,
                    path,
                    peer,
                    hung_up: false,
                }
            }
            state => state,
        };

        self.send(EventKind::Ready, 0, 0.0)
    }

    /// Sends one message to the connected peer.
    pub fn send(&self, kind: EventKind, arg: i32, value: f64) -> Result<()> {
        let ChannelState::Connected { peer, .. } = &self.state else {
            return Err(Error::comm(
                "not_initialized",
                "The observed process is not connected",
            ));
        };

        let message = ControlMessage::new(kind, arg, value);
        let sent = send(
            peer.get_ref().as_raw_fd(),
            &message.to_bytes(),
            MsgFlags::MSG_NOSIGNAL,
        )
        .map_err(|e| Error::comm("send", "Cannot send message").with_source(e))?;

        if sent != MESSAGE_SIZE {
            return Err(Error::comm(
                "send",
                format!("Short write of {sent} bytes on the control channel"),
            ));
        }
        trace!("Sent {kind:?} ({arg}, {value})");
        Ok(())
    }

    /// Waits until the peer is readable and drains every queued message.
    ///
    /// Messages are returned in arrival order. An empty batch is returned when the peer hangs
    /// up, after which [`ControlChannel::is_receiving`] is false.
    pub async fn recv_batch(&mut self) -> Result<Vec<ControlMessage>> {
        let ChannelState::Connected { peer, hung_up, .. } = &mut self.state else {
            return Err(Error::comm(
                "not_initialized",
                "The observed process is not connected",
            ));
        };
        if *hung_up {
            return Ok(Vec::new());
        }

        // Readiness stays consumed while the batch drains and is cleared once the socket
        // would block
        let mut guard = peer.readable().await.map_err(|e| {
            Error::comm("recv", format!("Cannot wait for messages: {e}")).with_io_source(&e)
        })?;

        let mut batch = Vec::new();
        let mut buffer = [0u8; 4 * MESSAGE_SIZE];
        loop {
            match recv(
                guard.get_inner().as_raw_fd(),
                &mut buffer,
                MsgFlags::MSG_DONTWAIT,
            ) {
                Ok(0) => {
                    warn!("The observed process closed the control channel");
                    *hung_up = true;
                    break;
                }
                Ok(read) => match ControlMessage::from_bytes(&buffer[..read]) {
                    Some(message) => batch.push(message),
                    None => warn!("Dropping a malformed control message of {read} bytes"),
                },
                Err(Errno::EAGAIN) => {
                    guard.clear_ready();
                    break;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(Error::comm("recv", "Cannot receive messages").with_source(e));
                }
            }
        }

        Ok(batch)
    }

    /// Closes the sockets and removes the socket file. Safe to call repeatedly.
    pub fn close(&mut self) {
        let path = match std::mem::replace(&mut self.state, ChannelState::Unbound) {
            ChannelState::Unbound => return,
            ChannelState::Listening { path, .. } | ChannelState::Connected { path, .. } => path,
        };

        if let Err(e) = std::fs::remove_file(&path) {
            debug!("Could not remove {}: {e}", path.display());
        }
        debug!("Control channel at {} closed", path.display());
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.close();
    }
}
