//! WARNING: Has to be in sync with `libautopin`, the instrumentation library linked into the
//! observed process.

/// Name of the control socket created in the user's home directory when `CommChan: true`.
pub const DEFAULT_SOCKET_NAME: &str = ".autopin_socket";

/// Maximum length of a Unix domain socket path, including the terminating NUL byte.
pub const SOCKET_PATH_MAX: usize = 108;

/// Size of one message on the wire.
pub const MESSAGE_SIZE: usize = 16;

/// The event tags exchanged over the control channel.
///
/// `Ready` and `SetInterval` are sent by autopin, `PhaseChanged` and `UserEvent` by the
/// observed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    Ready,
    SetInterval,
    PhaseChanged,
    UserEvent,
}

impl EventKind {
    pub const fn tag(self) -> i32 {
        match self {
            EventKind::Ready => 1,
            EventKind::SetInterval => 2,
            EventKind::PhaseChanged => 3,
            EventKind::UserEvent => 4,
        }
    }

    pub const fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            1 => Some(EventKind::Ready),
            2 => Some(EventKind::SetInterval),
            3 => Some(EventKind::PhaseChanged),
            4 => Some(EventKind::UserEvent),
            _ => None,
        }
    }
}

/// One fixed-layout control message.
///
/// Layout (host byte order, native alignment): `i32` tag, `i32` argument, `f64` value.
/// The raw tag is kept so that messages with an unknown tag can still be reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlMessage {
    pub tag: i32,
    pub arg: i32,
    pub value: f64,
}

impl ControlMessage {
    pub fn new(kind: EventKind, arg: i32, value: f64) -> Self {
        Self {
            tag: kind.tag(),
            arg,
            value,
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_tag(self.tag)
    }

    pub fn to_bytes(&self) -> [u8; MESSAGE_SIZE] {
        let mut buffer = [0u8; MESSAGE_SIZE];
        buffer[0..4].copy_from_slice(&self.tag.to_ne_bytes());
        buffer[4..8].copy_from_slice(&self.arg.to_ne_bytes());
        buffer[8..16].copy_from_slice(&self.value.to_ne_bytes());
        buffer
    }

    /// Decodes a message, returning `None` if `bytes` is not exactly one message long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != MESSAGE_SIZE {
            return None;
        }

        let tag = i32::from_ne_bytes(bytes[0..4].try_into().ok()?);
        let arg = i32::from_ne_bytes(bytes[4..8].try_into().ok()?);
        let value = f64::from_ne_bytes(bytes[8..16].try_into().ok()?);
        Some(Self { tag, arg, value })
    }
}
