//! Client identity, open options, status bits, and notifications.
//!
//! Every participant in the graph is a client identified by a [`RefNum`]. Drivers
//! register a client for their hardware ports, in-process modules register
//! internal clients, and out-of-process programs register external clients over
//! the control channel. Clients receive [`Notification`]s through their
//! [`ClientCallbacks`].

use crate::graph::PortId;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Maximum number of clients (and synchro table slots) per server.
pub const MAX_CLIENTS: usize = 64;

/// Reference number of a client within the graph.
///
/// A refnum is the index of the client's slot in the engine's client table and in
/// the synchro table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefNum(u32);

impl RefNum {
    /// Addresses every client at once (used by xrun notifications).
    pub const ALL: RefNum = RefNum(u32::MAX);

    /// Creates a refnum from a slot index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Slot index of this refnum.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Raw numeric value, as reported to callers.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this refnum addresses every client.
    pub const fn is_all(self) -> bool {
        self.0 == u32::MAX
    }
}

impl fmt::Display for RefNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            f.write_str("all")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

macro_rules! bit_set {
    (
        $(#[$meta:meta])*
        $name:ident { $( $(#[$cmeta:meta])* $flag:ident = $value:expr ),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $( $(#[$cmeta])* pub const $flag: $name = $name($value); )*

            /// The empty set.
            pub const fn empty() -> Self {
                Self(0)
            }

            /// Builds a set from raw bits, keeping unknown bits.
            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            /// Raw bit representation.
            pub const fn bits(self) -> u32 {
                self.0
            }

            /// Whether no bit is set.
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// Whether every bit of `other` is set in `self`.
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Sets every bit of `other`.
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

bit_set! {
    /// Status bits reported when opening or loading a client.
    ClientStatus {
        /// The operation failed.
        FAILURE = 0x01,
        /// The options contained an unsupported bit.
        INVALID_OPTION = 0x02,
        /// The requested name was taken; a unique name was generated or the open failed.
        NAME_NOT_UNIQUE = 0x04,
        /// The server was started for this client.
        SERVER_STARTED = 0x08,
        /// The server could not be reached.
        SERVER_FAILED = 0x10,
        /// Communication with the server failed.
        SERVER_ERROR = 0x20,
        /// The addressed client does not exist.
        NO_SUCH_CLIENT = 0x40,
        /// The internal client module could not be loaded.
        LOAD_FAILURE = 0x80,
        /// The internal client module failed to initialize.
        INIT_FAILURE = 0x100,
        /// A shared resource could not be allocated.
        SHM_FAILURE = 0x200,
        /// Protocol version mismatch.
        VERSION_ERROR = 0x400,
    }
}

bit_set! {
    /// Options accepted when opening a client.
    ClientOptions {
        /// Do not start a server if none is running.
        NO_START_SERVER = 0x01,
        /// Fail instead of generating a unique name when the name is taken.
        USE_EXACT_NAME = 0x02,
        /// Connect to a named server.
        SERVER_NAME = 0x04,
        /// Load the internal client from a named module.
        LOAD_NAME = 0x08,
        /// Pass initialization arguments to the internal client.
        LOAD_INIT = 0x10,
        /// Restore a session identifier.
        SESSION_ID = 0x20,
    }
}

impl ClientOptions {
    /// Every option bit the engine understands.
    pub const VALID: ClientOptions = ClientOptions(0x3f);

    /// Whether any unknown option bit is set.
    pub const fn has_invalid_bits(self) -> bool {
        self.0 & !Self::VALID.0 != 0
    }
}

/// What kind of participant a client is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// Client owned by a driver; carries the hardware (physical) ports.
    Driver,
    /// In-process client loaded from a module.
    Internal,
    /// Out-of-process client reached over the control channel.
    External,
}

/// Notification kinds exchanged between the realtime thread and the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    /// A client was added.
    AddClient,
    /// A client was removed.
    RemoveClient,
    /// A client was activated.
    ActivateClient,
    /// A realtime deadline was missed.
    XRun,
    /// The graph processing order changed.
    GraphOrder,
    /// The buffer size changed.
    BufferSize,
    /// The sample rate changed.
    SampleRate,
    /// Freewheel mode started.
    StartFreewheel,
    /// Freewheel mode stopped.
    StopFreewheel,
    /// A port was registered or unregistered.
    PortRegistration,
    /// Two ports were connected or disconnected.
    PortConnect,
    /// The server is shutting down.
    Shutdown,
}

/// Notification delivered to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The buffer size changed to the given number of frames.
    BufferSize(u32),
    /// Freewheel mode started.
    StartFreewheel,
    /// Freewheel mode stopped.
    StopFreewheel,
    /// A realtime deadline was missed.
    XRun,
    /// The graph processing order changed.
    GraphOrder,
    /// A client was registered or removed.
    ClientRegistration {
        /// Name of the client.
        name: String,
        /// `true` on registration, `false` on removal.
        registered: bool,
    },
    /// A port was registered or removed.
    PortRegistration {
        /// The port.
        port: PortId,
        /// `true` on registration, `false` on removal.
        registered: bool,
    },
    /// Two ports were connected or disconnected.
    PortConnect {
        /// Output side.
        src: PortId,
        /// Input side.
        dst: PortId,
        /// `true` on connection, `false` on disconnection.
        connected: bool,
    },
    /// The server is going away.
    Shutdown,
}

/// Callbacks through which the engine reaches a client.
///
/// `notify` runs on a control-plane thread with the engine lock held, so it must
/// not call back into the engine. `process` runs on the client's own thread once
/// per cycle, after the client's synchro slot has been signaled.
pub trait ClientCallbacks: Send + Sync {
    /// Whether this client wants a process thread when activated.
    fn has_process(&self) -> bool {
        false
    }

    /// Processes one cycle of `frames` frames.
    fn process(&self, _frames: u32) {}

    /// Receives a notification.
    fn notify(&self, _notification: &Notification) {}
}

/// Callbacks that ignore everything. Used for driver clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallbacks;

impl ClientCallbacks for NoCallbacks {}

/// Result of a successful client open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedClient {
    /// Assigned reference number.
    pub refnum: RefNum,
    /// Name actually registered (may differ from the requested one).
    pub name: String,
    /// Status bits describing how the open went (never contains `FAILURE`).
    pub status: ClientStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bits_combine() {
        let mut status = ClientStatus::empty();
        assert!(status.is_empty());
        status |= ClientStatus::FAILURE;
        status.insert(ClientStatus::LOAD_FAILURE);
        assert!(status.contains(ClientStatus::FAILURE));
        assert!(status.contains(ClientStatus::LOAD_FAILURE | ClientStatus::FAILURE));
        assert!(!status.contains(ClientStatus::NAME_NOT_UNIQUE));
        assert_eq!(status.bits(), 0x81);
    }

    #[test]
    fn invalid_option_bits_detected() {
        assert!(!ClientOptions::USE_EXACT_NAME.has_invalid_bits());
        assert!(ClientOptions::from_bits(0x100).has_invalid_bits());
    }

    #[test]
    fn refnum_all_displays_as_all() {
        assert_eq!(RefNum::ALL.to_string(), "all");
        assert_eq!(RefNum::new(3).to_string(), "3");
        assert!(RefNum::ALL.is_all());
    }
}
