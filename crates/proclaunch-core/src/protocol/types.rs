//! Scalar wire types: tokens and the single-byte enumerations.

use crate::error::LauncherError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Correlates a client handle with its server-side process entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    /// Token carried by packets that are not about a process (Shutdown).
    pub const NONE: Token = Token(0);

    /// Allocate a process-wide unique token. Never returns [`Token::NONE`].
    pub fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Token(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Token(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declares a `u8`-backed wire enum with lossless conversions.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl $name {
            pub const fn as_u8(self) -> u8 {
                self as u8
            }
        }

        impl TryFrom<u8> for $name {
            type Error = u8;

            fn try_from(value: u8) -> Result<Self, u8> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err(other),
                }
            }
        }
    };
}

wire_enum! {
    /// Packet discriminator.
    pub enum PacketType {
        StartProcess = 0,
        WriteIntoProcess = 1,
        StopProcess = 2,
        Shutdown = 3,
        ProcessError = 4,
        ProcessStarted = 5,
        ReadyReadStandardOutput = 6,
        ReadyReadStandardError = 7,
        ProcessFinished = 8,
    }
}

impl PacketType {
    pub(crate) fn decode(raw: u8) -> Result<Self, LauncherError> {
        PacketType::try_from(raw).map_err(LauncherError::UnknownPacketType)
    }
}

wire_enum! {
    /// Error classification of a process. `UnknownError` means "no error".
    #[derive(Default)]
    pub enum ProcessError {
        FailedToStart = 0,
        Crashed = 1,
        Timedout = 2,
        ReadError = 3,
        WriteError = 4,
        #[default]
        UnknownError = 5,
    }
}

wire_enum! {
    #[derive(Default)]
    pub enum ExitStatus {
        #[default]
        NormalExit = 0,
        CrashExit = 1,
    }
}

wire_enum! {
    /// How stdout and stderr of a process reach the caller.
    #[derive(Default)]
    pub enum ChannelMode {
        #[default]
        SeparateChannels = 0,
        /// stderr is delivered on the stdout channel.
        MergedChannels = 1,
        /// Both channels are written to the caller's own stdout/stderr.
        ForwardedChannels = 2,
        ForwardedOutputChannel = 3,
        ForwardedErrorChannel = 4,
    }
}

impl ChannelMode {
    pub fn forwards_output(self) -> bool {
        matches!(
            self,
            ChannelMode::ForwardedChannels | ChannelMode::ForwardedOutputChannel
        )
    }

    pub fn forwards_error(self) -> bool {
        matches!(
            self,
            ChannelMode::ForwardedChannels | ChannelMode::ForwardedErrorChannel
        )
    }
}

wire_enum! {
    /// Whether the caller keeps writing to stdin after start.
    #[derive(Default)]
    pub enum ProcessMode {
        #[default]
        Reader = 0,
        Writer = 1,
    }
}

/// Coarse process state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessState {
    #[default]
    NotRunning,
    Starting,
    Running,
}
