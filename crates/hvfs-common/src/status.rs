//! Wire status codes carried in replies
//!
//! Servers answer with a signed 32-bit status. The well-known values get
//! their own variant; anything else is kept verbatim in [`Status::Other`] so
//! callers can always recover the exact code that came off the wire.

use std::fmt;

const OK: i32 = 0;
const NO_MEMORY: i32 = -12;
const FAULT: i32 = -14;
const NOT_FOUND: i32 = -2;
const ALREADY_EXISTS: i32 = -17;
const INVALID_ARGUMENT: i32 = -22;
const RESTART_REQUIRED: i32 = -85;
const SHARD_SPLITTING: i32 = -1025;
const SERVER_BUSY: i32 = -1028;
const RECOVER: i32 = -1030;
const NOT_EXIST: i32 = -1031;

/// Reply status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Fault,
    NoMemory,
    /// The target shard is being split; the request may be resent once
    ShardSplitting,
    /// The server asks for the request to be rebuilt and resent
    RestartRequired,
    /// The server cannot take the request right now
    ServerBusy,
    /// The root service is recovering a previous incarnation of this site
    Recover,
    /// Key exists under the hash but does not match the requested name
    NotExist,
    Other(i32),
}

impl Status {
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            OK => Self::Ok,
            NOT_FOUND => Self::NotFound,
            ALREADY_EXISTS => Self::AlreadyExists,
            INVALID_ARGUMENT => Self::InvalidArgument,
            FAULT => Self::Fault,
            NO_MEMORY => Self::NoMemory,
            SHARD_SPLITTING => Self::ShardSplitting,
            RESTART_REQUIRED => Self::RestartRequired,
            SERVER_BUSY => Self::ServerBusy,
            RECOVER => Self::Recover,
            NOT_EXIST => Self::NotExist,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Ok => OK,
            Self::NotFound => NOT_FOUND,
            Self::AlreadyExists => ALREADY_EXISTS,
            Self::InvalidArgument => INVALID_ARGUMENT,
            Self::Fault => FAULT,
            Self::NoMemory => NO_MEMORY,
            Self::ShardSplitting => SHARD_SPLITTING,
            Self::RestartRequired => RESTART_REQUIRED,
            Self::ServerBusy => SERVER_BUSY,
            Self::Recover => RECOVER,
            Self::NotExist => NOT_EXIST,
            Self::Other(code) => code,
        }
    }

    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Transient reconfiguration states the retry loop knows how to handle
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::ShardSplitting | Self::RestartRequired | Self::ServerBusy
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::InvalidArgument => "invalid argument",
            Self::Fault => "bad reply",
            Self::NoMemory => "out of memory",
            Self::ShardSplitting => "shard splitting",
            Self::RestartRequired => "restart required",
            Self::ServerBusy => "server busy",
            Self::Recover => "recovering",
            Self::NotExist => "name mismatch",
            Self::Other(_) => "error",
        };
        write!(f, "{name} ({})", self.code())
    }
}
