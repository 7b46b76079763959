//! Typed operations understood by the backing store

use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// One operation against the backing store
///
/// Each supported operation is a variant with its own argument shape, so a
/// malformed call does not compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Get { key: String },
    Set { key: String, value: Bytes, ttl: Option<Duration> },
    Del { key: String },
    Incr { key: String },
    Expire { key: String, ttl: Duration },
    LPush { queue: String, value: Bytes },
    RPop { queue: String },
    LLen { queue: String },
    HSet { key: String, field: String, value: Bytes },
    HGet { key: String, field: String },
}

impl Command {
    pub fn get(key: impl Into<String>) -> Self {
        Command::Get { key: key.into() }
    }

    pub fn set(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
            ttl: None,
        }
    }

    pub fn set_ex(key: impl Into<String>, value: impl Into<Bytes>, ttl: Duration) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Command::Del { key: key.into() }
    }

    pub fn incr(key: impl Into<String>) -> Self {
        Command::Incr { key: key.into() }
    }

    pub fn expire(key: impl Into<String>, ttl: Duration) -> Self {
        Command::Expire { key: key.into(), ttl }
    }

    pub fn lpush(queue: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Command::LPush {
            queue: queue.into(),
            value: value.into(),
        }
    }

    pub fn rpop(queue: impl Into<String>) -> Self {
        Command::RPop { queue: queue.into() }
    }

    pub fn llen(queue: impl Into<String>) -> Self {
        Command::LLen { queue: queue.into() }
    }

    pub fn hset(key: impl Into<String>, field: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Command::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn hget(key: impl Into<String>, field: impl Into<String>) -> Self {
        Command::HGet {
            key: key.into(),
            field: field.into(),
        }
    }

    /// Operation name, used in logs and as the circuit breaker operation class
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Del { .. } => "DEL",
            Command::Incr { .. } => "INCR",
            Command::Expire { .. } => "EXPIRE",
            Command::LPush { .. } => "LPUSH",
            Command::RPop { .. } => "RPOP",
            Command::LLen { .. } => "LLEN",
            Command::HSet { .. } => "HSET",
            Command::HGet { .. } => "HGET",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Ping => f.write_str("PING"),
            Command::Get { key }
            | Command::Del { key }
            | Command::Incr { key }
            | Command::Set { key, .. }
            | Command::Expire { key, .. } => write!(f, "{} {}", self.name(), key),
            Command::LPush { queue, .. } | Command::RPop { queue } | Command::LLen { queue } => {
                write!(f, "{} {}", self.name(), queue)
            }
            Command::HSet { key, field, .. } | Command::HGet { key, field } => {
                write!(f, "{} {} {}", self.name(), key, field)
            }
        }
    }
}

/// Store response to a [`Command`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Pong,
    Ok,
    Nil,
    Int(i64),
    Bulk(Bytes),
}

impl Reply {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Reply::Bulk(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }
}
