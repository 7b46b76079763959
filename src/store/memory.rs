//! In-process backing store
//!
//! `MemoryStore` keeps strings, lists and hashes with optional expiry and can
//! inject faults (refused connects, failing commands, dropped connections,
//! added latency). The CLI simulator and the test suites run against it.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use super::transport::{Connector, StoreError, Transport};
use super::types::{Command, Reply};
use crate::purpose::Purpose;

#[derive(Debug, Clone)]
enum Value {
    Str(Bytes),
    List(VecDeque<Bytes>),
    Hash(HashMap<String, Bytes>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

/// Shared in-memory key space with fault injection
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    refuse_connections: AtomicBool,
    failing_commands: AtomicU32,
    generation: AtomicU64,
    latency_micros: AtomicU64,
    connects: AtomicU64,
    commands: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent connect attempt fail
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Fail the next `count` commands with a command-level error
    pub fn fail_next_commands(&self, count: u32) {
        self.failing_commands.store(count, Ordering::SeqCst);
    }

    /// Drop every open connection; their next command reports `Disconnected`
    pub fn disconnect_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Delay every command by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_micros
            .store(u64::try_from(latency.as_micros()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Number of successful connects so far
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of commands applied to the key space
    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_micros.load(Ordering::SeqCst))
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commands
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn apply(&self, command: &Command) -> Result<Reply, StoreError> {
        self.commands.fetch_add(1, Ordering::SeqCst);

        let now = Instant::now();
        let mut data = self
            .data
            .lock()
            .map_err(|_| StoreError::Disconnected("store state poisoned".to_string()))?;

        // Lazily drop the touched key if it expired
        let touched = match command {
            Command::Ping => None,
            Command::Get { key }
            | Command::Set { key, .. }
            | Command::Del { key }
            | Command::Incr { key }
            | Command::Expire { key, .. }
            | Command::HSet { key, .. }
            | Command::HGet { key, .. } => Some(key),
            Command::LPush { queue, .. } | Command::RPop { queue } | Command::LLen { queue } => {
                Some(queue)
            }
        };
        if let Some(key) = touched {
            if data.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
                data.remove(key);
            }
        }

        match command {
            Command::Ping => Ok(Reply::Pong),

            Command::Get { key } => match data.get(key) {
                None => Ok(Reply::Nil),
                Some(Entry { value: Value::Str(v), .. }) => Ok(Reply::Bulk(v.clone())),
                Some(_) => Err(StoreError::Command(WRONG_TYPE.to_string())),
            },

            Command::Set { key, value, ttl } => {
                let mut entry = Entry::new(Value::Str(value.clone()));
                entry.expires_at = ttl.map(|ttl| now + ttl);
                data.insert(key.clone(), entry);
                Ok(Reply::Ok)
            }

            Command::Del { key } => Ok(Reply::Int(data.remove(key).is_some() as i64)),

            Command::Incr { key } => {
                let entry = data
                    .entry(key.clone())
                    .or_insert_with(|| Entry::new(Value::Str(Bytes::from_static(b"0"))));
                let current = match &entry.value {
                    Value::Str(v) => std::str::from_utf8(v)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .ok_or_else(|| {
                            StoreError::Command("value is not an integer".to_string())
                        })?,
                    _ => return Err(StoreError::Command(WRONG_TYPE.to_string())),
                };
                let next = current
                    .checked_add(1)
                    .ok_or_else(|| StoreError::Command("increment would overflow".to_string()))?;
                entry.value = Value::Str(Bytes::from(next.to_string()));
                Ok(Reply::Int(next))
            }

            Command::Expire { key, ttl } => match data.get_mut(key) {
                Some(entry) => {
                    entry.expires_at = Some(now + *ttl);
                    Ok(Reply::Int(1))
                }
                None => Ok(Reply::Int(0)),
            },

            Command::LPush { queue, value } => {
                let entry = data
                    .entry(queue.clone())
                    .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
                match &mut entry.value {
                    Value::List(list) => {
                        list.push_front(value.clone());
                        Ok(Reply::Int(list.len() as i64))
                    }
                    _ => Err(StoreError::Command(WRONG_TYPE.to_string())),
                }
            }

            Command::RPop { queue } => {
                let (reply, now_empty) = match data.get_mut(queue) {
                    None => return Ok(Reply::Nil),
                    Some(Entry { value: Value::List(list), .. }) => {
                        let reply = list.pop_back().map(Reply::Bulk).unwrap_or(Reply::Nil);
                        (reply, list.is_empty())
                    }
                    Some(_) => return Err(StoreError::Command(WRONG_TYPE.to_string())),
                };
                if now_empty {
                    data.remove(queue);
                }
                Ok(reply)
            }

            Command::LLen { queue } => match data.get(queue) {
                None => Ok(Reply::Int(0)),
                Some(Entry { value: Value::List(list), .. }) => Ok(Reply::Int(list.len() as i64)),
                Some(_) => Err(StoreError::Command(WRONG_TYPE.to_string())),
            },

            Command::HSet { key, field, value } => {
                let entry = data
                    .entry(key.clone())
                    .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
                match &mut entry.value {
                    Value::Hash(hash) => {
                        let added = hash.insert(field.clone(), value.clone()).is_none();
                        Ok(Reply::Int(added as i64))
                    }
                    _ => Err(StoreError::Command(WRONG_TYPE.to_string())),
                }
            }

            Command::HGet { key, field } => match data.get(key) {
                None => Ok(Reply::Nil),
                Some(Entry { value: Value::Hash(hash), .. }) => Ok(hash
                    .get(field)
                    .cloned()
                    .map(Reply::Bulk)
                    .unwrap_or(Reply::Nil)),
                Some(_) => Err(StoreError::Command(WRONG_TYPE.to_string())),
            },
        }
    }
}

/// A connection to a [`MemoryStore`]
pub struct MemoryTransport {
    store: Arc<MemoryStore>,
    generation: u64,
    closed: bool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn execute(&mut self, command: &Command) -> Result<Reply, StoreError> {
        if self.closed {
            return Err(StoreError::Disconnected("connection closed".to_string()));
        }
        if self.store.generation.load(Ordering::SeqCst) != self.generation {
            self.closed = true;
            return Err(StoreError::Disconnected("connection reset by peer".to_string()));
        }

        let latency = self.store.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.store.take_injected_failure() {
            return Err(StoreError::Command(format!("injected failure for {}", command.name())));
        }

        self.store.apply(command)
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// [`Connector`] handing out [`MemoryTransport`]s
#[derive(Clone)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, purpose: Purpose) -> Result<Box<dyn Transport>, StoreError> {
        if self.store.refuse_connections.load(Ordering::SeqCst) {
            return Err(StoreError::Connect("connection refused".to_string()));
        }

        self.store.connects.fetch_add(1, Ordering::SeqCst);
        debug!(purpose = %purpose, "Opened in-memory store connection");

        Ok(Box::new(MemoryTransport {
            store: Arc::clone(&self.store),
            generation: self.store.generation.load(Ordering::SeqCst),
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}
