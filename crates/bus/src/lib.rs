//! Channel-addressed instrument I/O.
//!
//! A `Transport` answers blocking get/set requests for opaque channel ids;
//! `DeadlineClient` runs each request in a short-lived worker and abandons
//! it at the deadline, so the control path never blocks on I/O for longer
//! than configured.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Field carrying the sample timestamp in sensor payloads.
pub const TIMESTAMP_FIELD: &str = "timestamp";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("request on {channel} timed out after {timeout:?}")]
    Timeout { channel: String, timeout: Duration },
    #[error("transport failure on {channel}: {reason}")]
    Transport { channel: String, reason: String },
    #[error("{channel} rejected write: {reason}")]
    Rejected { channel: String, reason: String },
    #[error("field {0} missing from payload")]
    MissingField(String),
    #[error("field {0} is not numeric")]
    NotNumeric(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Num(f64),
    Text(String),
}

/// One reply payload: named fields, looked up by configuration strings
/// with explicit absence handling.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    fields: BTreeMap<String, Value>,
}

impl Reading {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num(mut self, field: &str, value: f64) -> Self {
        self.fields.insert(field.to_string(), Value::Num(value));
        self
    }

    pub fn with_text(mut self, field: &str, value: impl Into<String>) -> Self {
        self.fields
            .insert(field.to_string(), Value::Text(value.into()));
        self
    }

    pub fn num(&self, field: &str) -> Result<f64, BusError> {
        match self.fields.get(field) {
            Some(Value::Num(v)) => Ok(*v),
            Some(Value::Text(_)) => Err(BusError::NotNumeric(field.to_string())),
            None => Err(BusError::MissingField(field.to_string())),
        }
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(Value::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// Canonical enabled token: the number 1 or the text "1". Anything
    /// else, including a missing field, reads as not-enabled.
    pub fn enabled(&self, field: &str) -> bool {
        match self.fields.get(field) {
            Some(Value::Num(v)) => *v == 1.0,
            Some(Value::Text(s)) => s == "1",
            None => false,
        }
    }
}

pub trait Transport: Send + Sync {
    fn get(&self, channel: &str) -> Result<Reading, BusError>;
    fn set(&self, channel: &str, value: f64) -> Result<Reading, BusError>;
}

/// Deadline-bounded request/reply front end over a blocking transport.
#[derive(Clone)]
pub struct DeadlineClient {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl DeadlineClient {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn get(&self, channel: &str) -> Result<Reading, BusError> {
        let transport = Arc::clone(&self.transport);
        let ch = channel.to_string();
        self.bounded(channel, move || transport.get(&ch))
    }

    pub fn set(&self, channel: &str, value: f64) -> Result<Reading, BusError> {
        let transport = Arc::clone(&self.transport);
        let ch = channel.to_string();
        self.bounded(channel, move || transport.set(&ch, value))
    }

    // Run `call` in a worker and wait at most the deadline. A worker that
    // overruns is abandoned; its result is discarded on arrival.
    fn bounded<F>(&self, channel: &str, call: F) -> Result<Reading, BusError>
    where
        F: FnOnce() -> Result<Reading, BusError> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        thread::spawn(move || {
            let _ = tx.send(call());
        });
        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::debug!("abandoning worker on {channel} after {:?}", self.timeout);
                Err(BusError::Timeout {
                    channel: channel.to_string(),
                    timeout: self.timeout,
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(BusError::Transport {
                channel: channel.to_string(),
                reason: "worker died before replying".to_string(),
            }),
        }
    }
}
