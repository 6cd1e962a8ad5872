//! In-process stand-in for the chat service.
//!
//! Speaks the same wire contract as the real endpoint: JSON in, JSON echo with
//! `status: "OK"` or `{status: "ERROR", error}` out. Used by `--mode mock` and tests.

use crate::connection::{BoxFuture, Connection, Connector};
use crate::error::ConnectionError;
use crate::generator::MAX_USER_ID;
use crate::message::{ChatPayload, ChatResponse};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Validate and echo every request
    AlwaysOk,
    /// Reject every request with an ERROR reply
    AlwaysError,
    /// Reject a random fraction (0.0..=1.0) of requests
    FailureRate(f64),
    /// Accept the request but never reply
    NeverRespond,
    /// Drop the connection on every n-th send, echo otherwise
    DisconnectEvery(u64),
    /// Replay these replies in order (`None` = no reply); echo once exhausted
    Scripted(Vec<Option<String>>),
}

struct MockShared {
    behavior: MockBehavior,
    latency_ms: AtomicU64,
    connect_delay_ms: AtomicU64,
    script: Mutex<VecDeque<Option<String>>>,
    connect_failures: AtomicU64,
    connects: AtomicU64,
    sends: AtomicU64,
    closes: AtomicU64,
}

/// Mock connector; connections share its counters.
#[derive(Clone)]
pub struct MockConnector {
    shared: Arc<MockShared>,
}

impl MockConnector {
    pub fn new(behavior: MockBehavior) -> Self {
        let script = match &behavior {
            MockBehavior::Scripted(replies) => replies.iter().cloned().collect(),
            _ => VecDeque::new(),
        };
        Self {
            shared: Arc::new(MockShared {
                behavior,
                latency_ms: AtomicU64::new(0),
                connect_delay_ms: AtomicU64::new(0),
                script: Mutex::new(script),
                connect_failures: AtomicU64::new(0),
                connects: AtomicU64::new(0),
                sends: AtomicU64::new(0),
                closes: AtomicU64::new(0),
            }),
        }
    }

    /// Simulated service time per request.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.shared
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.shared
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
        self
    }

    /// Fail the next `n` handshakes.
    pub fn with_connect_failures(self, n: u64) -> Self {
        self.fail_next_connects(n);
        self
    }

    pub fn fail_next_connects(&self, n: u64) {
        self.shared.connect_failures.store(n, Ordering::Relaxed);
    }

    pub fn connects(&self) -> u64 {
        self.shared.connects.load(Ordering::Relaxed)
    }

    pub fn sends(&self) -> u64 {
        self.shared.sends.load(Ordering::Relaxed)
    }

    pub fn closes(&self) -> u64 {
        self.shared.closes.load(Ordering::Relaxed)
    }
}

impl Connector for MockConnector {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn endpoint(&self, room: u32) -> String {
        format!("mock://chat/{room}")
    }

    fn connect(&self, room: u32) -> BoxFuture<'_, Result<Box<dyn Connection>, ConnectionError>> {
        Box::pin(async move {
            let delay_ms = self.shared.connect_delay_ms.load(Ordering::Relaxed);
            if delay_ms > 0 {
                sleep(Duration::from_millis(delay_ms)).await;
            }

            let failing = self
                .shared
                .connect_failures
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ConnectionError::Handshake {
                    url: self.endpoint(room),
                    reason: "connection refused".to_string(),
                });
            }

            self.shared.connects.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(MockConnection {
                shared: self.shared.clone(),
                room,
                open: true,
            }) as Box<dyn Connection>)
        })
    }
}

struct MockConnection {
    shared: Arc<MockShared>,
    room: u32,
    open: bool,
}

impl Connection for MockConnection {
    fn room(&self) -> u32 {
        self.room
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn send_and_wait<'a>(
        &'a mut self,
        payload: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Option<String>, ConnectionError>> {
        Box::pin(async move {
            if !self.open {
                return Err(ConnectionError::Closed);
            }
            let seq = self.shared.sends.fetch_add(1, Ordering::Relaxed) + 1;

            let reply = match &self.shared.behavior {
                MockBehavior::AlwaysOk => Some(respond(payload)),
                MockBehavior::AlwaysError => Some(error_reply("Simulated server failure")),
                MockBehavior::FailureRate(p) => {
                    let fail = rand::thread_rng().gen_bool(p.clamp(0.0, 1.0));
                    if fail {
                        Some(error_reply("Simulated server failure"))
                    } else {
                        Some(respond(payload))
                    }
                }
                MockBehavior::NeverRespond => None,
                MockBehavior::DisconnectEvery(n) => {
                    if *n > 0 && seq % n == 0 {
                        self.open = false;
                        return Err(ConnectionError::Closed);
                    }
                    Some(respond(payload))
                }
                MockBehavior::Scripted(_) => match self.shared.script.lock().pop_front() {
                    Some(scripted) => scripted,
                    None => Some(respond(payload)),
                },
            };

            let latency = Duration::from_millis(self.shared.latency_ms.load(Ordering::Relaxed));
            match reply {
                Some(reply) if latency < timeout => {
                    if !latency.is_zero() {
                        sleep(latency).await;
                    }
                    Ok(Some(reply))
                }
                _ => {
                    sleep(timeout).await;
                    Ok(None)
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.open {
                self.open = false;
                self.shared.closes.fetch_add(1, Ordering::Relaxed);
            }
        })
    }
}

fn error_reply(reason: &str) -> String {
    serde_json::to_string(&ChatResponse::error(reason)).unwrap_or_default()
}

/// Validate a request the way the service does, then echo or reject it.
pub fn respond(payload: &str) -> String {
    let request: ChatPayload = match serde_json::from_str(payload) {
        Ok(request) => request,
        Err(e) => return error_reply(&format!("Invalid JSON format: {e}")),
    };

    let errors = validate(&request);
    if !errors.is_empty() {
        return error_reply(&format!("Validation failed: {}", errors.join("; ")));
    }

    serde_json::to_string(&ChatResponse::ok(request)).unwrap_or_default()
}

pub fn validate(request: &ChatPayload) -> Vec<String> {
    let mut errors = Vec::new();

    match request.user_id.parse::<u32>() {
        Ok(id) if (1..=MAX_USER_ID).contains(&id) => {}
        Ok(_) => errors.push(format!("userId must be between 1 and {MAX_USER_ID}")),
        Err(_) => errors.push("userId must be a numeric string".to_string()),
    }

    let name_len = request.username.chars().count();
    if !(3..=20).contains(&name_len) || !request.username.chars().all(|c| c.is_ascii_alphanumeric()) {
        errors.push("username must be 3-20 alphanumeric characters".to_string());
    }

    let message_len = request.message.chars().count();
    if !(1..=500).contains(&message_len) {
        errors.push("message must be 1-500 characters".to_string());
    }

    if chrono::DateTime::parse_from_rfc3339(&request.timestamp).is_err() {
        errors.push("timestamp is required and must be valid ISO-8601".to_string());
    }

    errors
}
