//! Scripted in-memory transport for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde_json::{json, Value};

use crate::{GatewayResponse, GatewayTransport, RequestAuth, TransportError};

pub type Reply = Result<GatewayResponse, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedAuth {
    None,
    Cookie(String),
    Bearer(String),
}

impl From<RequestAuth<'_>> for RecordedAuth {
    fn from(auth: RequestAuth<'_>) -> Self {
        match auth {
            RequestAuth::None => Self::None,
            RequestAuth::Cookie(token) => Self::Cookie(token.as_str().to_string()),
            RequestAuth::Bearer(token) => Self::Bearer(token.as_str().to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub auth: RecordedAuth,
    pub body: Option<Value>,
}

#[derive(Default)]
struct MockState {
    scripted: HashMap<(Method, String), VecDeque<Reply>>,
    defaults: HashMap<(Method, String), Reply>,
    requests: Vec<RecordedRequest>,
}

/// Replies come from the per-route queue first, then the route default,
/// then a plain `200 {}`.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, method: Method, path: &str, reply: Reply) -> &Self {
        self.lock()
            .scripted
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
        self
    }

    pub fn set_default(&self, method: Method, path: &str, reply: Reply) -> &Self {
        self.lock().defaults.insert((method, path.to_string()), reply);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn requests_to(&self, method: Method, path: &str) -> Vec<RecordedRequest> {
        self.lock()
            .requests
            .iter()
            .filter(|request| request.method == method && request.path == path)
            .cloned()
            .collect()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reply(&self, method: Method, path: &str, auth: RequestAuth<'_>, body: Option<Value>) -> Reply {
        let mut state = self.lock();
        state.requests.push(RecordedRequest {
            method,
            path: path.to_string(),
            auth: auth.into(),
            body,
        });

        let key = (method, path.to_string());
        if let Some(reply) = state.scripted.get_mut(&key).and_then(VecDeque::pop_front) {
            return reply;
        }
        state
            .defaults
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Ok(GatewayResponse::ok(json!({}))))
    }
}

impl GatewayTransport for MockTransport {
    async fn get(&self, path: &str, auth: RequestAuth<'_>) -> Reply {
        self.reply(Method::Get, path, auth, None)
    }

    async fn post_json(&self, path: &str, body: &Value, auth: RequestAuth<'_>) -> Reply {
        self.reply(Method::Post, path, auth, Some(body.clone()))
    }
}
