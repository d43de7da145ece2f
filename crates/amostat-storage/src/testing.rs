//! In-memory transport with canned responses and a call log.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::{CrmTransport, Method, Payload, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
enum Canned {
    Body(JsonValue),
    Status(u16),
}

/// Responses queued per `(method, path)`; the last queued response repeats.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    routes: Mutex<HashMap<(Method, String), Vec<Canned>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

fn normalize(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, method: Method, path: &str, canned: Canned) -> &Self {
        self.routes
            .lock()
            .expect("routes lock")
            .entry((method, normalize(path)))
            .or_default()
            .push(canned);
        self
    }

    pub fn respond(&self, method: Method, path: &str, body: JsonValue) -> &Self {
        self.push(method, path, Canned::Body(body))
    }

    pub fn fail(&self, method: Method, path: &str, status: u16) -> &Self {
        self.push(method, path, Canned::Status(status))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn calls_to(&self, method: Method, path: &str) -> Vec<RecordedCall> {
        let path = normalize(path);
        self.calls()
            .into_iter()
            .filter(|c| c.method == method && c.path == path)
            .collect()
    }

    pub fn writes(&self) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method != Method::Get)
            .collect()
    }
}

#[async_trait]
impl CrmTransport for MemoryTransport {
    async fn request(
        &self,
        method: Method,
        path: &str,
        payload: Payload,
    ) -> Result<JsonValue, TransportError> {
        let path = normalize(path);
        self.calls.lock().expect("calls lock").push(RecordedCall {
            method,
            path: path.clone(),
            payload,
        });

        let canned = {
            let mut routes = self.routes.lock().expect("routes lock");
            match routes.get_mut(&(method, path.clone())) {
                Some(queue) if queue.len() > 1 => Some(queue.remove(0)),
                Some(queue) => queue.first().cloned(),
                None => None,
            }
        };

        match canned {
            Some(Canned::Body(body)) => Ok(body),
            Some(Canned::Status(status)) => Err(TransportError::Upstream {
                status,
                url: path,
                body: String::new(),
            }),
            None => Err(TransportError::Upstream {
                status: 404,
                url: path,
                body: "no canned response".into(),
            }),
        }
    }
}
