//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Distributed-trace context.
//!
//! A [`Trace`] carries an optional absolute deadline, a label map, and a
//! cancellation state shared by everything holding a clone. Interested
//! parties register one-shot handlers with
//! [`once_inactive`](Trace::once_inactive) and receive a [`Finalizer`]:
//! an atomic claim token that resolves the race between response
//! arrival, deadline expiry, and teardown, so each call is delivered
//! exactly once no matter which path fires first.
//!
//! Traces with a deadline own a timer task holding only a weak
//! reference; dropping every clone of the trace disarms the timer.

use crate::codec::types::{self, Reader};
use crate::error::{codes, SystemError, WireError};
use bytes::{Bytes, BytesMut};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Handshake meta key carrying the absolute call deadline.
pub const META_DEADLINE: &str = "avro.trace.deadline";

/// Handshake meta key carrying the trace labels.
pub const META_LABELS: &str = "avro.trace.labels";

/// One-shot claim token for exactly-once delivery.
///
/// The first caller of [`claim`](Finalizer::claim) wins; every later
/// call observes `false` and must drop its result.
#[derive(Debug, Clone)]
pub struct Finalizer(Arc<AtomicBool>);

impl Finalizer {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Claims delivery. Returns `true` exactly once.
    #[must_use]
    pub fn claim(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

type InactiveHandler = Box<dyn FnOnce(SystemError) + Send>;

enum TraceState {
    Active(Vec<InactiveHandler>),
    Inactive(SystemError),
}

struct TraceInner {
    deadline: Option<SystemTime>,
    labels: Mutex<HashMap<String, Value>>,
    state: Mutex<TraceState>,
}

impl TraceInner {
    fn expire(&self, err: SystemError) {
        let handlers = {
            let mut state = self.state.lock().expect("trace state lock poisoned");
            match &mut *state {
                TraceState::Active(handlers) => {
                    let handlers = std::mem::take(handlers);
                    *state = TraceState::Inactive(err.clone());
                    handlers
                }
                TraceState::Inactive(_) => return,
            }
        };
        for handler in handlers {
            handler(err.clone());
        }
    }
}

/// Deadline, labels, and cancellation context for one logical call tree.
///
/// Cloning shares the same underlying state.
#[derive(Clone)]
pub struct Trace {
    inner: Arc<TraceInner>,
}

impl Trace {
    /// Creates a trace with no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TraceInner {
                deadline: None,
                labels: Mutex::new(HashMap::new()),
                state: Mutex::new(TraceState::Active(Vec::new())),
            }),
        }
    }

    /// Creates a trace that goes inactive at the given absolute time.
    ///
    /// Must be called from within a tokio runtime; the deadline timer is
    /// a spawned task holding only a weak reference. A deadline already
    /// in the past produces a trace that is inactive from the start.
    #[must_use]
    pub fn with_deadline(deadline: SystemTime) -> Self {
        let trace = Self {
            inner: Arc::new(TraceInner {
                deadline: Some(deadline),
                labels: Mutex::new(HashMap::new()),
                state: Mutex::new(TraceState::Active(Vec::new())),
            }),
        };
        match deadline.duration_since(SystemTime::now()) {
            Ok(remaining) => {
                let weak: Weak<TraceInner> = Arc::downgrade(&trace.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(remaining).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.expire(SystemError::new(
                            codes::DEADLINE_EXCEEDED,
                            "trace deadline elapsed",
                        ));
                    }
                });
            }
            Err(_) => {
                trace.inner.expire(SystemError::new(
                    codes::DEADLINE_EXCEEDED,
                    "trace deadline elapsed",
                ));
            }
        }
        trace
    }

    /// Creates a trace expiring after the given duration from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(SystemTime::now() + timeout)
    }

    /// The absolute deadline, if one was set.
    #[must_use]
    pub fn deadline(&self) -> Option<SystemTime> {
        self.inner.deadline
    }

    /// Returns `true` while the trace has not been expired or cancelled.
    #[must_use]
    pub fn active(&self) -> bool {
        matches!(
            *self.inner.state.lock().expect("trace state lock poisoned"),
            TraceState::Active(_)
        )
    }

    /// The error the trace went inactive with, if it has.
    #[must_use]
    pub fn deactivation(&self) -> Option<SystemError> {
        match &*self.inner.state.lock().expect("trace state lock poisoned") {
            TraceState::Active(_) => None,
            TraceState::Inactive(err) => Some(err.clone()),
        }
    }

    /// Sets one label.
    pub fn set_label(&self, key: impl Into<String>, value: Value) {
        self.inner
            .labels
            .lock()
            .expect("trace labels lock poisoned")
            .insert(key.into(), value);
    }

    /// Merges a label map into this trace, later values winning.
    pub fn merge_labels(&self, labels: HashMap<String, Value>) {
        self.inner
            .labels
            .lock()
            .expect("trace labels lock poisoned")
            .extend(labels);
    }

    /// A snapshot of the current labels.
    #[must_use]
    pub fn labels(&self) -> HashMap<String, Value> {
        self.inner
            .labels
            .lock()
            .expect("trace labels lock poisoned")
            .clone()
    }

    /// Registers a handler to run once when the trace goes inactive.
    ///
    /// If the trace is already inactive the handler runs immediately.
    /// The returned [`Finalizer`] is the claim token for whatever
    /// delivery the registration protects.
    pub fn once_inactive<F>(&self, handler: F) -> Finalizer
    where
        F: FnOnce(SystemError) + Send + 'static,
    {
        let immediate = {
            let mut state = self.inner.state.lock().expect("trace state lock poisoned");
            match &mut *state {
                TraceState::Active(handlers) => {
                    handlers.push(Box::new(handler));
                    None
                }
                TraceState::Inactive(err) => Some((handler, err.clone())),
            }
        };
        if let Some((handler, err)) = immediate {
            handler(err);
        }
        Finalizer::new()
    }

    /// Expires the trace with the given error, running registered
    /// handlers. Idempotent.
    pub fn expire(&self, err: SystemError) {
        self.inner.expire(err);
    }

    /// Cancels the trace.
    pub fn cancel(&self) {
        self.expire(SystemError::new(codes::CANCELLED, "trace cancelled"));
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trace")
            .field("deadline", &self.inner.deadline)
            .field("active", &self.active())
            .finish()
    }
}

/// Encodes an absolute deadline as epoch milliseconds.
#[must_use]
pub fn encode_deadline(deadline: SystemTime) -> Bytes {
    let millis = match deadline.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    };
    let mut buf = BytesMut::new();
    types::write_long(&mut buf, millis);
    buf.freeze()
}

/// Decodes an absolute deadline from epoch milliseconds.
pub fn decode_deadline(bytes: &[u8]) -> Result<SystemTime, WireError> {
    let millis = Reader::new(bytes).read_long("trace deadline")?;
    let offset = Duration::from_millis(millis.unsigned_abs());
    Ok(if millis >= 0 {
        UNIX_EPOCH + offset
    } else {
        UNIX_EPOCH - offset
    })
}

/// Encodes a label map as a string map of JSON documents.
pub fn encode_labels(labels: &HashMap<String, Value>) -> Result<Bytes, WireError> {
    let mut rendered = HashMap::with_capacity(labels.len());
    for (key, value) in labels {
        let text = serde_json::to_string(value).map_err(|_| WireError::InvalidJson {
            what: "trace labels",
        })?;
        rendered.insert(key.clone(), text);
    }
    let mut buf = BytesMut::new();
    types::write_map_string(&mut buf, &rendered);
    Ok(buf.freeze())
}

/// Decodes a label map written by [`encode_labels`].
pub fn decode_labels(bytes: &[u8]) -> Result<HashMap<String, Value>, WireError> {
    let rendered = Reader::new(bytes).read_map_string("trace labels")?;
    let mut labels = HashMap::with_capacity(rendered.len());
    for (key, text) in rendered {
        let value = serde_json::from_str(&text).map_err(|_| WireError::InvalidJson {
            what: "trace labels",
        })?;
        labels.insert(key, value);
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    #[test]
    fn test_finalizer_claims_once() {
        let fin = Finalizer::new();
        let twin = fin.clone();
        assert!(fin.claim());
        assert!(!fin.claim());
        assert!(!twin.claim());
    }

    #[tokio::test]
    async fn test_trace_starts_active() {
        let trace = Trace::new();
        assert!(trace.active());
        assert!(trace.deadline().is_none());
        assert!(trace.deactivation().is_none());
    }

    #[tokio::test]
    async fn test_deadline_expires_trace() {
        let trace = Trace::with_timeout(Duration::from_millis(20));
        assert!(trace.active());
        sleep(Duration::from_millis(60)).await;
        assert!(!trace.active());
        let err = trace.deactivation().unwrap();
        assert!(err.is(codes::DEADLINE_EXCEEDED));
    }

    #[tokio::test]
    async fn test_past_deadline_is_inactive_immediately() {
        let trace = Trace::with_deadline(SystemTime::now() - Duration::from_secs(1));
        assert!(!trace.active());
    }

    #[tokio::test]
    async fn test_once_inactive_runs_on_expiry() {
        let trace = Trace::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        let _fin = trace.once_inactive(move |err| {
            assert!(err.is(codes::CANCELLED));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        trace.cancel();
        trace.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_once_inactive_on_dead_trace_runs_immediately() {
        let trace = Trace::new();
        trace.cancel();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        let _fin = trace.once_inactive(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_labels_merge_and_snapshot() {
        let trace = Trace::new();
        trace.set_label("caller", json!("bridge"));
        trace.merge_labels(HashMap::from([("hop".to_owned(), json!(2))]));
        let labels = trace.labels();
        assert_eq!(labels.get("caller").unwrap(), &json!("bridge"));
        assert_eq!(labels.get("hop").unwrap(), &json!(2));
    }

    #[test]
    fn test_deadline_roundtrip() {
        let deadline = UNIX_EPOCH + Duration::from_millis(1_700_000_123_456);
        let encoded = encode_deadline(deadline);
        assert_eq!(decode_deadline(&encoded).unwrap(), deadline);
    }

    #[test]
    fn test_labels_roundtrip() {
        let labels = HashMap::from([
            ("user".to_owned(), json!({"id": 7})),
            ("flag".to_owned(), json!(true)),
        ]);
        let encoded = encode_labels(&labels).unwrap();
        assert_eq!(decode_labels(&encoded).unwrap(), labels);
    }

    #[test]
    fn test_labels_reject_bad_json() {
        let mut buf = BytesMut::new();
        types::write_long(&mut buf, 1);
        types::write_string(&mut buf, "k");
        types::write_string(&mut buf, "{not json");
        types::write_long(&mut buf, 0);
        assert!(matches!(
            decode_labels(&buf).unwrap_err(),
            WireError::InvalidJson { .. }
        ));
    }
}
