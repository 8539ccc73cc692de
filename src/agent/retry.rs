//! Agent retry queue
//!
//! FIFO of requests whose targets did not respond. The reply-application
//! phase appends; external producers may prepend for urgent delivery. The
//! queue outlives any producer and the agent owns freeing its entries.

use crate::agent::AgentRequest;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

struct RetryEntry {
    request: AgentRequest,
    last_attempt: DateTime<Utc>,
}

/// FIFO retry queue with its own mutex.
#[derive(Default)]
pub struct RetryQueue {
    entries: Mutex<VecDeque<RetryEntry>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        RetryQueue::default()
    }

    /// Append a request that just failed, stamped with its attempt time.
    pub fn append(&self, request: AgentRequest, last_attempt: DateTime<Utc>) {
        self.entries.lock().push_back(RetryEntry {
            request,
            last_attempt,
        });
    }

    /// Prepend an urgent request; it becomes eligible immediately.
    pub fn prepend(&self, request: AgentRequest) {
        self.entries.lock().push_front(RetryEntry {
            request,
            last_attempt: DateTime::<Utc>::MIN_UTC,
        });
    }

    /// Pop the head iff it has waited at least `min_wait`.
    pub fn pop_ready(&self, min_wait: std::time::Duration, now: DateTime<Utc>) -> Option<AgentRequest> {
        let mut entries = self.entries.lock();
        let head = entries.front()?;
        let waited = now.signed_duration_since(head.last_attempt);
        if waited < chrono::Duration::from_std(min_wait).unwrap_or(chrono::Duration::zero()) {
            return None;
        }
        entries.pop_front().map(|e| e.request)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry without dispatching; the shutdown path.
    pub fn drain(&self) -> usize {
        let mut entries = self.entries.lock();
        let n = entries.len();
        entries.clear();
        n
    }

    /// Peek the head request's target names, for tests and diagnostics.
    pub fn head_request<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&AgentRequest) -> R,
    {
        self.entries.lock().front().map(|e| f(&e.request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentTargets;
    use crate::rpc::{MessagePayload, MessageType};
    use std::time::Duration;

    fn ping_request() -> AgentRequest {
        AgentRequest {
            msg_type: MessageType::Ping,
            targets: AgentTargets::HostSet("n0".to_string()),
            retry: true,
            protocol_version: 1,
            r_uid: 0,
            payload: MessagePayload::Ping,
            job_id: None,
        }
    }

    #[test]
    fn min_wait_is_honored() {
        let queue = RetryQueue::new();
        let now = Utc::now();
        queue.append(ping_request(), now);
        assert!(queue
            .pop_ready(Duration::from_secs(10), now + chrono::Duration::seconds(1))
            .is_none());
        assert!(queue
            .pop_ready(Duration::from_secs(10), now + chrono::Duration::seconds(11))
            .is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn prepend_jumps_the_queue_and_fires_immediately() {
        let queue = RetryQueue::new();
        queue.append(ping_request(), Utc::now());
        let mut urgent = ping_request();
        urgent.msg_type = MessageType::Shutdown;
        queue.prepend(urgent);
        let popped = queue.pop_ready(Duration::from_secs(60), Utc::now()).unwrap();
        assert_eq!(popped.msg_type, MessageType::Shutdown);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_frees_everything() {
        let queue = RetryQueue::new();
        queue.append(ping_request(), Utc::now());
        queue.append(ping_request(), Utc::now());
        assert_eq!(queue.drain(), 2);
        assert!(queue.is_empty());
    }
}
