//! Queue feeding client input into a live agent run.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::{Result, TroupeError};
use crate::types::{Blob, Content};

/// One item of client input.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LiveRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<Blob>,
    /// Terminal marker; no further requests follow.
    #[serde(default)]
    pub close: bool,
}

impl LiveRequest {
    pub fn content(content: Content) -> Self {
        Self {
            content: Some(content),
            ..Self::default()
        }
    }

    pub fn realtime(blob: Blob) -> Self {
        Self {
            blob: Some(blob),
            ..Self::default()
        }
    }

    pub fn close_signal() -> Self {
        Self {
            close: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    buffer: VecDeque<LiveRequest>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Async queue of [`LiveRequest`]s. Clones share the same queue.
///
/// After [`close`](Self::close), buffered requests are still delivered, then
/// every `get` returns the close signal. Sending to a closed queue fails.
#[derive(Debug, Clone, Default)]
pub struct LiveRequestQueue {
    shared: Arc<Shared>,
}

impl LiveRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, request: LiveRequest) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(TroupeError::QueueClosed);
            }
            state.buffer.push_back(request);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    pub fn send_content(&self, content: Content) -> Result<()> {
        self.send(LiveRequest::content(content))
    }

    pub fn send_realtime(&self, blob: Blob) -> Result<()> {
        self.send(LiveRequest::realtime(blob))
    }

    /// Close the queue. Idempotent.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_waiters();
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Next request, waiting until one is available.
    pub async fn get(&self) -> LiveRequest {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(request) = state.buffer.pop_front() {
                    return request;
                }
                if state.closed {
                    return LiveRequest::close_signal();
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn buffered_items_are_drained_before_close() {
        let queue = LiveRequestQueue::new();
        queue.send_content(Content::user("one")).unwrap();
        queue.send_content(Content::user("two")).unwrap();
        queue.close();

        assert_eq!(queue.get().await.content.unwrap().text(), "one");
        assert_eq!(queue.get().await.content.unwrap().text(), "two");
        assert!(queue.get().await.close);
        assert!(queue.get().await.close);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let queue = LiveRequestQueue::new();
        queue.close();
        let err = queue.send_content(Content::user("late")).unwrap_err();
        assert!(matches!(err, TroupeError::QueueClosed));
    }

    #[tokio::test]
    async fn pending_get_is_woken_by_send() {
        let queue = LiveRequestQueue::new();
        let consumer = queue.clone();
        let waiter = tokio::spawn(async move { consumer.get().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.send_content(Content::user("hi")).unwrap();

        let request = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.content.unwrap().text(), "hi");
    }

    #[tokio::test]
    async fn pending_gets_are_woken_by_close() {
        let queue = LiveRequestQueue::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let consumer = queue.clone();
                tokio::spawn(async move { consumer.get().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        for waiter in waiters {
            let request = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            assert!(request.close);
        }
    }
}
