//! Mock adapter for testing
//!
//! This adapter stands in for the Imaging Machine without a socket. It provides:
//! - Scripted replies (default `OK` when the queue is empty)
//! - Controllable failure injection and reply delay
//! - Call logging for test verification
//!
//! Clones share state, so a test can keep one clone for inspection after
//! handing the other to an [`crate::ImagingMachine`].

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::adapter::{AdapterError, HardwareAdapter};

/// Scripted in-memory adapter
///
/// # Example
///
/// ```
/// use im_control::hardware::MockAdapter;
///
/// let adapter = MockAdapter::new();
/// adapter.push_reply("OK script");
/// assert!(adapter.call_log().is_empty());
/// ```
#[derive(Clone, Default)]
pub struct MockAdapter {
    connected: Arc<AtomicBool>,
    should_fail_next: Arc<AtomicBool>,
    replies: Arc<Mutex<VecDeque<String>>>,
    call_log: Arc<Mutex<Vec<String>>>,
    reply_delay: Arc<Mutex<Duration>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockAdapter {
    /// Create a disconnected mock with an empty reply queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the reply for the next query
    pub fn push_reply(&self, reply: impl Into<String>) {
        lock(&self.replies).push_back(reply.into());
    }

    /// Hold every reply back for `delay`, like a slow device
    pub fn set_reply_delay(&self, delay: Duration) {
        *lock(&self.reply_delay) = delay;
    }

    /// Inject a failure for the next operation
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<(), AdapterError> {
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(AdapterError::Injected("mock failure".to_string()));
        }
        Ok(())
    }

    /// Every line written so far, oldest first
    pub fn call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }

    /// Last line written
    pub fn last_call(&self) -> Option<String> {
        lock(&self.call_log).last().cloned()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        lock(&self.call_log).clear();
    }

    fn record(&self, line: &str) -> Result<(), AdapterError> {
        self.check_failure()?;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AdapterError::NotConnected);
        }
        lock(&self.call_log).push(line.to_string());
        Ok(())
    }
}

#[async_trait]
impl HardwareAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&mut self) -> Result<(), AdapterError> {
        self.check_failure()?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), AdapterError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn query(&mut self, line: &str, _timeout: Duration) -> Result<String, AdapterError> {
        self.record(line)?;
        let delay = *lock(&self.reply_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(lock(&self.replies)
            .pop_front()
            .unwrap_or_else(|| "OK".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_adapter_connect() {
        let mut adapter = MockAdapter::new();
        assert!(!adapter.is_connected());
        adapter.connect().await.unwrap();
        assert!(adapter.is_connected());
        adapter.disconnect().await.unwrap();
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_query_when_not_connected() {
        let mut adapter = MockAdapter::new();
        let result = adapter.query("GetMode()", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(AdapterError::NotConnected)));
        assert!(adapter.call_log().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_replies_then_default() {
        let mut adapter = MockAdapter::new();
        adapter.connect().await.unwrap();
        adapter.push_reply("OK script");

        let timeout = Duration::from_secs(1);
        assert_eq!(adapter.query("GetMode()", timeout).await.unwrap(), "OK script");
        assert_eq!(adapter.query("ResetCamera()", timeout).await.unwrap(), "OK");
        assert_eq!(adapter.call_log(), vec!["GetMode()", "ResetCamera()"]);
        assert_eq!(adapter.last_call().as_deref(), Some("ResetCamera()"));
    }

    #[tokio::test]
    async fn test_failure_injection_is_consumed() {
        let mut adapter = MockAdapter::new();
        adapter.connect().await.unwrap();
        adapter.inject_next_failure();

        let timeout = Duration::from_secs(1);
        assert!(adapter.query("GetMode()", timeout).await.is_err());
        assert!(adapter.query("GetMode()", timeout).await.is_ok());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let observer = MockAdapter::new();
        let mut adapter = observer.clone();
        adapter.connect().await.unwrap();
        adapter
            .query("ResetCamera()", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(observer.is_connected());
        assert_eq!(observer.call_log(), vec!["ResetCamera()"]);
        observer.clear_log();
        assert!(adapter.call_log().is_empty());
    }
}
