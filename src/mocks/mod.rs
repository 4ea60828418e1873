//! Mock upstream operations for testing.
//!
//! A [`MockOperation`] replays scripted outcomes and counts invocations, so
//! tests can assert exactly how often the layer reached the upstream.

use crate::errors::{ResilienceError, ResilienceResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted outcome
#[derive(Debug, Clone)]
pub struct MockResponse<T> {
    /// Value or error to return
    pub outcome: ResilienceResult<T>,
    /// Delay before returning
    pub delay: Option<Duration>,
}

impl<T> MockResponse<T> {
    /// Succeed with a value
    pub fn ok(value: T) -> Self {
        Self {
            outcome: Ok(value),
            delay: None,
        }
    }

    /// Fail with an error
    pub fn error(error: impl Into<ResilienceError>) -> Self {
        Self {
            outcome: Err(error.into()),
            delay: None,
        }
    }

    /// Add delay to response
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

struct MockState<T> {
    responses: Mutex<VecDeque<MockResponse<T>>>,
    default_response: Mutex<Option<MockResponse<T>>>,
    calls: AtomicU32,
}

/// Scripted upstream operation.
///
/// Cloning yields another handle to the same script and call counter.
pub struct MockOperation<T> {
    state: Arc<MockState<T>>,
}

impl<T> Clone for MockOperation<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> MockOperation<T>
where
    T: Clone + Send + 'static,
{
    /// Create a mock with an empty script
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                responses: Mutex::new(VecDeque::new()),
                default_response: Mutex::new(None),
                calls: AtomicU32::new(0),
            }),
        }
    }

    /// Queue a response
    pub fn push(&self, response: MockResponse<T>) -> &Self {
        self.state.responses.lock().push_back(response);
        self
    }

    /// Queue a success
    pub fn push_ok(&self, value: T) -> &Self {
        self.push(MockResponse::ok(value))
    }

    /// Queue a failure
    pub fn push_error(&self, error: impl Into<ResilienceError>) -> &Self {
        self.push(MockResponse::error(error))
    }

    /// Response used once the queue is exhausted
    pub fn set_default(&self, response: MockResponse<T>) -> &Self {
        *self.state.default_response.lock() = Some(response);
        self
    }

    /// Number of invocations so far
    pub fn calls(&self) -> u32 {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Invoke the operation once
    pub fn call(&self) -> BoxFuture<'static, ResilienceResult<T>> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);

        let next = self
            .state
            .responses
            .lock()
            .pop_front()
            .or_else(|| self.state.default_response.lock().clone());

        async move {
            let Some(response) = next else {
                return Err(ResilienceError::Upstream(
                    crate::errors::UpstreamError::Other {
                        message: "mock script exhausted".to_string(),
                    },
                ));
            };
            if let Some(delay) = response.delay {
                tokio::time::sleep(delay).await;
            }
            response.outcome
        }
        .boxed()
    }

    /// The operation as a closure accepted by the orchestrator and executors
    pub fn as_fn(
        &self,
    ) -> impl Fn() -> BoxFuture<'static, ResilienceResult<T>> + Send + Sync + 'static {
        let mock = self.clone();
        move || mock.call()
    }
}

impl<T> Default for MockOperation<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::UpstreamError;

    #[tokio::test]
    async fn test_script_then_default() {
        let mock = MockOperation::new();
        mock.push_ok(1)
            .push_error(UpstreamError::transient("boom"))
            .set_default(MockResponse::ok(9));

        assert_eq!(mock.call().await.unwrap(), 1);
        assert!(mock.call().await.is_err());
        assert_eq!(mock.call().await.unwrap(), 9);
        assert_eq!(mock.call().await.unwrap(), 9);
        assert_eq!(mock.calls(), 4);
    }

    #[tokio::test]
    async fn test_exhausted_script_errors() {
        let mock: MockOperation<u8> = MockOperation::new();
        let op = mock.as_fn();
        assert!(op().await.is_err());
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay() {
        let mock = MockOperation::new();
        mock.push(MockResponse::ok("slow").with_delay(Duration::from_secs(2)));

        let start = tokio::time::Instant::now();
        mock.call().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
