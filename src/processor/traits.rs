use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{SoulError, SoulResult};
use crate::stream::TextStream;
use crate::types::{Memory, Usage};

/// Core processor trait: turns an outgoing memory list into a completion.
///
/// `process` returns immediately; the work runs in the background and its
/// results arrive through the futures and stream of [`ProcessResponse`].
/// Must be called within a tokio runtime.
pub trait Processor: Send + Sync {
    /// Registry label or backend name, used in logs and errors
    fn name(&self) -> &str;

    fn process(&self, request: ProcessRequest) -> ProcessResponse;
}

/// Inputs for one [`Processor::process`] call
#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
    pub memory: Vec<Memory>,
    pub schema: Option<Value>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub signal: Option<CancellationToken>,
    pub timeout: Option<Duration>,
}

impl ProcessRequest {
    pub fn new(memory: Vec<Memory>) -> Self {
        Self {
            memory,
            ..Default::default()
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A result that any number of holders can await.
pub type Deferred<T> = Shared<BoxFuture<'static, SoulResult<T>>>;

/// Creates a [`Deferred`] together with the sender that settles it.
///
/// Dropping the sender without sending settles the deferred with an error.
pub fn deferred<T>() -> (oneshot::Sender<SoulResult<T>>, Deferred<T>)
where
    T: Clone + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel();
    let fut = async move {
        rx.await
            .unwrap_or_else(|_| Err(SoulError::Other("processor dropped its result".into())))
    }
    .boxed()
    .shared();
    (tx, fut)
}

/// A [`Deferred`] that is already settled.
pub fn settled<T>(value: SoulResult<T>) -> Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    futures::future::ready(value).boxed().shared()
}

/// Handles to an in-flight completion.
///
/// `stream` and the internal accounting each observe every text delta once.
/// `parsed` is the schema-validated JSON object when a schema was supplied,
/// otherwise the completion text as a JSON string.
pub struct ProcessResponse {
    pub raw_completion: Deferred<String>,
    pub parsed: Deferred<Value>,
    pub stream: TextStream,
    pub usage: Deferred<Usage>,
}

impl ProcessResponse {
    /// A response that failed before any work started.
    pub fn failed(err: SoulError) -> Self {
        Self {
            raw_completion: settled(Err(err.clone())),
            parsed: settled(Err(err.clone())),
            stream: Box::pin(futures::stream::iter(if err.is_cancellation() {
                None
            } else {
                Some(Err(err.clone()))
            })),
            usage: settled(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    // Trait object safety check
    #[test]
    fn processor_is_object_safe() {
        fn _assert_object_safe(_: &dyn Processor) {}
    }

    #[tokio::test]
    async fn deferred_is_shared_between_holders() {
        let (tx, value) = deferred::<String>();
        let other = value.clone();
        tx.send(Ok("done".into())).unwrap();
        assert_eq!(value.await.unwrap(), "done");
        assert_eq!(other.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn dropped_sender_settles_with_error() {
        let (tx, value) = deferred::<u32>();
        drop(tx);
        assert!(value.await.is_err());
    }

    #[tokio::test]
    async fn failed_response_rejects_everything() {
        let response = ProcessResponse::failed(SoulError::Auth("no key".into()));
        assert!(response.raw_completion.await.is_err());
        assert!(response.parsed.await.is_err());
        assert!(response.usage.await.is_err());
        let items: Vec<_> = response.stream.collect().await;
        assert_eq!(items, vec![Err(SoulError::Auth("no key".into()))]);
    }

    #[tokio::test]
    async fn failed_by_cancellation_ends_stream_silently() {
        let response = ProcessResponse::failed(SoulError::Cancelled);
        assert!(response.stream.collect::<Vec<_>>().await.is_empty());
    }

    #[test]
    fn request_builder() {
        let token = CancellationToken::new();
        let req = ProcessRequest::new(vec![Memory::user("hi")])
            .with_schema(serde_json::json!({"type": "object"}))
            .with_model("gpt-4o-mini")
            .with_signal(token)
            .with_timeout(Duration::from_secs(5));
        assert_eq!(req.memory.len(), 1);
        assert!(req.schema.is_some());
        assert_eq!(req.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(req.timeout, Some(Duration::from_secs(5)));
    }
}
