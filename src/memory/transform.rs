//! The transform engine: one completion turned into the next working memory.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SoulError, SoulResult};
use crate::json;
use crate::processor::{create_processor, ProcessRequest, ProcessResponse};
use crate::stream::TextStream;
use crate::types::{Memory, Usage};

use super::working::{PendingState, ProcessorSpec, WorkingMemory};

pub type CommandBuilder = Arc<dyn Fn(&WorkingMemory) -> Memory + Send + Sync>;

/// The instruction sent after the working memory's own memories.
///
/// Plain text is sent as a system memory. The command is part of the
/// outgoing request only; it is not stored in the resulting working memory.
#[derive(Clone)]
pub enum Command {
    Text(String),
    Builder(CommandBuilder),
}

impl Command {
    pub fn from_fn(f: impl Fn(&WorkingMemory) -> Memory + Send + Sync + 'static) -> Self {
        Command::Builder(Arc::new(f))
    }

    pub fn build(&self, memory: &WorkingMemory) -> Memory {
        match self {
            Command::Text(text) => Memory::system(text.clone()),
            Command::Builder(build) => build(memory),
        }
    }
}

impl From<&str> for Command {
    fn from(text: &str) -> Self {
        Command::Text(text.to_string())
    }
}

impl From<String> for Command {
    fn from(text: String) -> Self {
        Command::Text(text)
    }
}

/// Turns the processor's parsed value into the memory to append and the
/// value handed back to the caller.
pub type PostProcess<T> =
    Arc<dyn Fn(&WorkingMemory, Value) -> SoulResult<(Memory, T)> + Send + Sync>;

/// Rewrites the caller-visible stream; sees the memory being transformed.
pub type StreamHook = Arc<dyn Fn(&WorkingMemory, TextStream) -> TextStream + Send + Sync>;

/// Everything one transform needs.
pub struct TransformationSpec<T> {
    pub command: Command,
    pub schema: Option<Value>,
    pub post_process: PostProcess<T>,
    pub stream_processor: Option<StreamHook>,
    /// Processor to use instead of the working memory's own
    pub processor: Option<ProcessorSpec>,
}

impl<T> Clone for TransformationSpec<T> {
    fn clone(&self) -> Self {
        Self {
            command: self.command.clone(),
            schema: self.schema.clone(),
            post_process: self.post_process.clone(),
            stream_processor: self.stream_processor.clone(),
            processor: self.processor.clone(),
        }
    }
}

impl<T> TransformationSpec<T> {
    pub fn new(
        command: impl Into<Command>,
        post_process: impl Fn(&WorkingMemory, Value) -> SoulResult<(Memory, T)>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            command: command.into(),
            schema: None,
            post_process: Arc::new(post_process),
            stream_processor: None,
            processor: None,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_stream_processor(
        mut self,
        processor: impl Fn(&WorkingMemory, TextStream) -> TextStream + Send + Sync + 'static,
    ) -> Self {
        self.stream_processor = Some(Arc::new(processor));
        self
    }

    pub fn with_processor(mut self, processor: ProcessorSpec) -> Self {
        self.processor = Some(processor);
        self
    }
}

impl TransformationSpec<String> {
    /// Appends the completion as an assistant memory and returns its text.
    pub fn text(command: impl Into<Command>) -> Self {
        Self::new(command, |_, value| {
            let text = value_text(value);
            Ok((Memory::assistant(text.clone()), text))
        })
    }
}

/// A completion value as plain text; JSON strings are unwrapped.
pub fn value_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

/// Builds a spec from the settled working memory and its previous value.
pub type SpecBuilder<T> =
    Arc<dyn Fn(&WorkingMemory, Option<&Value>) -> SoulResult<TransformationSpec<T>> + Send + Sync>;

pub enum SpecSource<T> {
    Ready(TransformationSpec<T>),
    Builder(SpecBuilder<T>),
}

impl<T> SpecSource<T> {
    pub fn builder(
        f: impl Fn(&WorkingMemory, Option<&Value>) -> SoulResult<TransformationSpec<T>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        SpecSource::Builder(Arc::new(f))
    }
}

impl<T> From<TransformationSpec<T>> for SpecSource<T> {
    fn from(spec: TransformationSpec<T>) -> Self {
        SpecSource::Ready(spec)
    }
}

/// Per-call overrides passed through to the processor
#[derive(Debug, Clone, Default)]
pub struct TransformOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub signal: Option<CancellationToken>,
    pub timeout: Option<Duration>,
}

impl TransformOptions {
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

/// Result of [`WorkingMemory::transform_stream`].
pub struct StreamingTransform<T> {
    /// Pending handle; see [`WorkingMemory::finished`].
    pub memory: WorkingMemory,
    pub stream: TextStream,
    pub value: BoxFuture<'static, SoulResult<T>>,
}

impl WorkingMemory {
    /// Runs `spec` and waits for the resulting working memory and value.
    ///
    /// Must be called within a tokio runtime.
    pub async fn transform<T>(
        &self,
        spec: impl Into<SpecSource<T>>,
        opts: TransformOptions,
    ) -> SoulResult<(WorkingMemory, T)>
    where
        T: Serialize + Send + 'static,
    {
        let StreamingTransform { memory, stream, value } = self.transform_stream(spec, opts).await?;
        drop(stream);
        let value = value.await?;
        let memory = memory.finished().await?;
        Ok((memory, value))
    }

    /// Starts `spec` and returns as soon as the request is underway.
    ///
    /// Text arrives on the returned stream while the completion runs; the
    /// value future and the handle's [`finished`](Self::finished) settle
    /// after post-processing. If this handle is itself pending, its
    /// transform is awaited first.
    pub async fn transform_stream<T>(
        &self,
        spec: impl Into<SpecSource<T>>,
        opts: TransformOptions,
    ) -> SoulResult<StreamingTransform<T>>
    where
        T: Serialize + Send + 'static,
    {
        let base = self.settled_base().await;
        let spec = match spec.into() {
            SpecSource::Ready(spec) => spec,
            SpecSource::Builder(build) => build(&base, base.last_value.as_ref())?,
        };
        base.do_transform(spec, opts)
    }

    /// This instance once any in-flight transform has settled. A failed
    /// transform leaves the pre-transform memories in place.
    async fn settled_base(&self) -> WorkingMemory {
        match &self.pending {
            PendingState::Idle => self.clone(),
            PendingState::Pending { done, .. } => match done.clone().await {
                Ok(settled) => settled,
                Err(err) => {
                    debug!(
                        working_memory = %self.id,
                        error = %err,
                        "previous transform failed, continuing from its base"
                    );
                    let mut base = self.clone();
                    base.pending = PendingState::Idle;
                    base
                }
            },
        }
    }

    fn do_transform<T>(
        &self,
        spec: TransformationSpec<T>,
        opts: TransformOptions,
    ) -> SoulResult<StreamingTransform<T>>
    where
        T: Serialize + Send + 'static,
    {
        let target = spec.processor.as_ref().unwrap_or(&self.processor);
        let processor = create_processor(&target.label, &target.options)?;

        let mut outgoing = self.memories.to_vec();
        if let Some(schema) = &spec.schema {
            json::ensure_json_directive(&mut outgoing, schema);
        }
        outgoing.push(spec.command.build(self));

        let next = self.detached(None);
        info!(
            working_memory = %next.id,
            entity = %next.entity_name,
            processor = processor.name(),
            "transform started"
        );

        let request = ProcessRequest {
            memory: outgoing,
            schema: spec.schema.clone(),
            model: opts.model,
            max_tokens: opts.max_tokens,
            temperature: opts.temperature,
            signal: opts.signal,
            timeout: opts.timeout,
        };
        let ProcessResponse {
            parsed, stream, usage, ..
        } = processor.process(request);

        let stream = match &spec.stream_processor {
            Some(processor) => processor(self, stream),
            None => stream,
        };

        let (value_tx, value_rx) = oneshot::channel::<SoulResult<T>>();
        let (settled_tx, settled_rx) = watch::channel(false);
        let post_process = spec.post_process.clone();
        let base = next.clone();
        let settle = tokio::spawn(async move {
            let outcome = async {
                let parsed = parsed.await?;
                let usage = usage.await?;
                let (record, value) = post_process(&base, parsed)?;
                let last_value = match serde_json::to_value(&value) {
                    Ok(json) => Some(json),
                    Err(e) => {
                        debug!(
                            working_memory = %base.id,
                            error = %e,
                            "transform value is not representable as JSON"
                        );
                        None
                    }
                };
                Ok::<_, SoulError>((base.settled(record, &usage, last_value), value))
            }
            .await;
            settled_tx.send_replace(true);

            match outcome {
                Ok((settled, value)) => {
                    info!(
                        working_memory = %settled.id,
                        memories = settled.len(),
                        "transform finished"
                    );
                    let _ = value_tx.send(Ok(value));
                    Ok(settled)
                }
                Err(err) => {
                    if err.is_cancellation() {
                        debug!(working_memory = %base.id, "transform cancelled");
                    } else {
                        warn!(working_memory = %base.id, error = %err, "transform failed");
                    }
                    let _ = value_tx.send(Err(err.clone()));
                    Err(err)
                }
            }
        });

        let done = async move {
            settle
                .await
                .unwrap_or_else(|e| Err(SoulError::Other(format!("transform task failed: {e}"))))
        }
        .boxed()
        .shared();

        let value = async move {
            value_rx
                .await
                .unwrap_or_else(|_| Err(SoulError::Other("transform dropped its value".into())))
        }
        .boxed();

        Ok(StreamingTransform {
            memory: WorkingMemory {
                pending: PendingState::Pending {
                    done,
                    settled: settled_rx,
                },
                ..next
            },
            stream,
            value,
        })
    }

    /// Same instance with `record` appended and the transform's usage folded in.
    fn settled(&self, record: Memory, usage: &Usage, last_value: Option<Value>) -> WorkingMemory {
        let mut memories = self.memories.to_vec();
        memories.push(record);
        WorkingMemory {
            id: self.id.clone(),
            entity_name: self.entity_name.clone(),
            memories: Arc::new(memories),
            processor: self.processor.clone(),
            usage: self.usage.accumulate(usage),
            last_value,
            pending: PendingState::Idle,
        }
    }
}
