//! Shared execution driver for streaming chat backends.
//!
//! [`StreamingProcessor`] implements [`Processor`] for any [`ChatBackend`]:
//! the backend only shapes requests and decodes events, while the driver
//! owns role fixing, the JSON directive, the retry loop, forking the delta
//! stream, usage accounting, timeouts and cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ProcessorOptions, RetryConfig};
use crate::error::{SoulError, SoulResult};
use crate::json;
use crate::roles::{fix_roles, RoleFixOptions};
use crate::stream::{fork, ForkBuffer};
use crate::types::{estimate_tokens, Memory, Usage};

use super::traits::{deferred, ProcessRequest, ProcessResponse, Processor};

/// One decoded unit of a backend's native event stream
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Text(String),
    /// Usage reported by the API; either half may arrive in a separate event.
    Usage {
        input_tokens: Option<usize>,
        output_tokens: Option<usize>,
    },
}

pub type DeltaStream = BoxStream<'static, SoulResult<Delta>>;

/// Per-request generation settings after defaults are applied
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSettings {
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Backend-specific half of a processor.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;

    /// Message-format constraints this backend needs
    fn role_fix(&self) -> RoleFixOptions;

    /// Send already role-fixed memories and return the decoded delta stream.
    async fn open(&self, memories: &[Memory], settings: &RequestSettings)
        -> SoulResult<DeltaStream>;
}

/// A [`Processor`] built from a [`ChatBackend`] plus the shared retry policy.
pub struct StreamingProcessor<B> {
    backend: Arc<B>,
    options: ProcessorOptions,
}

impl<B: ChatBackend + 'static> StreamingProcessor<B> {
    pub fn new(backend: B, options: ProcessorOptions) -> Self {
        Self {
            backend: Arc::new(backend),
            options,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }
}

impl<B: ChatBackend + 'static> Processor for StreamingProcessor<B> {
    fn name(&self) -> &str {
        self.backend.name()
    }

    fn process(&self, request: ProcessRequest) -> ProcessResponse {
        let (raw_tx, raw_completion) = deferred::<String>();
        let (parsed_tx, parsed) = deferred::<Value>();
        let (usage_tx, usage) = deferred::<Usage>();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let settings = RequestSettings {
            model: request
                .model
                .clone()
                .or_else(|| self.options.model.clone())
                .unwrap_or_else(|| self.backend.default_model().to_string()),
            max_tokens: request.max_tokens.or(self.options.max_tokens),
            temperature: request.temperature.or(self.options.temperature),
        };

        let run = Run {
            backend: self.backend.clone(),
            role_fix: self.role_fix(),
            retry: self.options.retry.clone(),
            timeout: request.timeout.unwrap_or_else(|| self.options.timeout()),
            cancel: request.signal.clone().unwrap_or_default(),
            settings,
            out_tx,
        };

        tokio::spawn(async move {
            match run.execute(request.memory, request.schema).await {
                Ok(done) => {
                    let _ = raw_tx.send(Ok(done.text));
                    let _ = parsed_tx.send(Ok(done.parsed));
                    let _ = usage_tx.send(Ok(done.usage));
                }
                Err(err) => {
                    if err.is_cancellation() {
                        debug!(processor = run.backend.name(), "process cancelled");
                    } else {
                        let _ = run.out_tx.send(Err(err.clone()));
                    }
                    let _ = raw_tx.send(Err(err.clone()));
                    let _ = parsed_tx.send(Err(err.clone()));
                    let _ = usage_tx.send(Err(err));
                }
            }
        });

        ProcessResponse {
            raw_completion,
            parsed,
            stream: UnboundedReceiverStream::new(out_rx).boxed(),
            usage,
        }
    }
}

impl<B: ChatBackend + 'static> StreamingProcessor<B> {
    /// Backend defaults with per-processor overrides applied
    fn role_fix(&self) -> RoleFixOptions {
        let base = self.backend.role_fix();
        RoleFixOptions {
            single_system_message: self
                .options
                .single_system_message
                .unwrap_or(base.single_system_message),
            forced_role_alternation: self
                .options
                .forced_role_alternation
                .unwrap_or(base.forced_role_alternation),
        }
    }
}

struct Run<B> {
    backend: Arc<B>,
    role_fix: RoleFixOptions,
    retry: RetryConfig,
    timeout: Duration,
    cancel: CancellationToken,
    settings: RequestSettings,
    out_tx: mpsc::UnboundedSender<SoulResult<String>>,
}

struct Completion {
    text: String,
    parsed: Value,
    usage: Usage,
}

struct AttemptOutput {
    text: String,
    usage: Usage,
}

impl<B: ChatBackend + 'static> Run<B> {
    async fn execute(
        &self,
        mut memories: Vec<Memory>,
        schema: Option<Value>,
    ) -> SoulResult<Completion> {
        if let Some(schema) = &schema {
            json::ensure_json_directive(&mut memories, schema);
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut total_usage = Usage::new(self.settings.model.clone(), 0, 0);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                processor = self.backend.name(),
                model = %self.settings.model,
                attempt,
                "sending completion request"
            );

            let err = match self.attempt(&memories).await {
                Ok(output) => {
                    total_usage = total_usage.accumulate(&output.usage);
                    match &schema {
                        None => {
                            return Ok(Completion {
                                parsed: Value::String(output.text.clone()),
                                text: output.text,
                                usage: total_usage,
                            })
                        }
                        Some(schema) => match json::parse_structured(&output.text, schema) {
                            Ok(parsed) => {
                                return Ok(Completion {
                                    text: output.text,
                                    parsed,
                                    usage: total_usage,
                                })
                            }
                            Err(err) => {
                                memories.extend(json::corrective_turns(&output.text, &err));
                                err
                            }
                        },
                    }
                }
                Err(err) if err.is_cancellation() || !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if attempt >= max_attempts {
                warn!(
                    processor = self.backend.name(),
                    attempts = attempt,
                    "giving up: {err}"
                );
                return Err(SoulError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = match &err {
                SoulError::RateLimited { retry_after_ms, .. } => self
                    .retry
                    .delay_for_attempt(attempt)
                    .max(Duration::from_millis(*retry_after_ms)),
                _ => self.retry.delay_for_attempt(attempt),
            };
            warn!(
                processor = self.backend.name(),
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "retrying after: {err}"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SoulError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One backend round trip, bounded by the timeout and the caller's signal.
    async fn attempt(&self, memories: &[Memory]) -> SoulResult<AttemptOutput> {
        let shaped = fix_roles(self.role_fix, memories);
        // Stops the backend stream when this attempt ends for any reason.
        let attempt_token = self.cancel.child_token();
        let _stop_source = attempt_token.clone().drop_guard();

        let call = async {
            let deltas = self.backend.open(&shaped, &self.settings).await?;
            let stop = attempt_token.clone();
            let deltas = deltas.take_until(async move { stop.cancelled().await });

            let mut forks = fork(deltas, 2, ForkBuffer::Unbounded).into_iter();
            let (Some(internal), Some(external)) = (forks.next(), forks.next()) else {
                return Err(SoulError::Other("stream fork yielded too few consumers".into()));
            };

            let (drained, ()) = futures::join!(drain(internal), self.forward(external));
            let (text, reported) = drained?;
            Ok::<_, SoulError>(AttemptOutput {
                usage: self.account(&shaped, &text, reported),
                text,
            })
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SoulError::Cancelled),
            result = tokio::time::timeout(self.timeout, call) => result.unwrap_or_else(|_| {
                Err(SoulError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }),
        }
    }

    /// Relays text deltas to the caller-visible stream; errors stay internal.
    async fn forward(&self, mut external: BoxStream<'static, SoulResult<Delta>>) {
        while let Some(item) = external.next().await {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Ok(Delta::Text(text)) = item {
                if self.out_tx.send(Ok(text)).is_err() {
                    // Caller dropped the stream; keep draining for accounting.
                    continue;
                }
            }
        }
    }

    /// Usage from the API where reported, else estimated from content.
    fn account(&self, shaped: &[Memory], text: &str, reported: ReportedUsage) -> Usage {
        let input = reported
            .input_tokens
            .unwrap_or_else(|| shaped.iter().map(|m| m.estimate_tokens()).sum());
        let output = reported
            .output_tokens
            .unwrap_or_else(|| estimate_tokens(text));
        Usage::new(self.settings.model.clone(), input, output)
    }
}

#[derive(Debug, Default)]
struct ReportedUsage {
    input_tokens: Option<usize>,
    output_tokens: Option<usize>,
}

/// Materializes the completion text and any reported usage.
async fn drain(
    mut internal: BoxStream<'static, SoulResult<Delta>>,
) -> SoulResult<(String, ReportedUsage)> {
    let mut text = String::new();
    let mut usage = ReportedUsage::default();
    while let Some(item) = internal.next().await {
        match item? {
            Delta::Text(chunk) => text.push_str(&chunk),
            Delta::Usage {
                input_tokens,
                output_tokens,
            } => {
                usage.input_tokens = input_tokens.or(usage.input_tokens);
                usage.output_tokens = output_tokens.or(usage.output_tokens);
            }
        }
    }
    Ok((text, usage))
}
