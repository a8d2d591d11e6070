//! Text streams and the fork primitive used to observe one backend stream twice.

mod fork;

pub use fork::{fork, ForkBuffer};

use std::sync::Arc;

use futures::stream::BoxStream;

use crate::error::SoulResult;

/// Caller-visible stream of text deltas.
pub type TextStream = BoxStream<'static, SoulResult<String>>;

/// Rewrites a text stream before it reaches the caller (e.g. trimming a speaker preamble).
pub type StreamProcessor = Arc<dyn Fn(TextStream) -> TextStream + Send + Sync>;

/// Drains a text stream into one string, stopping at the first error.
pub async fn collect_text(stream: TextStream) -> SoulResult<String> {
    use futures::TryStreamExt;
    stream.try_collect::<String>().await
}
