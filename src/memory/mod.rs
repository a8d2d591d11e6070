//! Immutable working memory and the transform engine that advances it.

mod transform;
mod working;

pub use transform::{
    value_text, Command, CommandBuilder, PostProcess, SpecBuilder, SpecSource, StreamHook,
    StreamingTransform, TransformOptions, TransformationSpec,
};
pub use working::{ProcessorSpec, WorkingMemory, WorkingMemorySnapshot, DEFAULT_REGION};
