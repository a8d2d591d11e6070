//! Cognitive steps: reusable, parameterized transforms over a working memory.
//!
//! A step is a function from an argument to a [`TransformationSpec`];
//! running it applies the spec to a working memory. The built-in steps live
//! in [`steps`].

pub mod steps;
mod strip;

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;

use crate::error::SoulResult;
use crate::memory::{StreamingTransform, TransformOptions, TransformationSpec, WorkingMemory};

pub use steps::{
    brainstorm, decision, external_dialog, internal_monologue, mental_query, DecisionArgs,
};
pub use strip::{strip_entity_and_verb, strip_prefix_stream};

pub type SpecFactory<A, T> = Arc<dyn Fn(A) -> TransformationSpec<T> + Send + Sync>;

pub struct CognitiveStep<A, T> {
    build: SpecFactory<A, T>,
    _arg: PhantomData<fn(A)>,
}

impl<A, T> Clone for CognitiveStep<A, T> {
    fn clone(&self) -> Self {
        Self {
            build: self.build.clone(),
            _arg: PhantomData,
        }
    }
}

pub fn create_cognitive_step<A, T>(
    build: impl Fn(A) -> TransformationSpec<T> + Send + Sync + 'static,
) -> CognitiveStep<A, T> {
    CognitiveStep {
        build: Arc::new(build),
        _arg: PhantomData,
    }
}

impl<A, T> CognitiveStep<A, T>
where
    T: Serialize + Send + 'static,
{
    pub fn spec(&self, arg: impl Into<A>) -> TransformationSpec<T> {
        (self.build)(arg.into())
    }

    /// Applies the step and waits for the new working memory and value.
    pub async fn run(
        &self,
        memory: &WorkingMemory,
        arg: impl Into<A>,
        opts: TransformOptions,
    ) -> SoulResult<(WorkingMemory, T)> {
        let spec = self.spec(arg);
        memory.transform(spec, opts).await
    }

    /// Applies the step in streaming mode.
    pub async fn run_stream(
        &self,
        memory: &WorkingMemory,
        arg: impl Into<A>,
        opts: TransformOptions,
    ) -> SoulResult<StreamingTransform<T>> {
        let spec = self.spec(arg);
        memory.transform_stream(spec, opts).await
    }
}
