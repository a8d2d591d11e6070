use std::fmt;
use std::future::Future;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::{EngineConfig, ProcessorOptions};
use crate::error::SoulResult;
use crate::processor::OPENAI_LABEL;
use crate::types::{Memory, Usage};

/// Group name for untagged memories in [`WorkingMemory::order_regions`].
pub const DEFAULT_REGION: &str = "default";

/// Which registered processor a working memory talks to, and with what options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSpec {
    pub label: String,
    #[serde(default)]
    pub options: ProcessorOptions,
}

impl ProcessorSpec {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            options: ProcessorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }
}

impl Default for ProcessorSpec {
    fn default() -> Self {
        Self::new(OPENAI_LABEL)
    }
}

/// Resolves to the settled instance once a transform finishes.
pub(crate) type Completion = Shared<BoxFuture<'static, SoulResult<WorkingMemory>>>;

#[derive(Clone, Default)]
pub(crate) enum PendingState {
    #[default]
    Idle,
    Pending {
        done: Completion,
        /// Flipped to `true` by the settle task itself, so it holds even
        /// when nobody polls `done`.
        settled: watch::Receiver<bool>,
    },
}

/// Immutable conversation state.
///
/// Every operation returns a new instance; the receiver's memories are never
/// altered. Cloning the struct itself yields another handle to the *same*
/// instance (same id, same pending transform), which is cheap because the
/// memory list is shared.
///
/// A handle returned from [`transform_stream`](Self::transform_stream) is
/// pending until the streamed completion settles. Its memories are the
/// pre-transform ones until then; [`finished`](Self::finished) yields the
/// settled instance, and a further `transform` on the handle waits for it.
#[derive(Clone)]
pub struct WorkingMemory {
    pub(crate) id: String,
    pub(crate) entity_name: String,
    pub(crate) memories: Arc<Vec<Memory>>,
    pub(crate) processor: ProcessorSpec,
    pub(crate) usage: Usage,
    pub(crate) last_value: Option<Value>,
    pub(crate) pending: PendingState,
}

impl WorkingMemory {
    pub fn new(entity_name: impl Into<String>, memories: Vec<Memory>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_name: entity_name.into(),
            memories: Arc::new(memories),
            processor: ProcessorSpec::default(),
            usage: Usage::default(),
            last_value: None,
            pending: PendingState::Idle,
        }
    }

    /// Uses the config's default processor and its options.
    pub fn from_config(
        entity_name: impl Into<String>,
        memories: Vec<Memory>,
        config: &EngineConfig,
    ) -> Self {
        let label = config.default_processor.clone();
        let options = config.processor_options(&label);
        Self::new(entity_name, memories)
            .with_processor(ProcessorSpec::new(label).with_options(options))
    }

    pub fn with_processor(&self, processor: ProcessorSpec) -> Self {
        self.derive(move |wm| {
            let mut next = wm.detached(None);
            next.processor = processor.clone();
            next
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn processor(&self) -> &ProcessorSpec {
        &self.processor
    }

    /// Usage accumulated over every transform in this instance's history
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Value returned by the most recent transform, as JSON
    pub fn last_value(&self) -> Option<&Value> {
        self.last_value.as_ref()
    }

    pub fn memories(&self) -> &[Memory] {
        &self.memories
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    /// Memory at `index`; negative indexes count from the end.
    pub fn at(&self, index: isize) -> Option<&Memory> {
        let idx = if index < 0 {
            self.memories.len().checked_sub(index.unsigned_abs())?
        } else {
            index as usize
        };
        self.memories.get(idx)
    }

    pub fn find(&self, predicate: impl Fn(&Memory) -> bool) -> Option<&Memory> {
        self.memories.iter().find(|m| predicate(m))
    }

    /// True while a streamed transform on this handle has not settled.
    pub fn is_pending(&self) -> bool {
        match &self.pending {
            PendingState::Idle => false,
            PendingState::Pending { settled, .. } => {
                // A closed channel means the settle task is gone.
                !*settled.borrow() && settled.has_changed().is_ok()
            }
        }
    }

    /// Waits for this handle's transform to settle.
    ///
    /// Resolves to the instance with the new memory appended, or to the
    /// error that ended the transform. Idle handles resolve to themselves.
    pub async fn finished(&self) -> SoulResult<WorkingMemory> {
        match &self.pending {
            PendingState::Idle => Ok(self.clone()),
            PendingState::Pending { done, .. } => done.clone().await,
        }
    }

    /// A new instance with the same entity and processor, optionally with
    /// different memories.
    ///
    /// Without replacement memories the result follows a pending transform
    /// on this handle. Explicit memories make it independent of one.
    pub fn clone_with(&self, memories: Option<Vec<Memory>>) -> Self {
        match memories {
            Some(memories) => self.detached(Some(memories)),
            None => self.derive(|wm| wm.detached(None)),
        }
    }

    /// Applies `op` to this handle and returns the result.
    ///
    /// On a pending handle the result is pending too: its memories are `op`
    /// over the pre-transform memories for now, and it settles to `op` over
    /// the settled instance, keeping its own id.
    fn derive<F>(&self, op: F) -> Self
    where
        F: Fn(&WorkingMemory) -> WorkingMemory + Send + Sync + 'static,
    {
        let mut next = op(self);
        if let PendingState::Pending { done, settled } = &self.pending {
            let id = next.id.clone();
            let done = done
                .clone()
                .map(move |result| {
                    result.map(|base| {
                        let mut derived = op(&base);
                        derived.id = id;
                        derived
                    })
                })
                .boxed()
                .shared();
            next.pending = PendingState::Pending {
                done,
                settled: settled.clone(),
            };
        }
        next
    }

    /// Fresh id, not pending.
    pub(crate) fn detached(&self, memories: Option<Vec<Memory>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_name: self.entity_name.clone(),
            memories: memories.map(Arc::new).unwrap_or_else(|| self.memories.clone()),
            processor: self.processor.clone(),
            usage: self.usage.clone(),
            last_value: self.last_value.clone(),
            pending: PendingState::Idle,
        }
    }

    /// Appends every memory of `other`.
    pub fn concat(&self, other: &WorkingMemory) -> Self {
        self.with_memories(other.memories.iter().cloned())
    }

    pub fn with_memories(&self, memories: impl IntoIterator<Item = Memory>) -> Self {
        let added: Vec<Memory> = memories.into_iter().collect();
        self.derive(move |wm| {
            let mut next = wm.memories.to_vec();
            next.extend(added.iter().cloned());
            wm.detached(Some(next))
        })
    }

    pub fn with_memory(&self, memory: Memory) -> Self {
        self.with_memories([memory])
    }

    pub fn prepend(&self, memories: impl IntoIterator<Item = Memory>) -> Self {
        let head: Vec<Memory> = memories.into_iter().collect();
        self.derive(move |wm| {
            let mut next = head.clone();
            next.extend(wm.memories.iter().cloned());
            wm.detached(Some(next))
        })
    }

    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(&Memory) -> Memory + Send + Sync + 'static,
    {
        self.derive(move |wm| wm.detached(Some(wm.memories.iter().map(&f).collect())))
    }

    pub fn filter<F>(&self, predicate: F) -> Self
    where
        F: Fn(&Memory) -> bool + Send + Sync + 'static,
    {
        self.derive(move |wm| {
            wm.detached(Some(
                wm.memories.iter().filter(|m| predicate(m)).cloned().collect(),
            ))
        })
    }

    /// Maps every memory concurrently; order is preserved and the first error wins.
    ///
    /// A pending handle is settled first.
    pub async fn async_map<F, Fut>(&self, f: F) -> SoulResult<Self>
    where
        F: Fn(Memory) -> Fut,
        Fut: Future<Output = SoulResult<Memory>>,
    {
        let base = self.finished().await?;
        let mapped = futures::future::try_join_all(base.memories.iter().cloned().map(f)).await?;
        Ok(base.detached(Some(mapped)))
    }

    pub fn slice(&self, range: impl RangeBounds<usize>) -> Self {
        let start = range.start_bound().cloned();
        let end = range.end_bound().cloned();
        self.derive(move |wm| {
            let len = wm.memories.len();
            let start = match start {
                Bound::Included(s) => s,
                Bound::Excluded(s) => s + 1,
                Bound::Unbounded => 0,
            }
            .min(len);
            let end = match end {
                Bound::Included(e) => e + 1,
                Bound::Excluded(e) => e,
                Bound::Unbounded => len,
            }
            .clamp(start, len);
            wm.detached(Some(wm.memories[start..end].to_vec()))
        })
    }

    /// The current memory for `tag`, if any
    pub fn region(&self, tag: &str) -> Option<&Memory> {
        self.memories
            .iter()
            .find(|m| m.region.as_deref() == Some(tag))
    }

    /// Replaces the memory tagged `tag` in place, or appends when absent.
    ///
    /// Extra memories carrying the same tag are dropped so the region keeps
    /// a single current memory.
    pub fn with_region(&self, tag: &str, memory: Memory) -> Self {
        let tag = tag.to_string();
        let memory = memory.with_region(tag.clone());
        self.derive(move |wm| {
            let mut slot = Some(memory.clone());
            let mut next = Vec::with_capacity(wm.memories.len() + 1);
            for existing in wm.memories.iter() {
                if existing.region.as_deref() == Some(tag.as_str()) {
                    if let Some(replacement) = slot.take() {
                        next.push(replacement);
                    }
                } else {
                    next.push(existing.clone());
                }
            }
            if let Some(memory) = slot {
                next.push(memory);
            }
            wm.detached(Some(next))
        })
    }

    pub fn without_region(&self, tag: &str) -> Self {
        let tag = tag.to_string();
        self.filter(move |m| m.region.as_deref() != Some(tag.as_str()))
    }

    /// Regroups memories by region in `tags` order.
    ///
    /// Memories with no region, or one not listed, form the
    /// [`DEFAULT_REGION`] group, which goes where `"default"` appears in
    /// `tags` or last otherwise. Order inside each group is preserved.
    pub fn order_regions(&self, tags: &[&str]) -> Self {
        let owned: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        self.derive(move |wm| {
            let tags: Vec<&str> = owned.iter().map(String::as_str).collect();
            let mut order = tags.clone();
            if !order.contains(&DEFAULT_REGION) {
                order.push(DEFAULT_REGION);
            }

            let mut next = Vec::with_capacity(wm.memories.len());
            for group in order {
                next.extend(
                    wm.memories
                        .iter()
                        .filter(|m| region_group(m, &tags) == group)
                        .cloned(),
                );
            }
            wm.detached(Some(next))
        })
    }

    /// Serializable copy of this instance. API keys are not included.
    pub fn to_snapshot(&self) -> WorkingMemorySnapshot {
        let mut processor = self.processor.clone();
        processor.options.api_key = None;
        WorkingMemorySnapshot {
            id: self.id.clone(),
            entity_name: self.entity_name.clone(),
            memories: self.memories.to_vec(),
            processor,
            usage: self.usage.clone(),
            last_value: self.last_value.clone(),
        }
    }

    pub fn from_snapshot(snapshot: WorkingMemorySnapshot) -> Self {
        Self {
            id: snapshot.id,
            entity_name: snapshot.entity_name,
            memories: Arc::new(snapshot.memories),
            processor: snapshot.processor,
            usage: snapshot.usage,
            last_value: snapshot.last_value,
            pending: PendingState::Idle,
        }
    }
}

fn region_group<'a>(memory: &'a Memory, tags: &[&str]) -> &'a str {
    match memory.region.as_deref() {
        Some(tag) if tags.contains(&tag) => tag,
        _ => DEFAULT_REGION,
    }
}

impl fmt::Debug for WorkingMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkingMemory")
            .field("id", &self.id)
            .field("entity_name", &self.entity_name)
            .field("memories", &self.memories.len())
            .field("processor", &self.processor.label)
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Transcript rendering, one memory per paragraph.
impl fmt::Display for WorkingMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, memory) in self.memories.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            match &memory.name {
                Some(name) => write!(f, "[{}] {}: ", memory.role, name)?,
                None => write!(f, "[{}]: ", memory.role)?,
            }
            writeln!(f, "{}", memory.text_content())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemorySnapshot {
    pub id: String,
    pub entity_name: String,
    pub memories: Vec<Memory>,
    pub processor: ProcessorSpec,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_value: Option<Value>,
}
