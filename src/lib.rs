//! # soul-engine
//!
//! Working-memory transformation engine for LLM-backed characters: an
//! immutable conversation state, pluggable chat backends, a fork primitive
//! for observing one completion stream twice, and a schema-validated
//! retry/repair loop.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use soul_engine::cognitive::external_dialog;
//! use soul_engine::memory::{TransformOptions, WorkingMemory};
//! use soul_engine::Memory;
//!
//! # async fn run() -> soul_engine::error::SoulResult<()> {
//! let memory = WorkingMemory::new(
//!     "testy",
//!     vec![Memory::system("You model Testy, a QA robot"), Memory::user("hi!")],
//! );
//!
//! let (memory, said) = external_dialog()
//!     .run(&memory, "Greet the user warmly", TransformOptions::default())
//!     .await?;
//! println!("{said}");
//! println!("{memory}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`types`] | Core types: `Memory`, `Role`, `Content`, `ContentPart`, `Usage` |
//! | [`error`] | Error taxonomy with thiserror: Transport, Cancelled, SchemaValidation, etc. |
//! | [`config`] | Retry policy, per-processor options, TOML + env engine config |
//! | [`roles`] | Role-alternation fixer for backends with message-format limits |
//! | [`json`] | JSON extraction from free text and schema validation |
//! | [`stream`] | Text streams and the backpressure-safe `fork` |
//! | [`processor`] | `Processor` contract, streaming driver with retries, OpenAI and Anthropic backends, registry |
//! | [`memory`] | `WorkingMemory`, regions and the transform engine |
//! | [`cognitive`] | Cognitive-step factory and built-in steps |
//!
//! ## Transforms
//!
//! [`WorkingMemory::transform`](memory::WorkingMemory::transform) resolves a
//! processor from the process-wide registry by label, sends the memories plus
//! a command, and appends whatever the step's post-processor makes of the
//! result. Nothing is modified in place: the receiver keeps its memories and
//! a new instance carries the appended record.
//!
//! In streaming mode the returned handle is *pending*. Text can be read
//! from the stream right away; `finished()` on the handle, or another
//! transform on it, waits for the record to be appended. A failed or
//! cancelled completion still settles the handle, with the error.

pub mod cognitive;
pub mod config;
pub mod error;
pub mod json;
pub mod memory;
pub mod processor;
pub mod roles;
pub mod stream;
pub mod types;

pub use error::{SoulError, SoulResult};
pub use memory::{TransformOptions, TransformationSpec, WorkingMemory};
pub use processor::{register_processor, Processor, ProcessorRegistry};
pub use types::*;
