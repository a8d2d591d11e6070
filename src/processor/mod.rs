pub mod anthropic;
pub mod driver;
pub mod openai;
pub mod registry;
pub mod traits;
pub mod transport;

pub use anthropic::{AnthropicBackend, AnthropicProcessor};
pub use driver::{ChatBackend, Delta, DeltaStream, RequestSettings, StreamingProcessor};
pub use openai::{OpenAiBackend, OpenAiProcessor};
pub use registry::{
    create_processor, global_registry, register_processor, registered_processors,
    ProcessorFactory, ProcessorRegistry, ANTHROPIC_LABEL, OPENAI_LABEL,
};
pub use traits::{deferred, settled, Deferred, ProcessRequest, ProcessResponse, Processor};
pub use transport::{shared_http_transport, ChatRequest, ChatTransport, EventStream, HttpTransport};
