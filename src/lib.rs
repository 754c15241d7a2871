//! An LLM relay gateway: one OpenAI/Anthropic-compatible front door in front of many
//! provider accounts, with weighted routing, failover and per-token quota metering.

pub mod adaptor;
mod error;
pub mod model;
pub mod protocol;
pub mod relay;
pub mod stream;
pub mod types;
pub mod utils;

pub use error::{RelayError, Result};
pub use relay::{Relay, RelayConfig};
pub use stream::OutputFormat;
pub use types::{
    ContentPart, EmbeddingRequest, EmbeddingResponse, FinishReason, GenerateRequest,
    GenerateResponse, Message, Role, StreamChunk, Tool, ToolChoice, Usage,
};
