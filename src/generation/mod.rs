//! Generation: requests, sampling, stop handling, the per-request controller,
//! chat formatting, embeddings and benchmarking.

pub mod bench;
pub mod chat;
pub mod controller;
pub mod embedding;
pub mod grammar;
pub mod request;
pub mod sampler;
pub mod stop;

pub use bench::{BenchParams, BenchResult};
pub use chat::{
    split_reasoning, ChatError, ChatFormat, ChatMessage, ChatRole, ChatTemplates, FormattedChat,
    TemplateSource,
};
pub use controller::{Cancellation, Controller, GenerationFailure};
pub use embedding::{EmbeddingResult, Normalize};
pub use grammar::{CharClassGrammar, Grammar};
pub use request::{
    GenerationRequest, GenerationResult, GenerationState, Mirostat, Prompt, SamplingParams,
    StopReason, StreamChunk, StreamControl, Timings, TokenProb, TokenProbs,
};
pub use sampler::{Sampler, SamplingError};
