//! Prompting and output parsing for LLM-backed feature extraction.
//!
//! The inference runtime itself (llama.cpp, vLLM, a hosted API) stays behind the
//! [`CompletionBackend`] trait. This crate owns everything on either side of it:
//! the prompt that goes in and the parsing of whatever text comes back.

pub mod extraction;
pub mod prompts;

pub use extraction::*;
pub use prompts::*;
