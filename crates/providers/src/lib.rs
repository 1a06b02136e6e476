//! Language-model provider implementations for lorekeep.
//!
//! All providers implement the `lorekeep_core::Provider` trait. Only
//! OpenAI-compatible endpoints are supported; that covers OpenAI,
//! OpenRouter, Ollama, vLLM and most hosted inference services.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;
