//! Inbound event adapters.

pub mod completion;

pub use completion::{CompletionEvent, CompletionHandler, Skip};
