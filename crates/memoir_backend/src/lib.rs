//! Text-generation backend adapters. The engine talks to these only
//! through the `TextBackend` trait; any vendor is swappable.

pub mod anthropic;
pub mod prompt;
pub mod retry;

pub use anthropic::AnthropicBackend;
pub use retry::{RetryConfig, RetryError};
