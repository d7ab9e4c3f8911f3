//! Request context module
//!
//! Per-invocation correlation id, cancellation and deadline handling.

pub mod cancel;
pub mod request;

// Re-export commonly used types
pub use cancel::CancelToken;
pub use request::RequestContext;
