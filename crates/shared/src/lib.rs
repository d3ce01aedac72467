//! Support Desk Shared Types
//!
//! Data model shared between the real-time runtime and its front-ends.

pub mod types;

pub use types::*;
