//! HTTP surface of the allocator and stores.
//!
//! ## Structure
//!
//! - [`state`]: shared [`AppState`](state::AppState), in-flight tracking and
//!   shutdown.
//! - [`handler`]: route table and request handlers.
//! - [`error`]: service error type and its HTTP mapping.

pub mod error;
pub mod handler;
pub mod state;
