#![doc = include_str!("../README.md")]

mod allocator;
mod atomic;
mod clock;
mod completion;
mod error;
mod id;
mod retry;
mod sequence;
mod site;
mod stimulus;
mod submission;

pub use crate::allocator::*;
pub use crate::clock::*;
pub use crate::completion::*;
pub use crate::error::*;
pub use crate::id::*;
pub use crate::retry::*;
pub use crate::sequence::*;
pub use crate::site::*;
pub use crate::stimulus::*;
pub use crate::submission::*;
