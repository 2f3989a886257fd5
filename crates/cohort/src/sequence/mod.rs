mod file;
mod interface;
mod memory;
mod state;

pub use file::*;
pub use interface::*;
pub use memory::*;
pub use state::*;
