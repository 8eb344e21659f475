//! Database module for SQLite persistence of sync state.

mod pool;
mod state;

pub use pool::*;
pub use state::*;
