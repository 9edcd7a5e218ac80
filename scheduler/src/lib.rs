pub mod monitor;
pub mod scheduler;
pub mod sink;
pub mod state;

pub use scheduler::Scheduler;
pub use sink::{Completed, ReorderBuffer};
pub use state::PoolState;
