pub mod budget;
pub mod decode;
pub mod source;
pub mod worker;

pub use budget::{BudgetClaim, MemoryBudget};
pub use source::{HttpBody, HttpSource, ImageBody, ImageSource, MemoryBody};
pub use worker::ImageWorker;
