pub mod collector;
pub mod controller;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types
pub use registry::Registry;
pub use scheduler::Scheduler;
pub use task::{CrawlRequest, Task};
