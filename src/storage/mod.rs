pub mod paused;
pub mod queue;
pub mod remote;
pub mod sink;

// Re-export common types
pub use paused::PausedStore;
pub use remote::RemoteSink;
pub use sink::{LocalSink, ResultSink};
