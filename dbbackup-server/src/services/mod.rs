pub mod admission;
pub mod chain;
pub mod context;
pub mod engine;
pub mod mode;
pub mod progress;
pub mod retention;
pub mod scheduler;
pub mod tools;
pub mod worker_pool;
