pub mod engine;
pub mod runner;
pub mod scheduler;
