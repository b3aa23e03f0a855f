pub mod agent;
pub mod config;
pub mod export;
pub mod pid;
pub mod sink;
pub mod tracer;
