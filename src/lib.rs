pub mod cleanup;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod storage;
pub mod system;
