//! EXCHEQUER: marketplace listing valuation engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod cli;
pub mod config;
pub mod currency;
pub mod engine;
pub mod source;
pub mod storage;
pub mod types;
