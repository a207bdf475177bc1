//! Container usage scraper service
//!
//! Configuration loading and the health/metrics API shared by the binary
//! and its integration tests.

pub mod api;
pub mod config;
