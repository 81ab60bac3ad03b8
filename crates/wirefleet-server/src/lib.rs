//! Wirefleet Server Library
//!
//! This module exposes the server components for testing

pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error_codes;
pub mod handlers;
pub mod jobs;
pub mod locks;
pub mod metrics;
pub mod snapshot;
pub mod state;
pub mod store;
