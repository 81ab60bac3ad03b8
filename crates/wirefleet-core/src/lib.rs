//! Wirefleet Core - data model and pure engine rules for the Wirefleet
//! configuration distribution server

pub mod address;
pub mod crypto;
pub mod error;
pub mod propagate;
pub mod service;
pub mod topology;
pub mod types;
pub mod validate;

pub use error::*;
pub use types::*;
