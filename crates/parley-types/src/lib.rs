//! Shared domain types and the binary wire protocol spoken between Parley
//! clients and the gateway.

pub mod api;
pub mod codec;
pub mod envelope;
pub mod models;
