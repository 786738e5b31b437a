pub mod auth;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod state;

#[cfg(test)]
mod test_support;
