// Public API for integration tests and potential library usage

pub mod api;
pub mod auth;
pub mod backend;
pub mod dispatch;
pub mod protocol;
pub mod proxy;
pub mod state;
pub mod types;
pub mod ws;

// Re-export broadcast for testing
pub mod broadcast;
