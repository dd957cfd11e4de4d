//! Common code shared between `waste_server` and its clients.
pub mod protocol;

/// Error type.
pub type Error = Box<dyn std::error::Error>;
