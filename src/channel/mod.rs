//! Channel configuration, loading, and the three channel engines.

pub mod inbound;
pub mod loader;
pub mod models;
pub mod outbound;
pub mod translate;
