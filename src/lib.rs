//! LocalBridge: a small HL7 v2 integration broker that moves messages
//! between filesystem drop-zones and MLLP endpoints, transforming them
//! with a WRAPI mini-DSL along the way.

pub mod channel;
pub mod config;
pub mod error;
pub mod hl7;
pub mod logging;
pub mod manager;
pub mod mllp;
pub mod stats;
pub mod transform;
pub mod wrapi;
