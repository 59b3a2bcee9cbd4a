//! Shared vocabulary for the outward delivery engine: domains, envelope
//! addresses, SMTP statuses, message buffers, and the delivery-target trait
//! implemented by the engine and consumed by the queue.

pub mod address;
pub mod domain;
pub mod logging;
pub mod message;
pub mod status;
pub mod target;

pub use domain::Domain;
pub use status::{EnhancedCode, Status};
