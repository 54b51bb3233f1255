//! This module contains utilities for testing code based on RDM connection management. They are
//!  used for testing connection management itself, but they are also exported for application
//!  testing: [sim_fabric::SimFabric] is an in-memory transport that connects RDM endpoints
//!  without any networking.

pub mod node;
pub mod sim_fabric;
