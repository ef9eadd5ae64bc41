//! Fabric and connection-manager collaborators for the rclink transport.
//!
//! The transport core consumes two seams: [`verbs::Fabric`] for resource
//! allocation, work posting and completion polling, and
//! [`cm::ConnectionManager`] for the out-of-band connection handshake.
//! [`sim::SimFabric`] implements both entirely in-process so the transport
//! can be exercised without InfiniBand or RoCE hardware.

pub mod cm;
pub mod completion;
pub mod error;
pub mod sim;
pub mod types;
pub mod verbs;
