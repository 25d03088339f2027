//! Orbitalis: a decentralized discovery-and-binding runtime over a
//! publish/subscribe event bus.
//!
//! Two participant roles, Core and Plugin, find each other through a
//! four-phase handshake (Discover / Offer / Request / Confirm) carried
//! entirely over an injected [`eventbus::EventBus`]. Compatibility
//! between a Core's declared [`policy::Constraint`] and a Plugin's
//! registered [`operation::Operation`] is decided by [`schema::SchemaSpec`]
//! algebra and [`policy::Policy`] gating; once matched, the pair share a
//! [`connection::Connection`] until either side closes it.

pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod eventbus;
pub mod id;
pub mod messages;
pub mod operation;
pub mod orbiter;
pub mod plugin;
pub mod policy;
pub mod registry;
pub mod schema;

pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use connection::{Connection, PendingRequest};
pub use core::{Core, CoreBuilder};
pub use error::{ConstraintError, OrbiterError, PolicyError, ProtocolError, Result, TransportError};
pub use eventbus::{local::LocalEventBus, EventBus, EventHandler};
pub use operation::{Operation, OperationHandler, OutputSink, Sink};
pub use orbiter::{ConnectionFilter, OrbiterCore};
pub use plugin::{Plugin, PluginBuilder};
pub use policy::{AllowBlockList, Constraint, Need, OperationRequirement, Policy};
pub use schema::{SchemaFingerprint, SchemaSpec};
