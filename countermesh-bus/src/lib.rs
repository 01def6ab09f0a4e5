//! # countermesh Message Bus
//!
//! The sole I/O surface of a federation node. Nodes never address each other
//! directly; every interaction is a typed message dropped onto the
//! recipient's named queue and pulled by that node's dispatcher.
//!
//! The crate has three layers:
//!
//! - [`protocol`]: the enumerated wire schema, an [`Envelope`](Message)
//!   carrying one of the seven message kinds as an internally-tagged
//!   [`Payload`]. Dispatch downstream is an exhaustive `match`, so adding a
//!   kind forces every handler site to be revisited.
//! - [`transport`]: the [`QueueTransport`] contract the core consumes, a
//!   reliable point-to-point queue with at-least-once delivery, arbitrary
//!   reordering and duplication, and token-based acknowledgement.
//! - [`adapter`]: [`MessageBus`], the retry/broadcast/poll/ack surface the
//!   consensus layer calls. Sends retry transient faults with bounded
//!   exponential backoff; broadcast fans out through a bounded worker pool
//!   so one slow peer cannot stall the rest; undecodable inbound messages
//!   are acknowledged and logged rather than redelivered forever.
//!
//! [`memory`] provides the in-process broker used by the node host, the CLI
//! harness, and the test suite. It honors the same visibility-timeout
//! redelivery contract a real broker would, and adds per-queue fault
//! injection for partition scenarios.

pub mod adapter;
pub mod memory;
pub mod protocol;
pub mod transport;

pub use adapter::{InboundMessage, MessageBus};
pub use memory::InMemoryBroker;
pub use protocol::{Message, Payload, TriggerResponse};
pub use transport::{Delivery, DeliveryToken, QueueTransport, TransportError};
