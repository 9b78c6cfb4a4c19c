//! Delivery of claimed batches to the analytics service
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  encode_batch  ┌─────────┐  Transport::send  ┌───────────┐
//! │  ClaimedBatch  │ ─────────────► │ Payload │ ────────────────► │  service  │
//! └────────────────┘                └─────────┘                   └───────────┘
//!          ▲
//!          │ only when DeliveryGate::should_flush() == Allow
//! ```
//!
//! The engine never talks to the network directly. Hosts can swap the
//! [`HttpTransport`] for their own [`Transport`] and attach a
//! [`DeliveryGate`] to defer delivery, for example while on a metered
//! connection.

mod gate;
pub mod payload;
mod transport;

pub use gate::{DeliveryGate, GateDecision};
pub use payload::{encode_batch, encode_record, EncodedBatch, Payload};
pub use transport::{HttpTransport, Transport};
