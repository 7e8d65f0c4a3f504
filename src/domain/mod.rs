//! Domain model of the payment reconciliation pipeline.
//!
//! Entities and value objects live here together with the `ports` the
//! application layer talks to. Nothing in this module performs I/O.

pub mod batch;
pub mod invoice;
pub mod matching;
pub mod money;
pub mod payment;
pub mod ports;
pub mod registration;
pub mod review;
