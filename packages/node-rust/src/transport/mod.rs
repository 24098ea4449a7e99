//! Stream transport: framed TCP wire protocol, per-destination senders,
//! inbound listener, and in-process loopback delivery.

mod framing;
pub(crate) mod listener;
pub(crate) mod local;
mod sender;

pub(crate) use sender::{FailedDelivery, SenderRegistry};
