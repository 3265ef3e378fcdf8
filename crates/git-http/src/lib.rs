//! Git Smart HTTP protocol plumbing: pkt-line framing, upload-pack
//! negotiation parsing and request fingerprinting.

pub mod errors;
pub mod negotiation;
pub mod pkt;
