//! Single-node proof-of-work ledger with an HTTP surface.

pub mod api;
pub mod blockchain;
