//! Relay ranking and registry (§4.5).
//!
//! Signal-racing, two-sided session setup, and `RELAY_DATA` forwarding are
//! orchestrated by `dig-core`'s relay coordinator; this module only keeps
//! the ranked registry of known relay-capable peers that coordinator reads
//! from.

pub mod selection;

pub use selection::{RelayCandidate, RelayRegistry};
