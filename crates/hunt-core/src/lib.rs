//! Authoritative hunt kernel: deterministic link assignment, the participant
//! storage seam, round state, and the quota-guarded admission controller.
//!
//! Everything in this crate is synchronous and transport-free; the API crate
//! owns the mutex, the wire, and the SQLite adapter.

pub mod admission;
pub mod assignment;
pub mod rounds;
pub mod store;

pub use admission::{AdmissionController, AdmissionError};
pub use store::{MemoryStore, ParticipantStore, StoreError};
