//! In-process adapters for the ledger, gallery, history, queue and artifact store.
//!
//! They honour the same contracts as the Postgres and filesystem adapters (unique fingerprint,
//! compare-and-set transitions, at-least-once delivery with a visibility timeout) and back the
//! `local` command and the test suites.

mod artifacts;
mod queue;
mod repos;

pub use artifacts::MemoryArtifactStore;
pub use queue::MemoryQueue;
pub use repos::MemoryRepositories;
