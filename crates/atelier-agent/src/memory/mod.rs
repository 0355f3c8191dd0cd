//! Conversation memory strategies.
//!
//! `observational` keeps a structured, LLM-generated observation log that
//! replaces observed messages in the prompt; `compact` leaves the prompt
//! alone and relies on the auto-compaction fallback.

pub mod observational;

pub use observational::runner::MemoryRunner;
pub use observational::service::ObservationMemoryService;

/// Strategy name used for persisted memory state rows.
pub const OBSERVATIONAL_STRATEGY: &str = "observational";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMode {
    Observational,
    Compact,
}

impl MemoryMode {
    pub fn from_name(name: &str) -> Self {
        match name {
            "compact" => MemoryMode::Compact,
            _ => MemoryMode::Observational,
        }
    }
}
