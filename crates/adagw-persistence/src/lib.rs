//! ---
//! gw_section: "03-persistence-logging"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Offline priority cache and its backing file."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
#![warn(missing_docs)]

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing the cache file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The cache lock could not be acquired within its budget.
    #[error("cache lock not acquired for {operation}")]
    LockTimeout {
        /// Operation that gave up waiting.
        operation: &'static str,
    },
}

pub mod cache;

pub use cache::{CacheOptions, PriorityCache};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_names_operation() {
        let err = PersistenceError::LockTimeout { operation: "repair" };
        assert_eq!(format!("{err}"), "cache lock not acquired for repair");
    }
}
