//! Elevation capability
//!
//! Privileged operations take an [`ElevatedContext`] argument instead of
//! probing ambient process state at each call site. The value can only be
//! obtained through a verified uid check, so holding one proves the check
//! happened.

use crate::error::{Result, RtTuneError};
use tracing::debug;

/// Proof of a verified root context
#[derive(Debug, Clone, Copy)]
pub struct ElevatedContext(());

impl ElevatedContext {
    /// Verify the effective uid and mint the capability
    pub fn acquire() -> Result<Self> {
        if nix::unistd::Uid::effective().is_root() {
            debug!("elevated context acquired");
            Ok(Self(()))
        } else {
            Err(RtTuneError::PermissionDenied {
                operation: "acquire elevated context".to_string(),
            })
        }
    }

    /// Unverified capability for tests driving synthetic trees
    #[cfg(test)]
    pub(crate) fn assume_for_tests() -> Self {
        Self(())
    }
}
