//! Status codes, the transition registry, and the state machine.
//!
//! Status codes and their valid transitions are loaded once at process
//! start from an explicit [`StatusConfig`] and threaded through the engine
//! as an [`StatusRegistry`] value. There is no ambient global: every
//! component that validates transitions receives the registry (or a
//! [`StateMachine`] wrapping it) by constructor parameter.

mod machine;
mod registry;

pub use machine::StateMachine;
pub use registry::{
    builtin_config, RetryDef, StatusConfig, StatusDef, StatusRegistry, TransitionDef,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric pipeline status code.
///
/// Codes follow the convention of the builtin table: hundreds group the
/// phase (100s discovery, 200s enrichment, 300s review, 400s published,
/// 500s terminal), the last digit distinguishes ready (0), working (1)
/// and complete (2) states.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct StatusCode(pub u16);

impl StatusCode {
    /// Returns the raw numeric code.
    #[must_use]
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
