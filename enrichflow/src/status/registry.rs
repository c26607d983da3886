//! Status registry: named codes and the two transition graphs.
//!
//! The registry is a pure lookup structure built once from configuration.
//! It knows nothing about items or side effects; validation lives in
//! [`super::StateMachine`].

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::StatusCode;
use crate::errors::EngineError;

/// A named status code definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDef {
    /// Unique uppercase name, e.g. `TO_SUMMARIZE`.
    pub name: String,
    /// Numeric code.
    pub code: u16,
}

/// A directed transition edge between two named statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDef {
    /// Source status name.
    pub from: String,
    /// Target status name.
    pub to: String,
    /// True for operator-initiated override edges.
    #[serde(default)]
    pub manual: bool,
}

/// Maps a working status back to the ready status it retries from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDef {
    /// Working status name, e.g. `SUMMARIZING`.
    pub working: String,
    /// Ready status name, e.g. `TO_SUMMARIZE`.
    pub ready: String,
}

/// Serializable configuration document for the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// All known statuses.
    pub statuses: Vec<StatusDef>,
    /// Normal and manual transition edges.
    pub transitions: Vec<TransitionDef>,
    /// Working-to-ready retry mappings.
    #[serde(default)]
    pub retry: Vec<RetryDef>,
    /// Fallback retry target when a working state has no mapping.
    #[serde(default)]
    pub default_retry: Option<String>,
}

/// Immutable lookup table for status codes and transitions.
///
/// Loaded once at process start and injected into every component that
/// needs it; re-loadable for tests by building a fresh value.
#[derive(Debug)]
pub struct StatusRegistry {
    by_name: DashMap<String, StatusCode>,
    by_code: DashMap<StatusCode, String>,
    normal: HashMap<StatusCode, Vec<StatusCode>>,
    manual: HashMap<StatusCode, Vec<StatusCode>>,
    retry_map: HashMap<StatusCode, StatusCode>,
    default_retry: Option<StatusCode>,
}

impl StatusRegistry {
    /// Builds a registry from a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownStatus`] if a transition or retry
    /// mapping references an undefined status name, and
    /// [`EngineError::Serialization`] for duplicate names or codes.
    pub fn from_config(config: &StatusConfig) -> Result<Self, EngineError> {
        let by_name: DashMap<String, StatusCode> = DashMap::new();
        let by_code: DashMap<StatusCode, String> = DashMap::new();

        for def in &config.statuses {
            let code = StatusCode(def.code);
            if by_name.insert(def.name.clone(), code).is_some() {
                return Err(EngineError::Serialization(format!(
                    "duplicate status name '{}'",
                    def.name
                )));
            }
            if by_code.insert(code, def.name.clone()).is_some() {
                return Err(EngineError::Serialization(format!(
                    "duplicate status code {}",
                    def.code
                )));
            }
        }

        let resolve = |name: &str| -> Result<StatusCode, EngineError> {
            by_name
                .get(name)
                .map(|entry| *entry.value())
                .ok_or_else(|| EngineError::UnknownStatus(name.to_string()))
        };

        let mut normal: HashMap<StatusCode, Vec<StatusCode>> = HashMap::new();
        let mut manual: HashMap<StatusCode, Vec<StatusCode>> = HashMap::new();

        for edge in &config.transitions {
            let from = resolve(&edge.from)?;
            let to = resolve(&edge.to)?;
            let graph = if edge.manual { &mut manual } else { &mut normal };
            graph.entry(from).or_default().push(to);
        }

        let mut retry_map = HashMap::new();
        for def in &config.retry {
            retry_map.insert(resolve(&def.working)?, resolve(&def.ready)?);
        }

        let default_retry = match &config.default_retry {
            Some(name) => Some(resolve(name)?),
            None => None,
        };

        Ok(Self {
            by_name,
            by_code,
            normal,
            manual,
            retry_map,
            default_retry,
        })
    }

    /// Builds the builtin registry shared by tests and embedders that do
    /// not supply their own configuration.
    #[must_use]
    pub fn builtin() -> Arc<Self> {
        #[allow(clippy::expect_used)]
        Arc::new(Self::from_config(&builtin_config()).expect("builtin status config is valid"))
    }

    /// Looks up a code by name.
    #[must_use]
    pub fn code(&self, name: &str) -> Option<StatusCode> {
        self.by_name.get(name).map(|entry| *entry.value())
    }

    /// Looks up a code by name, failing loudly for unknown names.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownStatus`] for names absent from the
    /// loaded configuration.
    pub fn expect_code(&self, name: &str) -> Result<StatusCode, EngineError> {
        self.code(name)
            .ok_or_else(|| EngineError::UnknownStatus(name.to_string()))
    }

    /// Looks up a name by code.
    #[must_use]
    pub fn name(&self, code: StatusCode) -> Option<String> {
        self.by_code.get(&code).map(|entry| entry.value().clone())
    }

    /// Display label for a code: the name, or `UNKNOWN(nnn)` for codes
    /// outside the loaded table.
    #[must_use]
    pub fn label(&self, code: StatusCode) -> String {
        self.name(code)
            .unwrap_or_else(|| format!("UNKNOWN({})", code.0))
    }

    /// Normal-graph adjacency for a status.
    #[must_use]
    pub fn normal_targets(&self, from: StatusCode) -> &[StatusCode] {
        self.normal.get(&from).map_or(&[], Vec::as_slice)
    }

    /// Manual-graph adjacency for a status.
    #[must_use]
    pub fn manual_targets(&self, from: StatusCode) -> &[StatusCode] {
        self.manual.get(&from).map_or(&[], Vec::as_slice)
    }

    /// The ready status a failed working status retries from, if mapped.
    #[must_use]
    pub fn retry_target(&self, working: StatusCode) -> Option<StatusCode> {
        self.retry_map.get(&working).copied()
    }

    /// The configured fallback retry target.
    #[must_use]
    pub fn default_retry(&self) -> Option<StatusCode> {
        self.default_retry
    }

    /// True if the code appears as a working state in the retry map.
    #[must_use]
    pub fn is_working(&self, code: StatusCode) -> bool {
        self.retry_map.contains_key(&code)
    }

    /// True if the status has no outgoing edges in either graph.
    #[must_use]
    pub fn has_no_outgoing(&self, code: StatusCode) -> bool {
        self.normal_targets(code).is_empty() && self.manual_targets(code).is_empty()
    }
}

/// The builtin status table and transition graphs.
///
/// Covers the full content lifecycle: discovery (100s), enrichment
/// (200s), review (300s), published (400s) and terminal (500s) including
/// `DEAD_LETTER`, which is registered like any other status rather than
/// special-cased as a sentinel.
#[must_use]
pub fn builtin_config() -> StatusConfig {
    let statuses = [
        ("DISCOVERED", 100),
        ("TO_FETCH", 110),
        ("FETCHING", 111),
        ("FETCHED", 112),
        ("TO_SCORE", 120),
        ("SCORING", 121),
        ("SCORED", 122),
        ("PENDING_ENRICHMENT", 200),
        ("TO_SUMMARIZE", 210),
        ("SUMMARIZING", 211),
        ("SUMMARIZED", 212),
        ("TO_TAG", 220),
        ("TAGGING", 221),
        ("TAGGED", 222),
        ("TO_THUMBNAIL", 230),
        ("THUMBNAILING", 231),
        ("THUMBNAILED", 232),
        ("ENRICHED", 240),
        ("PENDING_REVIEW", 300),
        ("IN_REVIEW", 310),
        ("EDITING", 320),
        ("APPROVED", 330),
        ("PUBLISHED", 400),
        ("UPDATED", 410),
        ("FAILED", 500),
        ("UNREACHABLE", 510),
        ("DUPLICATE", 520),
        ("IRRELEVANT", 530),
        ("REJECTED", 540),
        ("DEAD_LETTER", 599),
    ];

    let normal = [
        ("DISCOVERED", "TO_FETCH"),
        ("TO_FETCH", "FETCHING"),
        ("FETCHING", "FETCHED"),
        ("FETCHING", "TO_FETCH"),
        ("FETCHING", "FAILED"),
        ("FETCHING", "UNREACHABLE"),
        ("FETCHING", "DEAD_LETTER"),
        ("FETCHED", "TO_SCORE"),
        ("TO_SCORE", "SCORING"),
        ("SCORING", "SCORED"),
        ("SCORING", "TO_SCORE"),
        ("SCORING", "IRRELEVANT"),
        ("SCORING", "FAILED"),
        ("SCORING", "DEAD_LETTER"),
        ("SCORED", "PENDING_ENRICHMENT"),
        ("PENDING_ENRICHMENT", "TO_SUMMARIZE"),
        ("TO_SUMMARIZE", "SUMMARIZING"),
        ("SUMMARIZING", "TO_TAG"),
        ("SUMMARIZING", "TO_SUMMARIZE"),
        ("SUMMARIZING", "PENDING_REVIEW"),
        ("SUMMARIZING", "FAILED"),
        ("SUMMARIZING", "DEAD_LETTER"),
        ("TO_TAG", "TAGGING"),
        ("TAGGING", "TO_THUMBNAIL"),
        ("TAGGING", "TO_TAG"),
        ("TAGGING", "PENDING_REVIEW"),
        ("TAGGING", "FAILED"),
        ("TAGGING", "DEAD_LETTER"),
        ("TO_THUMBNAIL", "THUMBNAILING"),
        ("THUMBNAILING", "ENRICHED"),
        ("THUMBNAILING", "TO_THUMBNAIL"),
        ("THUMBNAILING", "PENDING_REVIEW"),
        ("THUMBNAILING", "FAILED"),
        ("THUMBNAILING", "REJECTED"),
        ("THUMBNAILING", "DEAD_LETTER"),
        ("ENRICHED", "PENDING_REVIEW"),
        ("PENDING_REVIEW", "IN_REVIEW"),
        ("IN_REVIEW", "EDITING"),
        ("IN_REVIEW", "APPROVED"),
        ("IN_REVIEW", "REJECTED"),
        ("EDITING", "IN_REVIEW"),
        ("EDITING", "APPROVED"),
        ("APPROVED", "PUBLISHED"),
        ("PUBLISHED", "UPDATED"),
    ];

    let manual = [
        // Operator re-enrichment from a published item.
        ("PUBLISHED", "TO_SUMMARIZE"),
        ("UPDATED", "TO_SUMMARIZE"),
        // Partial re-enrich from review: re-run a single step.
        ("PENDING_REVIEW", "TO_SUMMARIZE"),
        ("PENDING_REVIEW", "TO_TAG"),
        ("PENDING_REVIEW", "TO_THUMBNAIL"),
        // Operator requeue out of quarantine or failure.
        ("DEAD_LETTER", "TO_FETCH"),
        ("DEAD_LETTER", "TO_SUMMARIZE"),
        ("FAILED", "TO_FETCH"),
        ("FAILED", "TO_SUMMARIZE"),
    ];

    let retry = [
        ("FETCHING", "TO_FETCH"),
        ("SCORING", "TO_SCORE"),
        ("SUMMARIZING", "TO_SUMMARIZE"),
        ("TAGGING", "TO_TAG"),
        ("THUMBNAILING", "TO_THUMBNAIL"),
    ];

    StatusConfig {
        statuses: statuses
            .iter()
            .map(|(name, code)| StatusDef {
                name: (*name).to_string(),
                code: *code,
            })
            .collect(),
        transitions: normal
            .iter()
            .map(|(from, to)| TransitionDef {
                from: (*from).to_string(),
                to: (*to).to_string(),
                manual: false,
            })
            .chain(manual.iter().map(|(from, to)| TransitionDef {
                from: (*from).to_string(),
                to: (*to).to_string(),
                manual: true,
            }))
            .collect(),
        retry: retry
            .iter()
            .map(|(working, ready)| RetryDef {
                working: (*working).to_string(),
                ready: (*ready).to_string(),
            })
            .collect(),
        default_retry: Some("FAILED".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builtin_registry_loads() {
        let registry = StatusRegistry::builtin();
        assert_eq!(registry.code("TO_SUMMARIZE"), Some(StatusCode(210)));
        assert_eq!(registry.name(StatusCode(599)), Some("DEAD_LETTER".to_string()));
    }

    #[test]
    fn test_dead_letter_is_registered_not_sentinel() {
        let registry = StatusRegistry::builtin();
        let dlq = registry.code("DEAD_LETTER").unwrap();
        // Every working state can reach quarantine through the graph.
        for working in ["FETCHING", "SCORING", "SUMMARIZING", "TAGGING", "THUMBNAILING"] {
            let code = registry.code(working).unwrap();
            assert!(
                registry.normal_targets(code).contains(&dlq),
                "{working} should transition to DEAD_LETTER"
            );
        }
        // And operators can requeue out of it.
        assert!(!registry.manual_targets(dlq).is_empty());
    }

    #[test]
    fn test_label_for_unknown_code() {
        let registry = StatusRegistry::builtin();
        assert_eq!(registry.label(StatusCode(987)), "UNKNOWN(987)");
        assert_eq!(registry.label(StatusCode(210)), "TO_SUMMARIZE");
    }

    #[test]
    fn test_working_states_come_from_retry_map() {
        let registry = StatusRegistry::builtin();
        assert!(registry.is_working(StatusCode(211)));
        assert!(registry.is_working(StatusCode(231)));
        assert!(!registry.is_working(StatusCode(210)));
        assert!(!registry.is_working(StatusCode(300)));
    }

    #[test]
    fn test_terminal_states_have_no_outgoing() {
        let registry = StatusRegistry::builtin();
        assert!(registry.has_no_outgoing(StatusCode(530)));
        assert!(registry.has_no_outgoing(StatusCode(520)));
        // DEAD_LETTER has manual recovery edges, so it is not terminal.
        assert!(!registry.has_no_outgoing(StatusCode(599)));
    }

    #[test]
    fn test_unknown_transition_name_rejected() {
        let mut config = builtin_config();
        config.transitions.push(TransitionDef {
            from: "NOT_A_STATUS".to_string(),
            to: "TO_FETCH".to_string(),
            manual: false,
        });
        let err = StatusRegistry::from_config(&config).unwrap_err();
        assert!(matches!(err, EngineError::UnknownStatus(name) if name == "NOT_A_STATUS"));
    }

    #[test]
    fn test_duplicate_status_name_rejected() {
        let mut config = builtin_config();
        config.statuses.push(StatusDef {
            name: "TO_FETCH".to_string(),
            code: 611,
        });
        assert!(StatusRegistry::from_config(&config).is_err());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = builtin_config();
        let json = serde_json::to_string(&config).unwrap();
        let back: StatusConfig = serde_json::from_str(&json).unwrap();
        let registry = StatusRegistry::from_config(&back).unwrap();
        assert_eq!(registry.code("PENDING_REVIEW"), Some(StatusCode(300)));
    }
}
