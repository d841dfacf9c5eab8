//! Source locations and scan policy.
//!
//! A source location is a folder the agent watches. Both variants share a
//! validated field set; the network variant adds credential and connection
//! state that the connection engine maintains.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceLocationError;
use crate::model::Priority;

/// Per-priority scan thresholds, in hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanFrequencies {
    pub high_priority_scan_frequency_in_hours: u32,
    pub med_priority_scan_frequency_in_hours: u32,
    pub low_priority_scan_frequency_in_hours: u32,
}

impl Default for ScanFrequencies {
    fn default() -> Self {
        ScanFrequencies {
            high_priority_scan_frequency_in_hours: 1,
            med_priority_scan_frequency_in_hours: 12,
            low_priority_scan_frequency_in_hours: 48,
        }
    }
}

impl ScanFrequencies {
    /// Threshold for one priority tier.
    pub fn threshold(&self, priority: Priority) -> Duration {
        let hours = match priority {
            Priority::High => self.high_priority_scan_frequency_in_hours,
            Priority::Medium => self.med_priority_scan_frequency_in_hours,
            Priority::Low => self.low_priority_scan_frequency_in_hours,
        };
        Duration::hours(i64::from(hours))
    }
}

/// Connection state tracked for network sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    /// Name of the stored credential used to mount the share
    pub credential_name: String,
    pub is_connected: bool,
    /// Set by the connection engine when the share is unreachable
    pub is_failed: bool,
    pub last_connection_check: Option<DateTime<Utc>>,
}

/// Variant tag for a source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Local,
    Network(NetworkState),
}

/// A configured folder the agent backs up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Unique across local and network sources
    pub id: i64,
    pub path: String,
    /// Empty or `*` for all files, otherwise a wildcard pattern
    pub file_match_filter: String,
    pub priority: Priority,
    /// Number of content revisions retained before older ones are discarded
    pub revision_count: i32,
    pub last_completed_scan: Option<DateTime<Utc>>,
    pub kind: SourceKind,
}

impl SourceLocation {
    pub fn local(
        id: i64,
        path: impl Into<String>,
        file_match_filter: impl Into<String>,
        priority: Priority,
        revision_count: i32,
    ) -> Self {
        SourceLocation {
            id,
            path: path.into(),
            file_match_filter: file_match_filter.into(),
            priority,
            revision_count,
            last_completed_scan: None,
            kind: SourceKind::Local,
        }
    }

    pub fn network(
        id: i64,
        path: impl Into<String>,
        file_match_filter: impl Into<String>,
        priority: Priority,
        revision_count: i32,
        credential_name: impl Into<String>,
    ) -> Self {
        SourceLocation {
            kind: SourceKind::Network(NetworkState {
                credential_name: credential_name.into(),
                ..Default::default()
            }),
            ..SourceLocation::local(id, path, file_match_filter, priority, revision_count)
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self.kind, SourceKind::Network(_))
    }

    pub fn network_state(&self) -> Option<&NetworkState> {
        match &self.kind {
            SourceKind::Network(state) => Some(state),
            SourceKind::Local => None,
        }
    }

    pub fn network_state_mut(&mut self) -> Option<&mut NetworkState> {
        match &mut self.kind {
            SourceKind::Network(state) => Some(state),
            SourceKind::Local => None,
        }
    }

    /// True for network sources the connection engine has flagged as unreachable.
    pub fn is_unreachable(&self) -> bool {
        self.network_state().map(|s| s.is_failed).unwrap_or(false)
    }

    /// Validate the location's parameters.
    ///
    /// Checks run in priority order: folder path, file match filter,
    /// revision count, id. Only local sources check that the folder exists.
    pub fn validate(&self) -> Result<(), SourceLocationError> {
        let path_missing = match self.kind {
            SourceKind::Local => !Path::new(&self.path).is_dir(),
            SourceKind::Network(_) => false,
        };
        if self.path.trim().is_empty() || path_missing {
            return Err(SourceLocationError::InvalidFolderPath {
                path: self.path.clone(),
            });
        }

        FileMatcher::new(&self.file_match_filter)?;

        if self.revision_count <= 0 {
            return Err(SourceLocationError::InvalidRevisionCount {
                count: self.revision_count,
            });
        }

        if self.id <= 0 {
            return Err(SourceLocationError::InvalidId { id: self.id });
        }

        Ok(())
    }

    /// Matcher for this location's file filter.
    pub fn file_matcher(&self) -> Result<FileMatcher, SourceLocationError> {
        FileMatcher::new(&self.file_match_filter)
    }

    /// Whether a scan is due now. See `should_scan_at`.
    pub fn should_scan(&self, policy: Option<&ScanFrequencies>) -> Result<bool, SourceLocationError> {
        self.should_scan_at(policy, Utc::now())
    }

    /// Whether a scan is due at `now`.
    ///
    /// Due when the location was never scanned, or when the time since the
    /// last completed scan strictly exceeds the threshold for its priority.
    pub fn should_scan_at(
        &self,
        policy: Option<&ScanFrequencies>,
        now: DateTime<Utc>,
    ) -> Result<bool, SourceLocationError> {
        let policy = policy.ok_or(SourceLocationError::MissingScanPolicy)?;

        match self.last_completed_scan {
            None => Ok(true),
            Some(last) => Ok(now - last > policy.threshold(self.priority)),
        }
    }
}

/// Compiled file match filter.
#[derive(Debug, Clone)]
pub enum FileMatcher {
    All,
    Pattern(glob::Pattern),
}

impl FileMatcher {
    /// Compile a filter. Empty and `*` match everything; anything else must
    /// contain `*` or `?` and be a valid glob.
    pub fn new(filter: &str) -> Result<Self, SourceLocationError> {
        let filter = filter.trim();
        if filter.is_empty() || filter == "*" {
            return Ok(FileMatcher::All);
        }

        let invalid = || SourceLocationError::InvalidFileMatchFilter {
            filter: filter.to_string(),
        };

        if !filter.contains(['*', '?']) {
            return Err(invalid());
        }

        glob::Pattern::new(filter)
            .map(FileMatcher::Pattern)
            .map_err(|_| invalid())
    }

    pub fn matches(&self, file_name: &str) -> bool {
        match self {
            FileMatcher::All => true,
            FileMatcher::Pattern(pattern) => pattern.matches(file_name),
        }
    }
}

/// The full, mixed collection of local and network source locations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocations(Vec<SourceLocation>);

impl SourceLocations {
    pub fn new(locations: Vec<SourceLocation>) -> Self {
        SourceLocations(locations)
    }

    /// Validate the collection: ids must be unique, then every member must be valid.
    pub fn validate(&self) -> Result<(), SourceLocationError> {
        self.check_unique_ids()?;
        self.0.iter().try_for_each(SourceLocation::validate)
    }

    pub fn check_unique_ids(&self) -> Result<(), SourceLocationError> {
        let mut seen = HashSet::new();
        for location in &self.0 {
            if !seen.insert(location.id) {
                return Err(SourceLocationError::DuplicateId { id: location.id });
            }
        }
        Ok(())
    }

    pub fn get(&self, id: i64) -> Option<&SourceLocation> {
        self.0.iter().find(|l| l.id == id)
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut SourceLocation> {
        self.0.iter_mut().find(|l| l.id == id)
    }

    /// Insert a location, replacing any existing one with the same id.
    pub fn upsert(&mut self, location: SourceLocation) {
        match self.get_mut(location.id) {
            Some(existing) => *existing = location,
            None => self.0.push(location),
        }
    }

    pub fn remove(&mut self, id: i64) -> Option<SourceLocation> {
        let index = self.0.iter().position(|l| l.id == id)?;
        Some(self.0.remove(index))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SourceLocation> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for SourceLocations {
    type Item = SourceLocation;
    type IntoIter = std::vec::IntoIter<SourceLocation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a SourceLocations {
    type Item = &'a SourceLocation;
    type IntoIter = std::slice::Iter<'a, SourceLocation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn existing_dir() -> String {
        std::env::temp_dir().to_string_lossy().into_owned()
    }

    fn valid_local(id: i64) -> SourceLocation {
        SourceLocation::local(id, existing_dir(), "", Priority::Medium, 1)
    }

    #[test]
    fn test_validate_rejects_empty_path() {
        let loc = SourceLocation::local(1, "", "", Priority::Low, 1);
        assert!(matches!(
            loc.validate(),
            Err(SourceLocationError::InvalidFolderPath { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_missing_local_folder() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let missing = temp_dir.path().join("somefolderthatdoesntexist");
        let loc = SourceLocation::local(1, missing.to_string_lossy(), "", Priority::Low, 1);
        assert!(matches!(
            loc.validate(),
            Err(SourceLocationError::InvalidFolderPath { .. })
        ));
    }

    #[test]
    fn test_validate_network_only_requires_non_empty_path() {
        let loc = SourceLocation::network(4, "\\\\nas\\music", "", Priority::Low, 1, "nas-cred");
        assert_eq!(loc.validate(), Ok(()));

        let loc = SourceLocation::network(4, "  ", "", Priority::Low, 1, "nas-cred");
        assert!(matches!(
            loc.validate(),
            Err(SourceLocationError::InvalidFolderPath { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_filters_without_wildcards() {
        for filter in ["aaaa", "test.mp3"] {
            let mut loc = valid_local(1);
            loc.file_match_filter = filter.to_string();
            assert_eq!(
                loc.validate(),
                Err(SourceLocationError::InvalidFileMatchFilter {
                    filter: filter.to_string()
                })
            );
        }
    }

    #[test]
    fn test_validate_accepts_wildcard_filters() {
        for filter in ["", "*", "*.mp3", "test?.doc", "*.*"] {
            let mut loc = valid_local(1);
            loc.file_match_filter = filter.to_string();
            assert_eq!(loc.validate(), Ok(()), "filter '{}' should be valid", filter);
        }
    }

    #[test]
    fn test_validate_rejects_non_positive_revision_count() {
        for count in [0, -15] {
            let mut loc = valid_local(1);
            loc.revision_count = count;
            assert_eq!(
                loc.validate(),
                Err(SourceLocationError::InvalidRevisionCount { count })
            );
        }
    }

    #[test]
    fn test_validate_rejects_non_positive_id() {
        for id in [0, -10] {
            let loc = valid_local(id);
            assert_eq!(loc.validate(), Err(SourceLocationError::InvalidId { id }));
        }
    }

    #[test]
    fn test_validate_reports_path_before_other_problems() {
        let loc = SourceLocation::local(0, "", "test.mp3", Priority::High, 0);
        assert!(matches!(
            loc.validate(),
            Err(SourceLocationError::InvalidFolderPath { .. })
        ));
    }

    #[test]
    fn test_validate_passes_valid_examples() {
        for count in [1, 10, 12345678] {
            let mut loc = valid_local(1);
            loc.revision_count = count;
            assert_eq!(loc.validate(), Ok(()));
        }
    }

    #[test]
    fn test_should_scan_requires_policy() {
        let loc = valid_local(1);
        assert_eq!(
            loc.should_scan(None),
            Err(SourceLocationError::MissingScanPolicy)
        );
    }

    #[test]
    fn test_should_scan_when_never_scanned() {
        let policy = ScanFrequencies::default();
        for priority in [Priority::High, Priority::Medium, Priority::Low] {
            let mut loc = valid_local(1);
            loc.priority = priority;
            assert_eq!(loc.should_scan(Some(&policy)), Ok(true));
        }
    }

    #[test]
    fn test_should_scan_threshold_is_exclusive() {
        let policy = ScanFrequencies {
            high_priority_scan_frequency_in_hours: 1,
            med_priority_scan_frequency_in_hours: 2,
            low_priority_scan_frequency_in_hours: 3,
        };
        let now = Utc::now();
        let mut loc = valid_local(1);
        loc.priority = Priority::High;

        loc.last_completed_scan = Some(now - Duration::minutes(59));
        assert_eq!(loc.should_scan_at(Some(&policy), now), Ok(false));

        loc.last_completed_scan = Some(now - Duration::minutes(60));
        assert_eq!(loc.should_scan_at(Some(&policy), now), Ok(false));

        loc.last_completed_scan = Some(now - Duration::minutes(61));
        assert_eq!(loc.should_scan_at(Some(&policy), now), Ok(true));
    }

    #[test]
    fn test_should_scan_uses_priority_threshold() {
        let policy = ScanFrequencies {
            high_priority_scan_frequency_in_hours: 1,
            med_priority_scan_frequency_in_hours: 2,
            low_priority_scan_frequency_in_hours: 3,
        };
        let now = Utc::now();
        let mut loc = valid_local(1);
        loc.last_completed_scan = Some(now - Duration::minutes(150));

        loc.priority = Priority::Medium;
        assert_eq!(loc.should_scan_at(Some(&policy), now), Ok(true));

        loc.priority = Priority::Low;
        assert_eq!(loc.should_scan_at(Some(&policy), now), Ok(false));
    }

    #[test]
    fn test_collection_rejects_duplicate_ids_across_variants() {
        let mut invalid_member = valid_local(3);
        invalid_member.revision_count = 0;

        let locations = SourceLocations::new(vec![
            valid_local(1),
            SourceLocation::network(1, "\\\\nas\\docs", "", Priority::Low, 1, "cred"),
            invalid_member,
        ]);

        assert_eq!(
            locations.validate(),
            Err(SourceLocationError::DuplicateId { id: 1 })
        );
    }

    #[test]
    fn test_collection_validates_each_member() {
        let mut invalid_member = valid_local(3);
        invalid_member.revision_count = 0;

        let locations = SourceLocations::new(vec![valid_local(1), valid_local(2), invalid_member]);
        assert_eq!(
            locations.validate(),
            Err(SourceLocationError::InvalidRevisionCount { count: 0 })
        );
    }

    #[test]
    fn test_collection_upsert_and_remove() {
        let mut locations = SourceLocations::default();
        locations.upsert(valid_local(1));
        let mut replacement = valid_local(1);
        replacement.priority = Priority::High;
        locations.upsert(replacement);

        assert_eq!(locations.len(), 1);
        assert_eq!(locations.get(1).map(|l| l.priority), Some(Priority::High));
        assert!(locations.remove(1).is_some());
        assert!(locations.is_empty());
    }

    #[test]
    fn test_network_unreachable_flag() {
        let mut loc = SourceLocation::network(2, "\\\\nas\\docs", "", Priority::Low, 1, "cred");
        assert!(!loc.is_unreachable());
        if let Some(state) = loc.network_state_mut() {
            state.is_failed = true;
        }
        assert!(loc.is_unreachable());
        assert!(!valid_local(1).is_unreachable());
    }
}
