// Record kinds the optimistic overlay can track.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use pagesync_common::types::{
    BlockPatch, BlockRecord, PagePatch, PageRecord, Record, RecordId, BLOCKS_TABLE, PAGES_TABLE,
};

use crate::error::MutationError;

/// Fields compared when pairing a pending create with a confirmed record
/// that carries a different id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchKey {
    pub workspace_id: Uuid,
    pub parent_id: Option<RecordId>,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl MatchKey {
    /// Same workspace, parent and title, created within `window` of each other.
    pub fn matches(&self, other: &MatchKey, window: Duration) -> bool {
        if self.workspace_id != other.workspace_id
            || self.parent_id != other.parent_id
            || self.title != other.title
        {
            return false;
        }
        let distance = (self.created_at - other.created_at).num_milliseconds().unsigned_abs();
        u128::from(distance) <= window.as_millis()
    }
}

pub trait Patch: Clone + fmt::Debug + Send + Sync + 'static {
    /// Fold a newer patch in; fields it sets win.
    fn merge(&mut self, newer: Self);

    fn is_empty(&self) -> bool;
}

pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    type Patch: Patch;

    const TABLE: &'static str;

    fn id(&self) -> &RecordId;
    fn set_id(&mut self, id: RecordId);

    fn client_ref(&self) -> Option<&str>;
    fn set_client_ref(&mut self, client_ref: Option<String>);

    /// Set both creation and modification timestamps.
    fn stamp(&mut self, at: DateTime<Utc>);

    fn touch(&mut self, at: DateTime<Utc>);

    fn apply_patch(&mut self, patch: &Self::Patch);

    fn match_key(&self) -> MatchKey;

    /// Local checks run before any optimistic entry or remote call exists.
    fn validate(&self) -> Result<(), MutationError>;

    fn validate_patch(patch: &Self::Patch) -> Result<(), MutationError>;

    fn from_record(record: Record) -> Option<Self>;
    fn into_record(self) -> Record;
}

// ── Pages ──────────────────────────────────────────────────────────

impl Patch for PagePatch {
    fn merge(&mut self, newer: Self) {
        PagePatch::merge(self, newer);
    }

    fn is_empty(&self) -> bool {
        PagePatch::is_empty(self)
    }
}

impl Entity for PageRecord {
    type Patch = PagePatch;

    const TABLE: &'static str = PAGES_TABLE;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = id;
    }

    fn client_ref(&self) -> Option<&str> {
        self.client_ref.as_deref()
    }

    fn set_client_ref(&mut self, client_ref: Option<String>) {
        self.client_ref = client_ref;
    }

    fn stamp(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
        self.updated_at = at;
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn apply_patch(&mut self, patch: &PagePatch) {
        patch.apply_to(self);
    }

    fn match_key(&self) -> MatchKey {
        MatchKey {
            workspace_id: self.workspace_id,
            parent_id: self.parent_id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
        }
    }

    fn validate(&self) -> Result<(), MutationError> {
        if self.title.trim().is_empty() {
            return Err(MutationError::Validation("page title must not be empty".into()));
        }
        if self.parent_id.as_ref() == Some(&self.id) && !self.id.as_str().is_empty() {
            return Err(MutationError::Validation("page cannot be its own parent".into()));
        }
        Ok(())
    }

    fn validate_patch(patch: &PagePatch) -> Result<(), MutationError> {
        if patch.is_empty() {
            return Err(MutationError::Validation("page update changes nothing".into()));
        }
        if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(MutationError::Validation("page title must not be empty".into()));
        }
        Ok(())
    }

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Page(page) => Some(page),
            Record::Block(_) => None,
        }
    }

    fn into_record(self) -> Record {
        Record::Page(self)
    }
}

// ── Blocks ─────────────────────────────────────────────────────────

impl Patch for BlockPatch {
    fn merge(&mut self, newer: Self) {
        BlockPatch::merge(self, newer);
    }

    fn is_empty(&self) -> bool {
        BlockPatch::is_empty(self)
    }
}

impl Entity for BlockRecord {
    type Patch = BlockPatch;

    const TABLE: &'static str = BLOCKS_TABLE;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = id;
    }

    fn client_ref(&self) -> Option<&str> {
        self.client_ref.as_deref()
    }

    fn set_client_ref(&mut self, client_ref: Option<String>) {
        self.client_ref = client_ref;
    }

    fn stamp(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
        self.updated_at = at;
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn apply_patch(&mut self, patch: &BlockPatch) {
        patch.apply_to(self);
    }

    // A block's "title" is its content; its parent is the page.
    fn match_key(&self) -> MatchKey {
        MatchKey {
            workspace_id: self.workspace_id,
            parent_id: Some(self.page_id.clone()),
            title: self.content.clone(),
            created_at: self.created_at,
        }
    }

    fn validate(&self) -> Result<(), MutationError> {
        if self.page_id.as_str().is_empty() {
            return Err(MutationError::Validation("block must belong to a page".into()));
        }
        Ok(())
    }

    fn validate_patch(patch: &BlockPatch) -> Result<(), MutationError> {
        if patch.is_empty() {
            return Err(MutationError::Validation("block update changes nothing".into()));
        }
        Ok(())
    }

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Block(block) => Some(block),
            Record::Page(_) => None,
        }
    }

    fn into_record(self) -> Record {
        Record::Block(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_767_225_600_000 + ms).single().expect("valid timestamp")
    }

    fn key(title: &str, ms: i64) -> MatchKey {
        MatchKey {
            workspace_id: Uuid::nil(),
            parent_id: Some(RecordId::from("P")),
            title: title.to_string(),
            created_at: at(ms),
        }
    }

    #[test]
    fn match_key_respects_window_in_both_directions() {
        let window = Duration::from_secs(5);
        assert!(key("Report", 0).matches(&key("Report", 4_999), window));
        assert!(key("Report", 5_000).matches(&key("Report", 0), window));
        assert!(!key("Report", 0).matches(&key("Report", 5_001), window));
        assert!(!key("Report", 0).matches(&key("Notes", 0), window));
    }

    #[test]
    fn match_key_requires_same_parent() {
        let mut other = key("Report", 0);
        other.parent_id = None;
        assert!(!key("Report", 0).matches(&other, Duration::from_secs(5)));
    }

    #[test]
    fn page_validation_rejects_blank_titles() {
        let page = PageRecord::draft(Uuid::nil(), None, "   ");
        assert!(matches!(page.validate(), Err(MutationError::Validation(_))));
        assert!(PageRecord::validate_patch(&PagePatch::title("")).is_err());
        assert!(PageRecord::validate_patch(&PagePatch::default()).is_err());
        assert!(PageRecord::validate_patch(&PagePatch::title("Ok")).is_ok());
    }

    #[test]
    fn record_conversion_is_kind_checked() {
        let page = PageRecord::draft(Uuid::nil(), None, "Report");
        let record = page.clone().into_record();
        assert_eq!(PageRecord::from_record(record.clone()), Some(page));
        assert_eq!(BlockRecord::from_record(record), None);
    }
}
