// Core record types shared across all pagesync crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const PAGES_TABLE: &str = "pages";
pub const BLOCKS_TABLE: &str = "blocks";

/// Identifier of a persisted record, or of a record that only exists locally.
///
/// Temporary identifiers carry the `temp-` prefix and are never sent back by
/// the persistence service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub const TEMP_PREFIX: &'static str = "temp-";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// A fresh server-style identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// A fresh client-side placeholder identifier.
    pub fn temporary() -> Self {
        Self(format!("{}{}", Self::TEMP_PREFIX, Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(Self::TEMP_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for RecordId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ── Pages ──────────────────────────────────────────────────────────

/// A page in a workspace tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRecord {
    pub id: RecordId,
    pub workspace_id: Uuid,
    #[serde(default)]
    pub parent_id: Option<RecordId>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub archived: bool,
    /// Temporary id the creating client used, echoed back by backends that support it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PageRecord {
    /// A page draft that has not been assigned an id yet.
    pub fn draft(workspace_id: Uuid, parent_id: Option<RecordId>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(""),
            workspace_id,
            parent_id,
            title: title.into(),
            icon: None,
            archived: false,
            client_ref: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update for a page. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagePatch {
    pub title: Option<String>,
    pub parent_id: Option<Option<RecordId>>,
    pub icon: Option<Option<String>>,
    pub archived: Option<bool>,
}

impl PagePatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self { title: Some(title.into()), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.parent_id.is_none()
            && self.icon.is_none()
            && self.archived.is_none()
    }

    /// Fold a newer patch into this one; fields set in `newer` win.
    pub fn merge(&mut self, newer: PagePatch) {
        if newer.title.is_some() {
            self.title = newer.title;
        }
        if newer.parent_id.is_some() {
            self.parent_id = newer.parent_id;
        }
        if newer.icon.is_some() {
            self.icon = newer.icon;
        }
        if newer.archived.is_some() {
            self.archived = newer.archived;
        }
    }

    pub fn apply_to(&self, page: &mut PageRecord) {
        if let Some(title) = &self.title {
            page.title = title.clone();
        }
        if let Some(parent_id) = &self.parent_id {
            page.parent_id = parent_id.clone();
        }
        if let Some(icon) = &self.icon {
            page.icon = icon.clone();
        }
        if let Some(archived) = self.archived {
            page.archived = archived;
        }
    }
}

// ── Blocks ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    #[default]
    Paragraph,
    Heading,
    Todo,
    Quote,
    Code,
    Divider,
}

/// A content block inside a page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockRecord {
    pub id: RecordId,
    pub workspace_id: Uuid,
    pub page_id: RecordId,
    #[serde(default)]
    pub block_type: BlockType,
    #[serde(default)]
    pub content: String,
    /// Sort key among siblings.
    #[serde(default)]
    pub position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockPatch {
    pub block_type: Option<BlockType>,
    pub content: Option<String>,
    pub position: Option<i64>,
}

impl BlockPatch {
    pub fn is_empty(&self) -> bool {
        self.block_type.is_none() && self.content.is_none() && self.position.is_none()
    }

    pub fn merge(&mut self, newer: BlockPatch) {
        if newer.block_type.is_some() {
            self.block_type = newer.block_type;
        }
        if newer.content.is_some() {
            self.content = newer.content;
        }
        if newer.position.is_some() {
            self.position = newer.position;
        }
    }

    pub fn apply_to(&self, block: &mut BlockRecord) {
        if let Some(block_type) = self.block_type {
            block.block_type = block_type;
        }
        if let Some(content) = &self.content {
            block.content = content.clone();
        }
        if let Some(position) = self.position {
            block.position = position;
        }
    }
}

// ── Tagged payload ─────────────────────────────────────────────────

/// A persisted record of any supported kind, as carried by change events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Page(PageRecord),
    Block(BlockRecord),
}

impl Record {
    /// Validate a raw row payload against the schema of `table`.
    pub fn decode(table: &str, value: &Value) -> Result<Self, PayloadError> {
        let malformed =
            |source: serde_json::Error| PayloadError::Malformed { table: table.to_string(), source };
        match table {
            PAGES_TABLE => serde_json::from_value(value.clone()).map(Self::Page).map_err(malformed),
            BLOCKS_TABLE => {
                serde_json::from_value(value.clone()).map(Self::Block).map_err(malformed)
            }
            other => Err(PayloadError::UnknownTable(other.to_string())),
        }
    }

    pub fn to_value(&self) -> Result<Value, PayloadError> {
        let encoded = match self {
            Self::Page(page) => serde_json::to_value(page),
            Self::Block(block) => serde_json::to_value(block),
        };
        encoded.map_err(|source| PayloadError::Malformed { table: self.table().to_string(), source })
    }

    pub fn table(&self) -> &'static str {
        match self {
            Self::Page(_) => PAGES_TABLE,
            Self::Block(_) => BLOCKS_TABLE,
        }
    }

    pub fn id(&self) -> &RecordId {
        match self {
            Self::Page(page) => &page.id,
            Self::Block(block) => &block.id,
        }
    }
}

/// Extract the `id` column from a possibly partial row payload.
///
/// Delete events often carry only the primary key in `old`.
pub fn record_id_of(value: &Value) -> Option<RecordId> {
    value.get("id").and_then(Value::as_str).map(RecordId::from)
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    #[error("malformed `{table}` payload: {source}")]
    Malformed {
        table: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_page() -> PageRecord {
        PageRecord {
            id: RecordId::new("page-1"),
            workspace_id: Uuid::nil(),
            parent_id: Some(RecordId::new("root")),
            title: "Report".to_string(),
            icon: None,
            archived: false,
            client_ref: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn temporary_ids_are_recognised() {
        let temp = RecordId::temporary();
        assert!(temp.is_temporary());
        assert!(temp.as_str().starts_with("temp-"));
        assert!(!RecordId::generate().is_temporary());
    }

    #[test]
    fn decode_accepts_known_tables_and_rejects_unknown() {
        let page = sample_page();
        let value = Record::Page(page.clone()).to_value().expect("page should encode");

        let decoded = Record::decode(PAGES_TABLE, &value).expect("page payload should decode");
        assert_eq!(decoded, Record::Page(page));

        let err = Record::decode("comments", &value).expect_err("unknown table should fail");
        assert!(matches!(err, PayloadError::UnknownTable(table) if table == "comments"));
    }

    #[test]
    fn decode_rejects_payload_missing_required_columns() {
        let err = Record::decode(BLOCKS_TABLE, &json!({ "id": "b-1" }))
            .expect_err("partial block should be rejected");
        assert!(matches!(err, PayloadError::Malformed { .. }));
    }

    #[test]
    fn record_id_of_reads_partial_payloads() {
        assert_eq!(record_id_of(&json!({ "id": "p-9" })), Some(RecordId::new("p-9")));
        assert_eq!(record_id_of(&json!({ "title": "x" })), None);
    }

    #[test]
    fn page_patch_merge_keeps_older_fields_unless_overridden() {
        let mut patch = PagePatch { icon: Some(Some("📄".into())), ..PagePatch::title("Draft") };
        patch.merge(PagePatch::title("Final"));

        let mut page = sample_page();
        patch.apply_to(&mut page);
        assert_eq!(page.title, "Final");
        assert_eq!(page.icon.as_deref(), Some("📄"));
    }

    #[test]
    fn block_patch_applies_only_set_fields() {
        let mut block = BlockRecord {
            id: RecordId::new("b-1"),
            workspace_id: Uuid::nil(),
            page_id: RecordId::new("page-1"),
            block_type: BlockType::Paragraph,
            content: "hello".into(),
            position: 3,
            client_ref: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let patch = BlockPatch { block_type: Some(BlockType::Todo), ..BlockPatch::default() };
        assert!(!patch.is_empty());
        patch.apply_to(&mut block);
        assert_eq!(block.block_type, BlockType::Todo);
        assert_eq!(block.content, "hello");
        assert_eq!(block.position, 3);
    }
}
