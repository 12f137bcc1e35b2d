use std::path::PathBuf;

use anyhow::Result;
use release_history_core::{
    aggregate_history, epoch_millis, from_epoch_millis, ApprovalAudit, AuditSource, CommentId,
    CommentRecord, CommentStatus, EngineConfig, HistoryError, HistoryFilter, HistoryItem,
    HistoryQuery, OverrideAudit, ReleaseAudit, ReleaseId, ReleaseMeta, RunAudit, SortOrder,
    SourceKind, UserProfile,
};
use release_history_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Page size applied when the caller does not send `items`.
pub const DEFAULT_PAGE_ITEMS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Raw, still-unparsed history query parameters as they arrive off the wire.
/// Parsing happens here so every caller gets the same validation messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryRequest {
    pub items: Option<usize>,
    pub sort_order: Option<String>,
    pub last_timestamp: Option<i64>,
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedLinks {
    pub next: String,
}

/// One page of the merged feed in wire shape: the items plus the
/// ready-to-follow next-page link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryFeed {
    pub data: Vec<HistoryItem>,
    pub links: FeedLinks,
}

#[derive(Debug, Clone)]
pub struct HistoryApi {
    db_path: PathBuf,
    engine: EngineConfig,
}

impl HistoryApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, engine: EngineConfig::default() }
    }

    /// Override the per-source lookahead overfetch.
    #[must_use]
    pub fn with_lookahead(mut self, lookahead: usize) -> Self {
        self.engine = EngineConfig { lookahead };
        self
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Register one release for aggregation.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn create_release(&self, release: &ReleaseMeta) -> Result<()> {
        self.open_migrated()?.insert_release(release)
    }

    /// Register one user profile for actor resolution.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn register_user(&self, profile: &UserProfile) -> Result<()> {
        self.open_migrated()?.insert_user(profile)
    }

    /// Append one release metadata audit row.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn record_release_audit(&self, audit: &ReleaseAudit) -> Result<()> {
        self.open_migrated()?.record_release_audit(audit)
    }

    /// Append one approval audit row.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn record_approval_audit(&self, audit: &ApprovalAudit) -> Result<()> {
        self.open_migrated()?.record_approval_audit(audit)
    }

    /// Append one run audit row.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn record_run_audit(&self, audit: &RunAudit) -> Result<()> {
        self.open_migrated()?.record_run_audit(audit)
    }

    /// Append one manual color override audit row.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn record_override_audit(&self, audit: &OverrideAudit) -> Result<()> {
        self.open_migrated()?.record_override_audit(audit)
    }

    /// Persist one comment with its replies.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn add_comment(&self, comment: &CommentRecord) -> Result<()> {
        self.open_migrated()?.insert_comment(comment)
    }

    /// Flip one comment's resolution status.
    ///
    /// # Errors
    /// Returns an error when the comment is unknown or persistence fails.
    pub fn set_comment_status(&self, comment_id: CommentId, status: CommentStatus) -> Result<()> {
        self.open_migrated()?.set_comment_status(comment_id, status)
    }

    /// Assemble one page of a release's merged history feed.
    ///
    /// # Errors
    /// Returns [`HistoryError::NotFound`] for an unknown release,
    /// [`HistoryError::Validation`] for unparseable parameters, and
    /// [`HistoryError::Query`] when any audit source fails.
    pub fn release_history(
        &self,
        release_id: ReleaseId,
        request: &HistoryRequest,
    ) -> Result<HistoryFeed, HistoryError> {
        let page_size = request.items.unwrap_or(DEFAULT_PAGE_ITEMS);
        let sort_order = match &request.sort_order {
            Some(raw) => SortOrder::parse(raw).ok_or_else(|| {
                HistoryError::Validation(format!("unknown sortOrder: {raw}; expected ASC or DESC"))
            })?,
            None => SortOrder::Desc,
        };
        let filter = match &request.filter {
            Some(raw) => Some(HistoryFilter::parse(raw).ok_or_else(|| {
                HistoryError::Validation(format!(
                    "unknown filter: {raw}; expected event, resolved, or unresolved"
                ))
            })?),
            None => None,
        };
        let last_timestamp = request.last_timestamp.map(from_epoch_millis).transpose()?;

        let mut store = self.open_migrated().map_err(store_err)?;
        let release = store
            .get_release(release_id)
            .map_err(store_err)?
            .ok_or_else(|| HistoryError::NotFound(format!("release not found: {release_id}")))?;

        let snapshot = store.history_snapshot().map_err(store_err)?;
        let release_source = snapshot.source(SourceKind::Release);
        let approval_source = snapshot.source(SourceKind::Approval);
        let run_source = snapshot.source(SourceKind::Run);
        let override_source = snapshot.source(SourceKind::Override);
        let comment_source =
            snapshot.comment_source(filter.and_then(HistoryFilter::comment_status));
        let sources: [&dyn AuditSource; 5] = [
            &release_source,
            &approval_source,
            &run_source,
            &override_source,
            &comment_source,
        ];

        let page = aggregate_history(
            &release,
            &sources,
            &snapshot,
            &snapshot,
            &HistoryQuery { page_size, sort_order, last_timestamp, filter },
            &self.engine,
            OffsetDateTime::now_utc(),
        )?;

        let next = next_link(release_id, page_size, sort_order, page.next_timestamp, filter);
        Ok(HistoryFeed { data: page.items, links: FeedLinks { next } })
    }
}

fn next_link(
    release_id: ReleaseId,
    items: usize,
    sort_order: SortOrder,
    next_timestamp: OffsetDateTime,
    filter: Option<HistoryFilter>,
) -> String {
    let mut link = format!(
        "/v1/releases/{release_id}/history?items={items}&sortOrder={}&lastTimestamp={}",
        sort_order.as_str(),
        epoch_millis(next_timestamp)
    );
    if let Some(filter) = filter {
        link.push_str("&filter=");
        link.push_str(filter.as_str());
    }
    link
}

fn store_err(err: anyhow::Error) -> HistoryError {
    HistoryError::Query(format!("{err:#}"))
}
