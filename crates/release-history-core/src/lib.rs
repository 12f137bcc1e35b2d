use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

/// Default number of extra records fetched per source beyond the page size.
///
/// Post-fetch filtering can discard an arbitrary share of raw audit records;
/// the lookahead is the correctness margin that keeps a page full within one
/// round trip. It is a fixed approximation, not a proof: a source where nearly
/// every record is filtered out can still under-fill a page.
pub const DEFAULT_LOOKAHEAD_AMOUNT: usize = 100;

/// Fixed fallback text when an override's linked comment no longer resolves.
pub const COMMENT_UNAVAILABLE_FALLBACK: &str = "comment not available anymore";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HistoryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("query error: {0}")]
    Query(String),
    #[error("malformed audit record: {0}")]
    MalformedAudit(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ReleaseId(pub Ulid);

impl ReleaseId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ReleaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ReleaseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ApprovalId(pub Ulid);

impl ApprovalId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ApprovalId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ApprovalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OverrideId(pub Ulid);

impl OverrideId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for OverrideId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for OverrideId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CommentId(pub Ulid);

impl CommentId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CommentId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CommentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserId(pub Ulid);

impl UserId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ASC" => Some(Self::Asc),
            "DESC" => Some(Self::Desc),
            _ => None,
        }
    }
}

/// Fetch direction derived from the requested sort order: ascending feeds read
/// forward from the cursor (`After`), descending read backward (`Before`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FetchDirection {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HistoryFilter {
    Event,
    Resolved,
    Unresolved,
}

impl HistoryFilter {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Resolved => "resolved",
            Self::Unresolved => "unresolved",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "event" => Some(Self::Event),
            "resolved" => Some(Self::Resolved),
            "unresolved" => Some(Self::Unresolved),
            _ => None,
        }
    }

    /// The comment status this filter narrows the comment source to, if any.
    #[must_use]
    pub fn comment_status(self) -> Option<CommentStatus> {
        match self {
            Self::Event => None,
            Self::Resolved => Some(CommentStatus::Resolved),
            Self::Unresolved => Some(CommentStatus::Unresolved),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
}

impl ApprovalState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            _ => None,
        }
    }
}

/// `All` requires every approver, `One` any single approval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    One,
    All,
}

impl ApprovalMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::One => "one",
            Self::All => "all",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "one" => Some(Self::One),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunResult {
    Green,
    Yellow,
    Red,
    Failed,
    Error,
}

impl RunResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Green => "GREEN",
            Self::Yellow => "YELLOW",
            Self::Red => "RED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "GREEN" => Some(Self::Green),
            "YELLOW" => Some(Self::Yellow),
            "RED" => Some(Self::Red),
            "FAILED" => Some(Self::Failed),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Green | Self::Yellow | Self::Red)
    }

    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckColor {
    Green,
    Yellow,
    Red,
}

impl CheckColor {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Green => "GREEN",
            Self::Yellow => "YELLOW",
            Self::Red => "RED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "GREEN" => Some(Self::Green),
            "YELLOW" => Some(Self::Yellow),
            "RED" => Some(Self::Red),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommentStatus {
    Unresolved,
    Resolved,
}

impl CommentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::Resolved => "resolved",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unresolved" => Some(Self::Unresolved),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// The five audit trails merged into one feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Release,
    Approval,
    Run,
    Override,
    Comment,
}

impl SourceKind {
    /// Deterministic tie-break priority for events at the same millisecond.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Release => 1,
            Self::Approval => 2,
            Self::Run => 3,
            Self::Override => 4,
            Self::Comment => 5,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Approval => "approval",
            Self::Run => "run",
            Self::Override => "override",
            Self::Comment => "comment",
        }
    }
}

/// Who performed a committed state transition. Legacy audit rows may carry a
/// username without a user id; a row with neither is malformed.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub id: Option<UserId>,
    pub username: String,
}

impl Actor {
    fn require_identity(&self) -> Result<(), HistoryError> {
        if self.id.is_none() && self.username.trim().is_empty() {
            return Err(HistoryError::MalformedAudit(
                "audit record carries no actor id and no actor username".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

impl UserProfile {
    /// Preferred user-facing name, falling back to the username.
    #[must_use]
    pub fn display_name_or_username(&self) -> &str {
        match &self.display_name {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.username,
        }
    }
}

/// Chapter/requirement/check triple addressing one check of a quality gate.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CheckRef {
    pub chapter: String,
    pub requirement: String,
    pub check: String,
}

impl Display for CheckRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.chapter, self.requirement, self.check)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseState {
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub planned_date: OffsetDateTime,
    pub approval_mode: ApprovalMode,
    pub approval_state: ApprovalState,
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseAudit {
    pub release_id: ReleaseId,
    pub action: AuditAction,
    pub original: Option<ReleaseState>,
    pub modified: Option<ReleaseState>,
    pub actor: Actor,
    #[serde(with = "time::serde::rfc3339")]
    pub modification_time: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalSnapshot {
    pub approver: Actor,
    pub state: ApprovalState,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalAudit {
    pub approval_id: ApprovalId,
    pub release_id: ReleaseId,
    pub action: AuditAction,
    pub original: Option<ApprovalSnapshot>,
    pub modified: Option<ApprovalSnapshot>,
    pub actor: Actor,
    #[serde(with = "time::serde::rfc3339")]
    pub modification_time: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    pub run_number: u32,
    pub status: RunStatus,
    pub overall_result: Option<RunResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunAudit {
    pub release_id: ReleaseId,
    pub action: AuditAction,
    pub original: Option<RunState>,
    pub modified: Option<RunState>,
    pub actor: Actor,
    #[serde(with = "time::serde::rfc3339")]
    pub modification_time: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverrideState {
    pub check: CheckRef,
    pub original_color: CheckColor,
    pub manual_color: CheckColor,
    pub comment_id: Option<CommentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverrideAudit {
    pub override_id: OverrideId,
    pub release_id: ReleaseId,
    pub action: AuditAction,
    pub original: Option<OverrideState>,
    pub modified: Option<OverrideState>,
    pub actor: Actor,
    #[serde(with = "time::serde::rfc3339")]
    pub modification_time: OffsetDateTime,
}

/// What a comment points at. Approval-referencing comments are internal to the
/// approval flow and never surface in the generic feed.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommentReference {
    Release,
    Check { chapter: String, requirement: String, check: String },
    Approval,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommentReply {
    pub id: CommentId,
    pub content: String,
    pub created_by: Actor,
    #[serde(with = "time::serde::rfc3339")]
    pub creation_time: OffsetDateTime,
}

/// A first-class comment with replies and reference, used verbatim as the
/// payload of comment-kind history items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommentRecord {
    pub id: CommentId,
    pub release_id: ReleaseId,
    pub content: String,
    pub created_by: Actor,
    #[serde(with = "time::serde::rfc3339")]
    pub creation_time: OffsetDateTime,
    pub status: CommentStatus,
    pub reference: CommentReference,
    #[serde(default)]
    pub replies: Vec<CommentReply>,
}

/// One raw record drawn from any of the five audit trails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", content = "record", rename_all = "snake_case")]
pub enum SourceRecord {
    Release(ReleaseAudit),
    Approval(ApprovalAudit),
    Run(RunAudit),
    Override(OverrideAudit),
    Comment(CommentRecord),
}

impl SourceRecord {
    #[must_use]
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Release(_) => SourceKind::Release,
            Self::Approval(_) => SourceKind::Approval,
            Self::Run(_) => SourceKind::Run,
            Self::Override(_) => SourceKind::Override,
            Self::Comment(_) => SourceKind::Comment,
        }
    }

    #[must_use]
    pub fn modification_time(&self) -> OffsetDateTime {
        match self {
            Self::Release(audit) => audit.modification_time,
            Self::Approval(audit) => audit.modification_time,
            Self::Run(audit) => audit.modification_time,
            Self::Override(audit) => audit.modification_time,
            Self::Comment(comment) => comment.creation_time,
        }
    }

    /// Stable per-source entity key used as the final tie-break component.
    #[must_use]
    pub fn entity_key(&self) -> String {
        match self {
            Self::Release(audit) => audit.release_id.to_string(),
            Self::Approval(audit) => audit.approval_id.to_string(),
            Self::Run(audit) => {
                let run_number =
                    audit.modified.as_ref().or(audit.original.as_ref()).map_or(0, |s| s.run_number);
                format!("{run_number:010}")
            }
            Self::Override(audit) => audit.override_id.to_string(),
            Self::Comment(comment) => comment.id.to_string(),
        }
    }
}

/// Structured payload of an event-kind history item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventData {
    pub actor: Actor,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_color: Option<CheckColor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_color: Option<CheckColor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_number: Option<u32>,
}

impl EventData {
    fn plain(actor: Actor, action: impl Into<String>) -> Self {
        Self {
            actor,
            action: action.into(),
            comment: None,
            check: None,
            previous_color: None,
            new_color: None,
            run_number: None,
        }
    }
}

/// Canonical polymorphic feed entry; the `kind` discriminator survives
/// serialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum HistoryPayload {
    Event(EventData),
    Comment(CommentRecord),
}

impl HistoryPayload {
    #[must_use]
    pub fn is_event(&self) -> bool {
        matches!(self, Self::Event(_))
    }

    #[must_use]
    pub fn is_comment(&self) -> bool {
        matches!(self, Self::Comment(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryItem {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(flatten)]
    pub payload: HistoryPayload,
}

/// Valid run-completion interval for a release; `close_time` absent means
/// unbounded above.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseWindow {
    #[serde(with = "time::serde::rfc3339")]
    pub creation_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub close_time: Option<OffsetDateTime>,
}

impl ReleaseWindow {
    #[must_use]
    pub fn contains(&self, timestamp: OffsetDateTime) -> bool {
        if timestamp < self.creation_time {
            return false;
        }
        match self.close_time {
            Some(close_time) => timestamp <= close_time,
            None => true,
        }
    }
}

/// Release metadata supplied by the caller before aggregation starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseMeta {
    pub id: ReleaseId,
    #[serde(with = "time::serde::rfc3339")]
    pub creation_time: OffsetDateTime,
    pub closed: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub close_time: Option<OffsetDateTime>,
}

impl ReleaseMeta {
    #[must_use]
    pub fn window(&self) -> ReleaseWindow {
        ReleaseWindow { creation_time: self.creation_time, close_time: self.close_time }
    }
}

/// Timestamp cursor with the fetch direction it travels in. Advancing never
/// mutates; it produces a fresh timestamp value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub timestamp: OffsetDateTime,
    pub direction: FetchDirection,
}

impl Cursor {
    /// Resolve the working cursor for one request. An explicit client cursor
    /// wins; the first ascending page starts at the release creation time and
    /// the first descending page at `now`.
    #[must_use]
    pub fn resolve(
        sort_order: SortOrder,
        last_timestamp: Option<OffsetDateTime>,
        release_creation_time: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Self {
        let direction = match sort_order {
            SortOrder::Asc => FetchDirection::After,
            SortOrder::Desc => FetchDirection::Before,
        };
        let timestamp = last_timestamp.unwrap_or(match direction {
            FetchDirection::After => release_creation_time,
            FetchDirection::Before => now,
        });
        Self { timestamp, direction }
    }

    /// Compute the next-page cursor timestamp. The last retained item's
    /// timestamp is nudged by exactly one millisecond toward unreturned
    /// territory, so same-millisecond events are neither replayed nor skipped;
    /// second rollover at 0ms/999ms falls out of plain timestamp arithmetic.
    /// An empty page keeps the original cursor timestamp.
    #[must_use]
    pub fn advance(self, last_item: Option<OffsetDateTime>) -> OffsetDateTime {
        match last_item {
            Some(timestamp) => match self.direction {
                FetchDirection::Before => timestamp - Duration::milliseconds(1),
                FetchDirection::After => timestamp + Duration::milliseconds(1),
            },
            None => self.timestamp,
        }
    }
}

/// Convert to the wire cursor encoding (epoch milliseconds).
#[must_use]
pub fn epoch_millis(timestamp: OffsetDateTime) -> i64 {
    // OffsetDateTime years are bounded, so the millisecond count fits i64.
    i64::try_from(timestamp.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Parse a wire cursor (epoch milliseconds) back into a timestamp.
///
/// # Errors
/// Returns [`HistoryError::Validation`] when the value is out of range.
pub fn from_epoch_millis(millis: i64) -> Result<OffsetDateTime, HistoryError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).map_err(|err| {
        HistoryError::Validation(format!("invalid epoch millisecond timestamp {millis}: {err}"))
    })
}

/// One audit trail viewed through the uniform fan-out contract.
///
/// `list` must return records with modification time strictly beyond
/// `timestamp` in `direction` (`Before` ⇒ `<`, descending; `After` ⇒ `>`,
/// ascending), capped at `amount`, read from the caller's consistent
/// snapshot, with no side effects.
pub trait AuditSource {
    fn kind(&self) -> SourceKind;

    /// # Errors
    /// Returns [`HistoryError::Query`] when the underlying query fails.
    fn list(
        &self,
        release_id: ReleaseId,
        timestamp: OffsetDateTime,
        amount: usize,
        direction: FetchDirection,
    ) -> Result<Vec<SourceRecord>, HistoryError>;
}

/// Identity lookup tolerant of legacy username-only audit rows.
pub trait UserResolver {
    /// # Errors
    /// Returns [`HistoryError::Query`] when the lookup fails; an unknown user
    /// is `Ok(None)`, not an error.
    fn resolve(&self, actor: &Actor) -> Result<Option<UserProfile>, HistoryError>;
}

/// Comment text lookup for override audits that embed a comment id.
pub trait CommentResolver {
    /// # Errors
    /// Returns [`HistoryError::Query`] when the lookup fails; a stale id is
    /// `Ok(None)`, not an error.
    fn comment_text(&self, id: CommentId) -> Result<Option<String>, HistoryError>;
}

/// Transform one release audit into at most one history event.
///
/// Only updates matter, and only tracked diffs: the closed flag flipping to
/// true, name / planned date / approval mode changes, and the approval state
/// flipping between pending and approved. The first tracked diff (in that
/// order) wins; creation and deletion of the release itself never surface.
///
/// # Errors
/// Returns [`HistoryError::MalformedAudit`] when the record has no actor
/// identity at all.
pub fn transform_release_audit(audit: &ReleaseAudit) -> Result<Option<HistoryItem>, HistoryError> {
    if audit.action != AuditAction::Update {
        return Ok(None);
    }
    let (Some(original), Some(modified)) = (&audit.original, &audit.modified) else {
        return Ok(None);
    };

    let action = if !original.closed && modified.closed {
        "closed the release"
    } else if original.name != modified.name {
        "updated the release name"
    } else if original.planned_date != modified.planned_date {
        "updated the planned date"
    } else if original.approval_mode != modified.approval_mode {
        "updated the approval mode"
    } else if original.approval_state == ApprovalState::Pending
        && modified.approval_state == ApprovalState::Approved
    {
        "release approved"
    } else if original.approval_state == ApprovalState::Approved
        && modified.approval_state == ApprovalState::Pending
    {
        "release reset"
    } else {
        return Ok(None);
    };

    audit.actor.require_identity()?;
    Ok(Some(HistoryItem {
        timestamp: audit.modification_time,
        payload: HistoryPayload::Event(EventData::plain(audit.actor.clone(), action)),
    }))
}

/// Transform one approval audit into at most one history event.
///
/// Create and delete surface the approver's display name; updates surface only
/// the pending↔approved transitions, carrying any comment left with the
/// transition.
///
/// # Errors
/// Returns [`HistoryError::MalformedAudit`] for actor-less records and
/// [`HistoryError::Query`] when the user lookup fails.
pub fn transform_approval_audit(
    audit: &ApprovalAudit,
    users: &dyn UserResolver,
) -> Result<Option<HistoryItem>, HistoryError> {
    let event = match audit.action {
        AuditAction::Create => {
            let Some(modified) = &audit.modified else {
                return Ok(None);
            };
            let name = approver_display_name(&modified.approver, users)?;
            EventData::plain(audit.actor.clone(), format!("added {name}"))
        }
        AuditAction::Delete => {
            let Some(original) = &audit.original else {
                return Ok(None);
            };
            let name = approver_display_name(&original.approver, users)?;
            EventData::plain(audit.actor.clone(), format!("removed {name}"))
        }
        AuditAction::Update => {
            let (Some(original), Some(modified)) = (&audit.original, &audit.modified) else {
                return Ok(None);
            };
            let action = match (original.state, modified.state) {
                (ApprovalState::Pending, ApprovalState::Approved) => "approved",
                (ApprovalState::Approved, ApprovalState::Pending) => "reset",
                _ => return Ok(None),
            };
            let mut event = EventData::plain(audit.actor.clone(), action);
            event.comment.clone_from(&modified.comment);
            event
        }
    };

    audit.actor.require_identity()?;
    Ok(Some(HistoryItem {
        timestamp: audit.modification_time,
        payload: HistoryPayload::Event(event),
    }))
}

fn approver_display_name(
    approver: &Actor,
    users: &dyn UserResolver,
) -> Result<String, HistoryError> {
    approver.require_identity()?;
    let profile = users.resolve(approver)?;
    Ok(profile.map_or_else(
        || approver.username.clone(),
        |profile| profile.display_name_or_username().to_string(),
    ))
}

/// Transform one run audit into at most one history event.
///
/// Only transitions into `Completed` are history-worthy, and only when the
/// modification time falls inside the release window; a run outside the
/// window is noise even if it completed.
///
/// # Errors
/// Returns [`HistoryError::MalformedAudit`] for actor-less records.
pub fn transform_run_audit(
    audit: &RunAudit,
    window: &ReleaseWindow,
) -> Result<Option<HistoryItem>, HistoryError> {
    let Some(modified) = &audit.modified else {
        return Ok(None);
    };
    if modified.status != RunStatus::Completed {
        return Ok(None);
    }
    if let Some(original) = &audit.original {
        if original.status == RunStatus::Completed {
            return Ok(None);
        }
    }
    if !window.contains(audit.modification_time) {
        return Ok(None);
    }

    let run_number = modified.run_number;
    let action = match modified.overall_result {
        Some(result) if result.is_success() => {
            format!(
                "run {run_number} succeeded with status {} and automatically resolved its findings",
                result.as_str()
            )
        }
        Some(result) if result.is_failure() => format!("run {run_number} failed"),
        _ => return Ok(None),
    };

    audit.actor.require_identity()?;
    let mut event = EventData::plain(audit.actor.clone(), action);
    event.run_number = Some(run_number);
    Ok(Some(HistoryItem {
        timestamp: audit.modification_time,
        payload: HistoryPayload::Event(event),
    }))
}

/// Transform one override audit into at most one history event.
///
/// Every action surfaces, referencing the check triple and the color change.
/// The attached comment is resolved by id; a stale reference degrades to
/// [`COMMENT_UNAVAILABLE_FALLBACK`] instead of failing the request.
///
/// # Errors
/// Returns [`HistoryError::MalformedAudit`] for actor-less records and
/// [`HistoryError::Query`] when the comment lookup itself fails.
pub fn transform_override_audit(
    audit: &OverrideAudit,
    comments: &dyn CommentResolver,
) -> Result<Option<HistoryItem>, HistoryError> {
    let (action, state, previous_color, new_color) = match audit.action {
        AuditAction::Create => {
            let Some(modified) = &audit.modified else {
                return Ok(None);
            };
            ("added a manual color override", modified, modified.original_color, modified.manual_color)
        }
        AuditAction::Update => {
            let (Some(original), Some(modified)) = (&audit.original, &audit.modified) else {
                return Ok(None);
            };
            ("updated a manual color override", modified, original.manual_color, modified.manual_color)
        }
        AuditAction::Delete => {
            let Some(original) = &audit.original else {
                return Ok(None);
            };
            // Removing the override reverts the check to its automatic color.
            ("removed a manual color override", original, original.manual_color, original.original_color)
        }
    };

    audit.actor.require_identity()?;
    let comment = match state.comment_id {
        Some(comment_id) => Some(
            comments
                .comment_text(comment_id)?
                .unwrap_or_else(|| COMMENT_UNAVAILABLE_FALLBACK.to_string()),
        ),
        None => None,
    };

    let mut event = EventData::plain(audit.actor.clone(), action);
    event.check = Some(state.check.clone());
    event.previous_color = Some(previous_color);
    event.new_color = Some(new_color);
    event.comment = comment;
    Ok(Some(HistoryItem {
        timestamp: audit.modification_time,
        payload: HistoryPayload::Event(event),
    }))
}

/// Transform one comment record into at most one history item. Comments
/// referencing an approval stay internal to the approval flow.
#[must_use]
pub fn transform_comment(comment: &CommentRecord) -> Option<HistoryItem> {
    if matches!(comment.reference, CommentReference::Approval) {
        return None;
    }
    Some(HistoryItem {
        timestamp: comment.creation_time,
        payload: HistoryPayload::Comment(comment.clone()),
    })
}

/// Dispatch one raw source record through its source-specific transformer.
///
/// # Errors
/// Propagates the transformer errors documented on the per-source functions.
pub fn transform_record(
    record: &SourceRecord,
    window: &ReleaseWindow,
    users: &dyn UserResolver,
    comments: &dyn CommentResolver,
) -> Result<Option<HistoryItem>, HistoryError> {
    match record {
        SourceRecord::Release(audit) => transform_release_audit(audit),
        SourceRecord::Approval(audit) => transform_approval_audit(audit, users),
        SourceRecord::Run(audit) => transform_run_audit(audit, window),
        SourceRecord::Override(audit) => transform_override_audit(audit, comments),
        SourceRecord::Comment(comment) => Ok(transform_comment(comment)),
    }
}

/// Tunable aggregation parameters. The lookahead is an explicit engine
/// parameter so deployments can size it against their filter density.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub lookahead: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { lookahead: DEFAULT_LOOKAHEAD_AMOUNT }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub page_size: usize,
    pub sort_order: SortOrder,
    pub last_timestamp: Option<OffsetDateTime>,
    pub filter: Option<HistoryFilter>,
}

/// One page of the merged feed plus the timestamp for the next-page cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    pub items: Vec<HistoryItem>,
    pub next_timestamp: OffsetDateTime,
}

struct Candidate {
    item: HistoryItem,
    source_rank: u8,
    entity_key: String,
}

impl Candidate {
    fn cmp(lhs: &Self, rhs: &Self, sort_order: SortOrder) -> Ordering {
        let by_time = match sort_order {
            SortOrder::Asc => lhs.item.timestamp.cmp(&rhs.item.timestamp),
            SortOrder::Desc => rhs.item.timestamp.cmp(&lhs.item.timestamp),
        };
        by_time
            .then_with(|| lhs.source_rank.cmp(&rhs.source_rank))
            .then_with(|| lhs.entity_key.cmp(&rhs.entity_key))
    }
}

/// Assemble one page of release history from the five audit sources.
///
/// Stages: resolve cursor, fan out `page_size + lookahead` per source,
/// transform, filter by kind, sort by timestamp (ties broken by source
/// priority then entity key), truncate, advance the cursor by one millisecond
/// past the last retained item.
///
/// Any source failure aborts the whole page; a feed silently missing one
/// source would be a correctness violation, not a degraded result.
///
/// # Errors
/// Returns [`HistoryError::Validation`] for a zero page size and propagates
/// source, user-lookup, and transformer errors unchanged.
pub fn aggregate_history(
    release: &ReleaseMeta,
    sources: &[&dyn AuditSource],
    users: &dyn UserResolver,
    comments: &dyn CommentResolver,
    query: &HistoryQuery,
    config: &EngineConfig,
    now: OffsetDateTime,
) -> Result<HistoryPage, HistoryError> {
    if query.page_size == 0 {
        return Err(HistoryError::Validation("page size MUST be >= 1".to_string()));
    }

    let cursor =
        Cursor::resolve(query.sort_order, query.last_timestamp, release.creation_time, now);
    let amount = query.page_size + config.lookahead;
    let window = release.window();

    let mut candidates: Vec<Candidate> = Vec::new();
    for source in sources {
        let records = source.list(release.id, cursor.timestamp, amount, cursor.direction)?;
        for record in &records {
            let Some(item) = transform_record(record, &window, users, comments)? else {
                continue;
            };
            let keep = match query.filter {
                None => true,
                Some(HistoryFilter::Event) => item.payload.is_event(),
                Some(HistoryFilter::Resolved | HistoryFilter::Unresolved) => {
                    item.payload.is_comment()
                }
            };
            if keep {
                candidates.push(Candidate {
                    item,
                    source_rank: record.kind().rank(),
                    entity_key: record.entity_key(),
                });
            }
        }
    }

    candidates.sort_by(|lhs, rhs| Candidate::cmp(lhs, rhs, query.sort_order));
    candidates.truncate(query.page_size);

    let items: Vec<HistoryItem> = candidates.into_iter().map(|candidate| candidate.item).collect();
    let next_timestamp = cursor.advance(items.last().map(|item| item.timestamp));

    Ok(HistoryPage { items, next_timestamp })
}
