use std::fmt::Display;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use release_history_core::{
    epoch_millis, from_epoch_millis, Actor, ApprovalAudit, ApprovalId, AuditAction, AuditSource,
    CommentId, CommentRecord, CommentReply, CommentResolver, CommentStatus, FetchDirection,
    HistoryError, OverrideAudit, OverrideId, ReleaseAudit, ReleaseId, ReleaseMeta, RunAudit,
    SourceKind, SourceRecord, UserId, UserProfile, UserResolver,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// All timestamps are stored as epoch milliseconds, matching the wire cursor
// encoding so audit queries compare integers instead of parsing text.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  username TEXT NOT NULL UNIQUE,
  display_name TEXT,
  email TEXT
);

CREATE TABLE IF NOT EXISTS releases (
  release_id TEXT PRIMARY KEY,
  creation_time INTEGER NOT NULL,
  closed INTEGER NOT NULL DEFAULT 0 CHECK (closed IN (0, 1)),
  close_time INTEGER
);

CREATE TABLE IF NOT EXISTS release_audit (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  release_id TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('create','update','delete')),
  original_json TEXT,
  modified_json TEXT,
  actor_id TEXT,
  actor_username TEXT NOT NULL,
  modification_time INTEGER NOT NULL,
  FOREIGN KEY (release_id) REFERENCES releases(release_id)
);

CREATE TABLE IF NOT EXISTS approval_audit (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  approval_id TEXT NOT NULL,
  release_id TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('create','update','delete')),
  original_json TEXT,
  modified_json TEXT,
  actor_id TEXT,
  actor_username TEXT NOT NULL,
  modification_time INTEGER NOT NULL,
  FOREIGN KEY (release_id) REFERENCES releases(release_id)
);

CREATE TABLE IF NOT EXISTS run_audit (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  release_id TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('create','update','delete')),
  original_json TEXT,
  modified_json TEXT,
  actor_id TEXT,
  actor_username TEXT NOT NULL,
  modification_time INTEGER NOT NULL,
  FOREIGN KEY (release_id) REFERENCES releases(release_id)
);

CREATE TABLE IF NOT EXISTS override_audit (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  override_id TEXT NOT NULL,
  release_id TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('create','update','delete')),
  original_json TEXT,
  modified_json TEXT,
  actor_id TEXT,
  actor_username TEXT NOT NULL,
  modification_time INTEGER NOT NULL,
  FOREIGN KEY (release_id) REFERENCES releases(release_id)
);

CREATE TABLE IF NOT EXISTS comments (
  comment_id TEXT PRIMARY KEY,
  release_id TEXT NOT NULL,
  content TEXT NOT NULL,
  created_by_id TEXT,
  created_by_username TEXT NOT NULL,
  creation_time INTEGER NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('unresolved','resolved')),
  reference_json TEXT NOT NULL,
  FOREIGN KEY (release_id) REFERENCES releases(release_id)
);

CREATE TABLE IF NOT EXISTS comment_replies (
  reply_id TEXT PRIMARY KEY,
  comment_id TEXT NOT NULL,
  content TEXT NOT NULL,
  created_by_id TEXT,
  created_by_username TEXT NOT NULL,
  creation_time INTEGER NOT NULL,
  FOREIGN KEY (comment_id) REFERENCES comments(comment_id)
);

CREATE INDEX IF NOT EXISTS idx_release_audit_release_time
  ON release_audit(release_id, modification_time);
CREATE INDEX IF NOT EXISTS idx_approval_audit_release_time
  ON approval_audit(release_id, modification_time);
CREATE INDEX IF NOT EXISTS idx_run_audit_release_time
  ON run_audit(release_id, modification_time);
CREATE INDEX IF NOT EXISTS idx_override_audit_release_time
  ON override_audit(release_id, modification_time);
CREATE INDEX IF NOT EXISTS idx_comments_release_time
  ON comments(release_id, creation_time);
CREATE INDEX IF NOT EXISTS idx_comment_replies_comment
  ON comment_replies(comment_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed audit store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Persist one user profile for actor resolution.
    ///
    /// # Errors
    /// Returns an error when the insert fails, including username collisions.
    pub fn insert_user(&self, profile: &UserProfile) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO users(user_id, username, display_name, email)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    profile.id.to_string(),
                    profile.username,
                    profile.display_name,
                    profile.email,
                ],
            )
            .context("failed to insert user")?;
        Ok(())
    }

    /// Persist one release's aggregation metadata row.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_release(&self, release: &ReleaseMeta) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO releases(release_id, creation_time, closed, close_time)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    release.id.to_string(),
                    epoch_millis(release.creation_time),
                    i64::from(release.closed),
                    release.close_time.map(epoch_millis),
                ],
            )
            .context("failed to insert release")?;
        Ok(())
    }

    /// Load one release's aggregation metadata, `None` when unknown.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_release(&self, release_id: ReleaseId) -> Result<Option<ReleaseMeta>> {
        let row = self
            .conn
            .query_row(
                "SELECT creation_time, closed, close_time FROM releases WHERE release_id = ?1",
                params![release_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )
            .optional()
            .context("failed to query release")?;

        let Some((creation_time, closed, close_time)) = row else {
            return Ok(None);
        };
        Ok(Some(ReleaseMeta {
            id: release_id,
            creation_time: from_epoch_millis(creation_time)?,
            closed: closed != 0,
            close_time: close_time.map(from_epoch_millis).transpose()?,
        }))
    }

    /// Append one release metadata audit row.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn record_release_audit(&self, audit: &ReleaseAudit) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO release_audit(
                    release_id, action, original_json, modified_json,
                    actor_id, actor_username, modification_time
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    audit.release_id.to_string(),
                    audit.action.as_str(),
                    json_opt(&audit.original)?,
                    json_opt(&audit.modified)?,
                    audit.actor.id.map(|id| id.to_string()),
                    audit.actor.username,
                    epoch_millis(audit.modification_time),
                ],
            )
            .context("failed to insert release audit")?;
        Ok(())
    }

    /// Append one approval audit row.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn record_approval_audit(&self, audit: &ApprovalAudit) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO approval_audit(
                    approval_id, release_id, action, original_json, modified_json,
                    actor_id, actor_username, modification_time
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    audit.approval_id.to_string(),
                    audit.release_id.to_string(),
                    audit.action.as_str(),
                    json_opt(&audit.original)?,
                    json_opt(&audit.modified)?,
                    audit.actor.id.map(|id| id.to_string()),
                    audit.actor.username,
                    epoch_millis(audit.modification_time),
                ],
            )
            .context("failed to insert approval audit")?;
        Ok(())
    }

    /// Append one run audit row.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn record_run_audit(&self, audit: &RunAudit) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO run_audit(
                    release_id, action, original_json, modified_json,
                    actor_id, actor_username, modification_time
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    audit.release_id.to_string(),
                    audit.action.as_str(),
                    json_opt(&audit.original)?,
                    json_opt(&audit.modified)?,
                    audit.actor.id.map(|id| id.to_string()),
                    audit.actor.username,
                    epoch_millis(audit.modification_time),
                ],
            )
            .context("failed to insert run audit")?;
        Ok(())
    }

    /// Append one manual color override audit row.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn record_override_audit(&self, audit: &OverrideAudit) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO override_audit(
                    override_id, release_id, action, original_json, modified_json,
                    actor_id, actor_username, modification_time
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    audit.override_id.to_string(),
                    audit.release_id.to_string(),
                    audit.action.as_str(),
                    json_opt(&audit.original)?,
                    json_opt(&audit.modified)?,
                    audit.actor.id.map(|id| id.to_string()),
                    audit.actor.username,
                    epoch_millis(audit.modification_time),
                ],
            )
            .context("failed to insert override audit")?;
        Ok(())
    }

    /// Persist one comment and its replies in a single transaction.
    ///
    /// # Errors
    /// Returns an error when serialization or any write in the transaction fails.
    pub fn insert_comment(&mut self, comment: &CommentRecord) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start comment transaction")?;

        tx.execute(
            "INSERT INTO comments(
                comment_id, release_id, content, created_by_id, created_by_username,
                creation_time, status, reference_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                comment.id.to_string(),
                comment.release_id.to_string(),
                comment.content,
                comment.created_by.id.map(|id| id.to_string()),
                comment.created_by.username,
                epoch_millis(comment.creation_time),
                comment.status.as_str(),
                serde_json::to_string(&comment.reference)
                    .context("failed to serialize comment reference")?,
            ],
        )
        .context("failed to insert comment")?;

        for reply in &comment.replies {
            tx.execute(
                "INSERT INTO comment_replies(
                    reply_id, comment_id, content, created_by_id, created_by_username, creation_time
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    reply.id.to_string(),
                    comment.id.to_string(),
                    reply.content,
                    reply.created_by.id.map(|id| id.to_string()),
                    reply.created_by.username,
                    epoch_millis(reply.creation_time),
                ],
            )
            .context("failed to insert comment reply")?;
        }

        tx.commit().context("failed to commit comment transaction")?;
        Ok(())
    }

    /// Flip one comment's resolution status.
    ///
    /// # Errors
    /// Returns an error when the comment does not exist or the update fails.
    pub fn set_comment_status(&self, comment_id: CommentId, status: CommentStatus) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE comments SET status = ?1 WHERE comment_id = ?2",
                params![status.as_str(), comment_id.to_string()],
            )
            .context("failed to update comment status")?;
        if changed == 0 {
            return Err(anyhow!("unknown comment: {comment_id}"));
        }
        Ok(())
    }

    /// Begin a read snapshot over all five audit trails. Every source drawn
    /// from the returned snapshot reads the same transaction, so one history
    /// page never mixes data from different commit points.
    ///
    /// # Errors
    /// Returns an error when the snapshot transaction cannot be started.
    pub fn history_snapshot(&mut self) -> Result<HistorySnapshot<'_>> {
        let tx = self.conn.transaction().context("failed to start history snapshot")?;
        Ok(HistorySnapshot { tx })
    }
}

/// One consistent read view over the audit tables, valid until dropped.
pub struct HistorySnapshot<'conn> {
    tx: Transaction<'conn>,
}

impl<'conn> HistorySnapshot<'conn> {
    /// An audit source for one of the event-bearing trails. For the comment
    /// trail use [`HistorySnapshot::comment_source`], which can narrow by
    /// resolution status.
    #[must_use]
    pub fn source(&self, kind: SourceKind) -> SnapshotSource<'_, 'conn> {
        SnapshotSource { tx: &self.tx, kind, comment_status: None }
    }

    /// The comment audit source, optionally narrowed to one resolution status
    /// at query level rather than post-fetch.
    #[must_use]
    pub fn comment_source(&self, status: Option<CommentStatus>) -> SnapshotSource<'_, 'conn> {
        SnapshotSource { tx: &self.tx, kind: SourceKind::Comment, comment_status: status }
    }
}

impl UserResolver for HistorySnapshot<'_> {
    fn resolve(&self, actor: &Actor) -> Result<Option<UserProfile>, HistoryError> {
        if let Some(id) = actor.id {
            let profile = self.user_where("user_id = ?1", &id.to_string())?;
            if profile.is_some() {
                return Ok(profile);
            }
        }
        if actor.username.trim().is_empty() {
            return Ok(None);
        }
        self.user_where("username = ?1", &actor.username)
    }
}

impl CommentResolver for HistorySnapshot<'_> {
    fn comment_text(&self, id: CommentId) -> Result<Option<String>, HistoryError> {
        self.tx
            .query_row(
                "SELECT content FROM comments WHERE comment_id = ?1",
                params![id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(query_err)
    }
}

impl HistorySnapshot<'_> {
    fn user_where(
        &self,
        predicate: &str,
        value: &str,
    ) -> Result<Option<UserProfile>, HistoryError> {
        let sql = format!(
            "SELECT user_id, username, display_name, email FROM users WHERE {predicate}"
        );
        let row = self
            .tx
            .query_row(&sql, params![value], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .optional()
            .map_err(query_err)?;

        let Some((user_id, username, display_name, email)) = row else {
            return Ok(None);
        };
        Ok(Some(UserProfile {
            id: UserId(parse_stored_ulid(&user_id)?),
            username,
            display_name,
            email,
        }))
    }
}

/// One audit trail read through the snapshot transaction.
pub struct SnapshotSource<'snap, 'conn> {
    tx: &'snap Transaction<'conn>,
    kind: SourceKind,
    comment_status: Option<CommentStatus>,
}

struct AuditRow {
    entity_id: Option<String>,
    action: String,
    original_json: Option<String>,
    modified_json: Option<String>,
    actor_id: Option<String>,
    actor_username: String,
    modification_time: i64,
}

struct CommentRow {
    comment_id: String,
    content: String,
    created_by_id: Option<String>,
    created_by_username: String,
    creation_time: i64,
    status: String,
    reference_json: String,
}

impl AuditSource for SnapshotSource<'_, '_> {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn list(
        &self,
        release_id: ReleaseId,
        timestamp: OffsetDateTime,
        amount: usize,
        direction: FetchDirection,
    ) -> Result<Vec<SourceRecord>, HistoryError> {
        match self.kind {
            SourceKind::Comment => self.list_comments(release_id, timestamp, amount, direction),
            SourceKind::Release | SourceKind::Approval | SourceKind::Run | SourceKind::Override => {
                self.list_audits(release_id, timestamp, amount, direction)
            }
        }
    }
}

impl SnapshotSource<'_, '_> {
    fn list_audits(
        &self,
        release_id: ReleaseId,
        timestamp: OffsetDateTime,
        amount: usize,
        direction: FetchDirection,
    ) -> Result<Vec<SourceRecord>, HistoryError> {
        let (table, entity_column) = match self.kind {
            SourceKind::Release => ("release_audit", "NULL"),
            SourceKind::Approval => ("approval_audit", "approval_id"),
            SourceKind::Run => ("run_audit", "NULL"),
            SourceKind::Override => ("override_audit", "override_id"),
            SourceKind::Comment => {
                return Err(HistoryError::Query(
                    "comment source queried through the audit path".to_string(),
                ))
            }
        };
        let (op, order) = direction_sql(direction);
        let sql = format!(
            "SELECT {entity_column}, action, original_json, modified_json,
                    actor_id, actor_username, modification_time
             FROM {table}
             WHERE release_id = ?1 AND modification_time {op} ?2
             ORDER BY modification_time {order}, id {order}
             LIMIT ?3"
        );

        let mut stmt = self.tx.prepare(&sql).map_err(query_err)?;
        let rows = stmt
            .query_map(
                params![release_id.to_string(), epoch_millis(timestamp), limit(amount)],
                |row| {
                    Ok(AuditRow {
                        entity_id: row.get(0)?,
                        action: row.get(1)?,
                        original_json: row.get(2)?,
                        modified_json: row.get(3)?,
                        actor_id: row.get(4)?,
                        actor_username: row.get(5)?,
                        modification_time: row.get(6)?,
                    })
                },
            )
            .map_err(query_err)?;

        let mut records = Vec::new();
        for row in rows {
            let row = row.map_err(query_err)?;
            records.push(self.audit_row_to_record(release_id, row)?);
        }
        Ok(records)
    }

    fn audit_row_to_record(
        &self,
        release_id: ReleaseId,
        row: AuditRow,
    ) -> Result<SourceRecord, HistoryError> {
        let action = AuditAction::parse(&row.action)
            .ok_or_else(|| HistoryError::Query(format!("unknown audit action: {}", row.action)))?;
        let actor = actor_from_columns(row.actor_id, row.actor_username)?;
        let modification_time = from_epoch_millis(row.modification_time)?;

        let record = match self.kind {
            SourceKind::Release => SourceRecord::Release(ReleaseAudit {
                release_id,
                action,
                original: json_column(row.original_json.as_deref())?,
                modified: json_column(row.modified_json.as_deref())?,
                actor,
                modification_time,
            }),
            SourceKind::Approval => SourceRecord::Approval(ApprovalAudit {
                approval_id: ApprovalId(parse_stored_ulid(&required_entity_id(row.entity_id)?)?),
                release_id,
                action,
                original: json_column(row.original_json.as_deref())?,
                modified: json_column(row.modified_json.as_deref())?,
                actor,
                modification_time,
            }),
            SourceKind::Run => SourceRecord::Run(RunAudit {
                release_id,
                action,
                original: json_column(row.original_json.as_deref())?,
                modified: json_column(row.modified_json.as_deref())?,
                actor,
                modification_time,
            }),
            SourceKind::Override => SourceRecord::Override(OverrideAudit {
                override_id: OverrideId(parse_stored_ulid(&required_entity_id(row.entity_id)?)?),
                release_id,
                action,
                original: json_column(row.original_json.as_deref())?,
                modified: json_column(row.modified_json.as_deref())?,
                actor,
                modification_time,
            }),
            SourceKind::Comment => {
                return Err(HistoryError::Query(
                    "comment source queried through the audit path".to_string(),
                ))
            }
        };
        Ok(record)
    }

    fn list_comments(
        &self,
        release_id: ReleaseId,
        timestamp: OffsetDateTime,
        amount: usize,
        direction: FetchDirection,
    ) -> Result<Vec<SourceRecord>, HistoryError> {
        let (op, order) = direction_sql(direction);
        let status_clause = match self.comment_status {
            Some(_) => "AND status = ?4",
            None => "",
        };
        let sql = format!(
            "SELECT comment_id, content, created_by_id, created_by_username,
                    creation_time, status, reference_json
             FROM comments
             WHERE release_id = ?1 AND creation_time {op} ?2 {status_clause}
             ORDER BY creation_time {order}, comment_id {order}
             LIMIT ?3"
        );

        let mut stmt = self.tx.prepare(&sql).map_err(query_err)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(CommentRow {
                comment_id: row.get(0)?,
                content: row.get(1)?,
                created_by_id: row.get(2)?,
                created_by_username: row.get(3)?,
                creation_time: row.get(4)?,
                status: row.get(5)?,
                reference_json: row.get(6)?,
            })
        };
        let rows: Vec<rusqlite::Result<CommentRow>> = match self.comment_status {
            Some(status) => stmt
                .query_map(
                    params![
                        release_id.to_string(),
                        epoch_millis(timestamp),
                        limit(amount),
                        status.as_str()
                    ],
                    map_row,
                )
                .map_err(query_err)?
                .collect(),
            None => stmt
                .query_map(
                    params![release_id.to_string(), epoch_millis(timestamp), limit(amount)],
                    map_row,
                )
                .map_err(query_err)?
                .collect(),
        };

        let mut records = Vec::new();
        for row in rows {
            let row = row.map_err(query_err)?;
            records.push(SourceRecord::Comment(self.comment_row_to_record(release_id, row)?));
        }
        Ok(records)
    }

    fn comment_row_to_record(
        &self,
        release_id: ReleaseId,
        row: CommentRow,
    ) -> Result<CommentRecord, HistoryError> {
        let status = CommentStatus::parse(&row.status).ok_or_else(|| {
            HistoryError::Query(format!("unknown comment status: {}", row.status))
        })?;
        let reference = serde_json::from_str(&row.reference_json).map_err(query_err)?;
        let comment_id = CommentId(parse_stored_ulid(&row.comment_id)?);

        Ok(CommentRecord {
            id: comment_id,
            release_id,
            content: row.content,
            created_by: actor_from_columns(row.created_by_id, row.created_by_username)?,
            creation_time: from_epoch_millis(row.creation_time)?,
            status,
            reference,
            replies: self.load_replies(comment_id)?,
        })
    }

    fn load_replies(&self, comment_id: CommentId) -> Result<Vec<CommentReply>, HistoryError> {
        let mut stmt = self
            .tx
            .prepare(
                "SELECT reply_id, content, created_by_id, created_by_username, creation_time
                 FROM comment_replies
                 WHERE comment_id = ?1
                 ORDER BY creation_time ASC, reply_id ASC",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![comment_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(query_err)?;

        let mut replies = Vec::new();
        for row in rows {
            let (reply_id, content, created_by_id, created_by_username, creation_time) =
                row.map_err(query_err)?;
            replies.push(CommentReply {
                id: CommentId(parse_stored_ulid(&reply_id)?),
                content,
                created_by: actor_from_columns(created_by_id, created_by_username)?,
                creation_time: from_epoch_millis(creation_time)?,
            });
        }
        Ok(replies)
    }
}

fn direction_sql(direction: FetchDirection) -> (&'static str, &'static str) {
    match direction {
        FetchDirection::After => (">", "ASC"),
        FetchDirection::Before => ("<", "DESC"),
    }
}

fn limit(amount: usize) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}

fn query_err(err: impl Display) -> HistoryError {
    HistoryError::Query(err.to_string())
}

fn parse_stored_ulid(raw: &str) -> Result<Ulid, HistoryError> {
    Ulid::from_string(raw).map_err(|err| HistoryError::Query(format!("invalid ULID {raw}: {err}")))
}

fn required_entity_id(entity_id: Option<String>) -> Result<String, HistoryError> {
    entity_id.ok_or_else(|| HistoryError::Query("audit row is missing its entity id".to_string()))
}

fn actor_from_columns(id: Option<String>, username: String) -> Result<Actor, HistoryError> {
    let id = match id {
        Some(raw) => Some(UserId(parse_stored_ulid(&raw)?)),
        None => None,
    };
    Ok(Actor { id, username })
}

fn json_column<T: DeserializeOwned>(raw: Option<&str>) -> Result<Option<T>, HistoryError> {
    raw.map(|text| serde_json::from_str(text).map_err(query_err)).transpose()
}

fn json_opt<T: Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(|inner| serde_json::to_string(inner).context("failed to serialize audit snapshot"))
        .transpose()
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get(0)
    })
    .context("failed to read schema version")
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format migration timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .context("failed to record schema version")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use release_history_core::{
        aggregate_history, ApprovalMode, ApprovalSnapshot, ApprovalState, CommentReference,
        EngineConfig, HistoryPayload, HistoryQuery, ReleaseState, RunResult, RunState, RunStatus,
        SortOrder,
    };
    use time::Duration;

    use super::*;

    fn at(seconds: i64, millis: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH
            + Duration::seconds(1_700_000_000 + seconds)
            + Duration::milliseconds(millis)
    }

    fn actor(username: &str) -> Actor {
        Actor { id: Some(UserId::new()), username: username.to_string() }
    }

    fn open_migrated() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn seeded_release(store: &SqliteStore) -> Result<ReleaseMeta> {
        let release = ReleaseMeta {
            id: ReleaseId::new(),
            creation_time: at(0, 0),
            closed: false,
            close_time: None,
        };
        store.insert_release(&release)?;
        Ok(release)
    }

    fn release_state(name: &str) -> ReleaseState {
        ReleaseState {
            name: name.to_string(),
            planned_date: at(86_400, 0),
            approval_mode: ApprovalMode::One,
            approval_state: ApprovalState::Pending,
            closed: false,
        }
    }

    fn run_completion(
        release_id: ReleaseId,
        run_number: u32,
        result: RunResult,
        timestamp: OffsetDateTime,
    ) -> RunAudit {
        RunAudit {
            release_id,
            action: AuditAction::Update,
            original: Some(RunState {
                run_number,
                status: RunStatus::Running,
                overall_result: None,
            }),
            modified: Some(RunState {
                run_number,
                status: RunStatus::Completed,
                overall_result: Some(result),
            }),
            actor: actor("runner"),
            modification_time: timestamp,
        }
    }

    fn comment(
        release_id: ReleaseId,
        content: &str,
        status: CommentStatus,
        timestamp: OffsetDateTime,
    ) -> CommentRecord {
        CommentRecord {
            id: CommentId::new(),
            release_id,
            content: content.to_string(),
            created_by: actor("commenter"),
            creation_time: timestamp,
            status,
            reference: CommentReference::Release,
            replies: Vec::new(),
        }
    }

    #[test]
    fn migrate_initializes_schema_and_reports_status() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;

        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;

        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn audit_tables_reject_unknown_actions() -> Result<()> {
        let store = open_migrated()?;
        let release = seeded_release(&store)?;

        let result = store.conn.execute(
            "INSERT INTO release_audit(
                release_id, action, original_json, modified_json,
                actor_id, actor_username, modification_time
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                release.id.to_string(),
                "not_an_action",
                Option::<String>::None,
                Option::<String>::None,
                Option::<String>::None,
                "tester",
                0_i64,
            ],
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn release_round_trip_preserves_window() -> Result<()> {
        let store = open_migrated()?;
        let release = ReleaseMeta {
            id: ReleaseId::new(),
            creation_time: at(0, 123),
            closed: true,
            close_time: Some(at(500, 456)),
        };
        store.insert_release(&release)?;

        assert_eq!(store.get_release(release.id)?, Some(release));
        assert_eq!(store.get_release(ReleaseId::new())?, None);
        Ok(())
    }

    #[test]
    fn snapshot_source_bounds_are_strict_in_both_directions() -> Result<()> {
        let mut store = open_migrated()?;
        let release = seeded_release(&store)?;

        for (run_number, seconds) in [(1_u32, 10_i64), (2, 20), (3, 30)] {
            store.record_run_audit(&run_completion(
                release.id,
                run_number,
                RunResult::Green,
                at(seconds, 0),
            ))?;
        }

        let snapshot = store.history_snapshot()?;
        let source = snapshot.source(SourceKind::Run);

        let after = source.list(release.id, at(10, 0), 10, FetchDirection::After)?;
        let after_times: Vec<OffsetDateTime> =
            after.iter().map(SourceRecord::modification_time).collect();
        assert_eq!(after_times, vec![at(20, 0), at(30, 0)]);

        let before = source.list(release.id, at(30, 0), 10, FetchDirection::Before)?;
        let before_times: Vec<OffsetDateTime> =
            before.iter().map(SourceRecord::modification_time).collect();
        assert_eq!(before_times, vec![at(20, 0), at(10, 0)]);

        let capped = source.list(release.id, at(0, 0), 1, FetchDirection::After)?;
        assert_eq!(capped.len(), 1);
        Ok(())
    }

    #[test]
    fn comment_source_filters_status_and_loads_replies() -> Result<()> {
        let mut store = open_migrated()?;
        let release = seeded_release(&store)?;

        let mut open_comment = comment(release.id, "please check", CommentStatus::Unresolved, at(5, 0));
        open_comment.replies.push(CommentReply {
            id: CommentId::new(),
            content: "on it".to_string(),
            created_by: actor("replier"),
            creation_time: at(6, 0),
        });
        store.insert_comment(&open_comment)?;
        store.insert_comment(&comment(release.id, "done", CommentStatus::Resolved, at(7, 0)))?;

        let snapshot = store.history_snapshot()?;

        let all = snapshot.comment_source(None).list(release.id, at(0, 0), 10, FetchDirection::After)?;
        assert_eq!(all.len(), 2);
        match &all[0] {
            SourceRecord::Comment(loaded) => {
                assert_eq!(loaded.content, "please check");
                assert_eq!(loaded.replies.len(), 1);
                assert_eq!(loaded.replies[0].content, "on it");
            }
            other => panic!("expected comment record, got {other:?}"),
        }

        let resolved = snapshot
            .comment_source(Some(CommentStatus::Resolved))
            .list(release.id, at(0, 0), 10, FetchDirection::After)?;
        assert_eq!(resolved.len(), 1);
        match &resolved[0] {
            SourceRecord::Comment(loaded) => assert_eq!(loaded.status, CommentStatus::Resolved),
            other => panic!("expected comment record, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn comment_status_update_is_visible_to_later_snapshots() -> Result<()> {
        let mut store = open_migrated()?;
        let release = seeded_release(&store)?;
        let record = comment(release.id, "pending", CommentStatus::Unresolved, at(5, 0));
        store.insert_comment(&record)?;

        store.set_comment_status(record.id, CommentStatus::Resolved)?;
        assert!(store.set_comment_status(CommentId::new(), CommentStatus::Resolved).is_err());

        let snapshot = store.history_snapshot()?;
        let resolved = snapshot
            .comment_source(Some(CommentStatus::Resolved))
            .list(release.id, at(0, 0), 10, FetchDirection::After)?;
        assert_eq!(resolved.len(), 1);
        Ok(())
    }

    #[test]
    fn user_resolution_prefers_id_then_falls_back_to_username() -> Result<()> {
        let mut store = open_migrated()?;
        let profile = UserProfile {
            id: UserId::new(),
            username: "ann".to_string(),
            display_name: Some("Ann".to_string()),
            email: None,
        };
        store.insert_user(&profile)?;

        let snapshot = store.history_snapshot()?;

        let by_id = snapshot.resolve(&Actor {
            id: Some(profile.id),
            username: "stale-name".to_string(),
        })?;
        assert_eq!(by_id, Some(profile.clone()));

        let by_username = snapshot.resolve(&Actor { id: None, username: "ann".to_string() })?;
        assert_eq!(by_username, Some(profile));

        let unknown = snapshot.resolve(&Actor {
            id: Some(UserId::new()),
            username: "nobody".to_string(),
        })?;
        assert_eq!(unknown, None);
        Ok(())
    }

    #[test]
    fn stale_comment_lookup_returns_none_not_error() -> Result<()> {
        let mut store = open_migrated()?;
        let snapshot = store.history_snapshot()?;
        assert_eq!(snapshot.comment_text(CommentId::new())?, None);
        Ok(())
    }

    #[test]
    fn snapshot_sources_drive_a_full_aggregation_pass() -> Result<()> {
        let mut store = open_migrated()?;
        let release = seeded_release(&store)?;

        let approver = UserProfile {
            id: UserId::new(),
            username: "ann".to_string(),
            display_name: Some("Ann".to_string()),
            email: None,
        };
        store.insert_user(&approver)?;
        store.record_approval_audit(&ApprovalAudit {
            approval_id: ApprovalId::new(),
            release_id: release.id,
            action: AuditAction::Create,
            original: None,
            modified: Some(ApprovalSnapshot {
                approver: Actor { id: Some(approver.id), username: "ann".to_string() },
                state: ApprovalState::Pending,
                comment: None,
            }),
            actor: actor("maintainer"),
            modification_time: at(1, 0),
        })?;
        store.record_run_audit(&run_completion(release.id, 1, RunResult::Green, at(2, 0)))?;
        store.insert_comment(&comment(release.id, "ship it", CommentStatus::Unresolved, at(3, 0)))?;

        // An update with no tracked diff must not surface.
        store.record_release_audit(&ReleaseAudit {
            release_id: release.id,
            action: AuditAction::Update,
            original: Some(release_state("v1.0")),
            modified: Some(release_state("v1.0")),
            actor: actor("maintainer"),
            modification_time: at(4, 0),
        })?;

        let snapshot = store.history_snapshot()?;
        let release_source = snapshot.source(SourceKind::Release);
        let approval_source = snapshot.source(SourceKind::Approval);
        let run_source = snapshot.source(SourceKind::Run);
        let override_source = snapshot.source(SourceKind::Override);
        let comment_source = snapshot.comment_source(None);
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
            &HistoryQuery {
                page_size: 10,
                sort_order: SortOrder::Asc,
                last_timestamp: None,
                filter: None,
            },
            &EngineConfig::default(),
            at(100, 0),
        )?;

        assert_eq!(page.items.len(), 3);
        match &page.items[0].payload {
            HistoryPayload::Event(event) => assert_eq!(event.action, "added Ann"),
            HistoryPayload::Comment(_) => panic!("expected event-kind item"),
        }
        match &page.items[2].payload {
            HistoryPayload::Comment(loaded) => assert_eq!(loaded.content, "ship it"),
            HistoryPayload::Event(_) => panic!("expected comment-kind item"),
        }
        assert_eq!(page.next_timestamp, at(3, 1));
        Ok(())
    }
}
