use criterion::{criterion_group, criterion_main, Criterion};
use release_history_core::{
    aggregate_history, Actor, ApprovalId, ApprovalSnapshot, ApprovalState, AuditAction,
    AuditSource, CommentId, CommentRecord, CommentReference, CommentResolver, CommentStatus,
    EngineConfig, FetchDirection, HistoryError, HistoryQuery, ReleaseId, ReleaseMeta, RunAudit,
    RunResult, RunState, RunStatus, SortOrder, SourceKind, SourceRecord, UserProfile, UserResolver,
};
use time::{Duration, OffsetDateTime};

struct BenchSource {
    kind: SourceKind,
    records: Vec<SourceRecord>,
}

impl AuditSource for BenchSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn list(
        &self,
        _release_id: ReleaseId,
        timestamp: OffsetDateTime,
        amount: usize,
        direction: FetchDirection,
    ) -> Result<Vec<SourceRecord>, HistoryError> {
        let mut matching: Vec<SourceRecord> = self
            .records
            .iter()
            .filter(|record| match direction {
                FetchDirection::After => record.modification_time() > timestamp,
                FetchDirection::Before => record.modification_time() < timestamp,
            })
            .cloned()
            .collect();
        matching.sort_by(|lhs, rhs| match direction {
            FetchDirection::After => lhs.modification_time().cmp(&rhs.modification_time()),
            FetchDirection::Before => rhs.modification_time().cmp(&lhs.modification_time()),
        });
        matching.truncate(amount);
        Ok(matching)
    }
}

struct NoUsers;

impl UserResolver for NoUsers {
    fn resolve(&self, _actor: &Actor) -> Result<Option<UserProfile>, HistoryError> {
        Ok(None)
    }
}

struct NoComments;

impl CommentResolver for NoComments {
    fn comment_text(&self, _id: CommentId) -> Result<Option<String>, HistoryError> {
        Ok(None)
    }
}

fn at(seconds: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000 + seconds)
}

fn bench_actor() -> Actor {
    Actor { id: None, username: "bench".to_string() }
}

fn mk_approval(release_id: ReleaseId, index: i64) -> SourceRecord {
    SourceRecord::Approval(release_history_core::ApprovalAudit {
        approval_id: ApprovalId::new(),
        release_id,
        action: AuditAction::Create,
        original: None,
        modified: Some(ApprovalSnapshot {
            approver: bench_actor(),
            state: ApprovalState::Pending,
            comment: None,
        }),
        actor: bench_actor(),
        modification_time: at(index * 3),
    })
}

fn mk_run(release_id: ReleaseId, index: i64) -> SourceRecord {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let run_number = index as u32;
    SourceRecord::Run(RunAudit {
        release_id,
        action: AuditAction::Update,
        original: Some(RunState { run_number, status: RunStatus::Running, overall_result: None }),
        modified: Some(RunState {
            run_number,
            status: RunStatus::Completed,
            overall_result: Some(RunResult::Green),
        }),
        actor: bench_actor(),
        modification_time: at(index * 3 + 1),
    })
}

fn mk_comment(release_id: ReleaseId, index: i64) -> SourceRecord {
    SourceRecord::Comment(CommentRecord {
        id: CommentId::new(),
        release_id,
        content: format!("comment {index}"),
        created_by: bench_actor(),
        creation_time: at(index * 3 + 2),
        status: CommentStatus::Unresolved,
        reference: CommentReference::Release,
        replies: Vec::new(),
    })
}

fn bench_aggregate(c: &mut Criterion) {
    let release_id = ReleaseId::new();
    let release =
        ReleaseMeta { id: release_id, creation_time: at(-1), closed: false, close_time: None };

    let approvals = BenchSource {
        kind: SourceKind::Approval,
        records: (0..1_000).map(|index| mk_approval(release_id, index)).collect(),
    };
    let runs = BenchSource {
        kind: SourceKind::Run,
        records: (0..1_000).map(|index| mk_run(release_id, index)).collect(),
    };
    let comments = BenchSource {
        kind: SourceKind::Comment,
        records: (0..1_000).map(|index| mk_comment(release_id, index)).collect(),
    };
    let releases = BenchSource { kind: SourceKind::Release, records: Vec::new() };
    let overrides = BenchSource { kind: SourceKind::Override, records: Vec::new() };
    let sources: [&dyn AuditSource; 5] = [&releases, &approvals, &runs, &overrides, &comments];

    c.bench_function("aggregate_descending_page_of_20", |b| {
        b.iter(|| {
            let page = aggregate_history(
                &release,
                &sources,
                &NoUsers,
                &NoComments,
                &HistoryQuery {
                    page_size: 20,
                    sort_order: SortOrder::Desc,
                    last_timestamp: None,
                    filter: None,
                },
                &EngineConfig::default(),
                at(10_000),
            );
            assert!(page.is_ok());
        });
    });
}

criterion_group!(benches, bench_aggregate);
criterion_main!(benches);
