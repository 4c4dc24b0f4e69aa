use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use requisition_router::memory::{LogNotifier, LogPush, MemoryDirectory, MemoryStore};
use requisition_router::model::Identity;
use requisition_router::progress::{ApprovalStep, Step};
use requisition_router::router::RetryPolicy;
use requisition_router::{Action, Amount, ApprovalRequest, Policy, ProgressTracker, Router, Status};

/// Generates review actions for benchmarking.
///
/// Pattern per line item:
/// 1. First-line approve on a `511` fund (or second-line on any other fund)
/// 2. Senior-clerk approve of the resulting pending record
pub struct ReviewGenerator {
    line_items: u32,
    current: u32,
    finalize: bool,
}

impl ReviewGenerator {
    pub fn new(line_items: u32) -> Self {
        Self {
            line_items,
            current: 0,
            finalize: false,
        }
    }
}

impl Iterator for ReviewGenerator {
    type Item = ApprovalRequest;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.line_items {
            return None;
        }

        let line_item = format!("LI-{}", self.current);
        let fund = if self.current % 2 == 0 { "511000" } else { "422000" };
        let request = if self.finalize {
            ApprovalRequest::new(
                "REQ-1",
                line_item,
                Some(fund.into()),
                Some(Amount::from_whole(600)),
                "clerk",
                Action::Approve,
            )
            .with_status(Status::PendingApproval)
        } else {
            let reviewer = if self.current % 2 == 0 { "first" } else { "second" };
            ApprovalRequest::new(
                "REQ-1",
                line_item,
                Some(fund.into()),
                Some(Amount::from_whole(600)),
                reviewer,
                Action::Approve,
            )
        };

        if self.finalize {
            self.current += 1;
        }
        self.finalize = !self.finalize;
        Some(request.with_requester("requester"))
    }
}

fn router() -> Router {
    let directory = MemoryDirectory::new([
        Identity::new("first", "first@example.org", ["dept-first-line"]),
        Identity::new("second", "second@example.org", ["dept-second-line"]),
        Identity::new("clerk", "clerk@example.org", ["senior-clerk"]),
    ]);
    Router::new(
        Policy::default(),
        Arc::new(directory),
        Arc::new(MemoryStore::new()),
        Arc::new(LogNotifier),
    )
    .with_retry(RetryPolicy {
        attempts: 1,
        backoff: Duration::ZERO,
    })
}

fn bench_review_chain(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("review_chain");

    for count in [100u32, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                rt.block_on(async {
                    let router = router();
                    let tracker = ProgressTracker::new(Arc::new(LogPush));
                    for request in ReviewGenerator::new(count) {
                        let mut progress = tracker.start::<ApprovalStep>("bench");
                        let _ = black_box(router.route(request, &mut progress).await);
                    }
                    router
                })
            });
        });
    }

    group.finish();
}

fn bench_progress(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("progress");

    group.bench_function("approval_operation", |b| {
        let tracker = ProgressTracker::new(Arc::new(LogPush));
        b.iter(|| {
            rt.block_on(async {
                let mut progress = tracker.start::<ApprovalStep>("bench");
                for step in ApprovalStep::ALL {
                    black_box(progress.mark_step_done(*step).await);
                }
                progress
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_review_chain, bench_progress);
criterion_main!(benches);
