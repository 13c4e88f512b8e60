use std::time::Duration;

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::json;

use jobservice_core::{JobId, JobTypeKey, RetryPolicy, StateMachine, Transition};
use jobservice_events::{
    AttemptCompleted, AttemptFaulted, SlotGranted, SlotReleased, SlotRequested, SubmitJob,
};
use jobservice_jobs::{Job, JobEvent, JobStateMachine, JobType, JobTypeEvent, JobTypeStateMachine};

fn key() -> JobTypeKey {
    JobTypeKey::new("bench.export").unwrap()
}

fn apply_job(job: Option<&Job>, event: &JobEvent) -> Job {
    match JobStateMachine::transition(job, event, Utc::now()).unwrap() {
        Transition::Changed { instance, .. } => instance,
        Transition::Ignored => job.cloned().unwrap(),
    }
}

/// One job from submission to completion, with `faults` faulted attempts first.
fn bench_job_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_lifecycle");

    for faults in [0u32, 3] {
        group.bench_with_input(BenchmarkId::new("submit_to_complete", faults), &faults, |b, &faults| {
            b.iter(|| {
                let job_id = JobId::new();
                let submit = JobEvent::Submit(SubmitJob {
                    job_id,
                    job_type: key(),
                    payload: json!({ "rows": 1000 }),
                    retry_policy: RetryPolicy::immediate(faults),
                    max_attempt_duration: Duration::from_secs(30),
                    concurrent_job_limit: 4,
                });
                let mut job = apply_job(None, &submit);
                job = apply_job(
                    Some(&job),
                    &JobEvent::SlotGranted(SlotGranted {
                        job_id,
                        job_type: key(),
                    }),
                );

                for _ in 0..faults {
                    let attempt_id = job.active_attempt().unwrap();
                    job = apply_job(
                        Some(&job),
                        &JobEvent::AttemptFaulted(AttemptFaulted {
                            job_id,
                            attempt_id,
                            reason: "transient".into(),
                            timed_out: false,
                        }),
                    );
                }

                let attempt_id = job.active_attempt().unwrap();
                black_box(apply_job(
                    Some(&job),
                    &JobEvent::AttemptCompleted(AttemptCompleted {
                        job_id,
                        attempt_id,
                        result: json!(true),
                    }),
                ))
            })
        });
    }

    group.finish();
}

/// Slot churn against a job type with a deep pending queue.
fn bench_slot_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_admission");

    for queued in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(queued as u64));
        group.bench_with_input(BenchmarkId::new("request_then_drain", queued), &queued, |b, &queued| {
            b.iter(|| {
                let jobs: Vec<JobId> = (0..queued).map(|_| JobId::new()).collect();
                let mut current: Option<JobType> = None;

                for job_id in &jobs {
                    let event = JobTypeEvent::SlotRequested(SlotRequested {
                        job_id: *job_id,
                        job_type: key(),
                        concurrent_job_limit: 4,
                    });
                    if let Transition::Changed { instance, .. } =
                        JobTypeStateMachine::transition(current.as_ref(), &event, Utc::now()).unwrap()
                    {
                        current = Some(instance);
                    }
                }
                for job_id in &jobs {
                    let event = JobTypeEvent::SlotReleased(SlotReleased {
                        job_id: *job_id,
                        job_type: key(),
                    });
                    if let Transition::Changed { instance, .. } =
                        JobTypeStateMachine::transition(current.as_ref(), &event, Utc::now()).unwrap()
                    {
                        current = Some(instance);
                    }
                }
                black_box(current)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_job_lifecycle, bench_slot_admission);
criterion_main!(benches);
