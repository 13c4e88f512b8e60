use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::json;

use jobservice_core::{JobId, JobTypeKey, RetryPolicy};
use jobservice_events::{
    AttemptCompleted, Endpoint, Envelope, InMemoryMessageBus, InMemoryMessageScheduler, JobMessage,
    MessageBus, SubmitJob, Subscription,
};
use jobservice_infra::{Dispatcher, SagaRepositories};

type BenchDispatcher = Dispatcher<Arc<InMemoryMessageBus>, Arc<InMemoryMessageScheduler>>;

fn drain(dispatcher: &BenchDispatcher, queues: &[Subscription<Envelope>]) -> usize {
    let mut dispatched = 0;
    loop {
        let mut progressed = false;
        for queue in queues {
            while let Ok(envelope) = queue.try_recv() {
                let _ = dispatcher.dispatch(&envelope, Utc::now());
                dispatched += 1;
                progressed = true;
            }
        }
        if !progressed {
            return dispatched;
        }
    }
}

/// Submit `jobs` jobs and run each to completion through the dispatcher.
fn bench_job_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_pipeline");
    let job_type = JobTypeKey::new("bench.export").unwrap();

    for jobs in [10usize, 100] {
        group.throughput(Throughput::Elements(jobs as u64));
        group.bench_with_input(BenchmarkId::new("submit_to_complete", jobs), &jobs, |b, &jobs| {
            b.iter(|| {
                let repositories = SagaRepositories::in_memory();
                let bus = InMemoryMessageBus::arc();
                let scheduler = InMemoryMessageScheduler::arc();
                let dispatcher = Dispatcher::new(&repositories, bus.clone(), scheduler, 3);
                let queues: Vec<_> = [Endpoint::JobType, Endpoint::Job, Endpoint::JobAttempt]
                    .iter()
                    .map(|e| bus.subscribe(e))
                    .collect();
                let work_queue = bus.subscribe(&Endpoint::JobConsumer(job_type.clone()));

                for _ in 0..jobs {
                    let submit = SubmitJob {
                        job_id: JobId::new(),
                        job_type: job_type.clone(),
                        payload: json!({ "rows": 1000 }),
                        retry_policy: RetryPolicy::none(),
                        max_attempt_duration: Duration::from_secs(30),
                        concurrent_job_limit: 4,
                    };
                    let _ = bus.send(Envelope::new(Endpoint::Job, JobMessage::SubmitJob(submit), Utc::now()));
                }

                let mut dispatched = drain(&dispatcher, &queues);
                let mut completed = 0;
                while completed < jobs {
                    let Ok(envelope) = work_queue.try_recv() else {
                        break;
                    };
                    if let JobMessage::ExecuteAttempt(work) = envelope.into_message() {
                        let report = JobMessage::AttemptCompleted(AttemptCompleted {
                            job_id: work.job_id,
                            attempt_id: work.attempt_id,
                            result: json!(null),
                        });
                        let _ = bus.send(Envelope::new(Endpoint::JobAttempt, report, Utc::now()));
                        dispatched += drain(&dispatcher, &queues);
                        completed += 1;
                    }
                }
                black_box((dispatched, completed))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_job_pipeline);
criterion_main!(benches);
