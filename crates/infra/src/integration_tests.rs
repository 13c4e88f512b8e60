//! Integration tests for the full job pipeline.
//!
//! Tests: Submit → Job → JobType slot → Attempt → worker report → Job outcome
//!
//! The deterministic scenarios drive the real dispatcher over the in-memory bus and
//! scheduler on a manual clock, playing the worker by hand. The threaded tests run
//! the same pipeline through `JobService`.

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use chrono::{DateTime, TimeDelta, Utc};
    use serde_json::json;

    use jobservice_core::{AttemptId, JobId, JobTypeKey, RetryPolicy};
    use jobservice_events::{
        AttemptCompleted, AttemptFaulted, CancelRequested, Endpoint, Envelope, ExecuteAttempt,
        InMemoryMessageBus, InMemoryMessageScheduler, JobMessage, MessageBus, ScheduleId,
        SetConcurrentJobLimit, SubmitJob, Subscription,
    };
    use jobservice_jobs::{AttemptStatus, Job, JobAttempt, JobStatus, JobType};

    use crate::config::{JobServiceOptions, JobTypeOptions};
    use crate::consumer::JobOutcome;
    use crate::dispatcher::{DispatchOutcome, Dispatcher};
    use crate::saga::SagaRepositories;
    use crate::saga_repository::SagaRepository;
    use crate::service::JobService;

    fn key(job_type: &str) -> JobTypeKey {
        JobTypeKey::new(job_type).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-05T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn secs(n: i64) -> TimeDelta {
        TimeDelta::seconds(n)
    }

    /// One in-process job service whose consumers are stepped by the test.
    struct Harness {
        repositories: SagaRepositories,
        bus: Arc<InMemoryMessageBus>,
        scheduler: Arc<InMemoryMessageScheduler>,
        dispatcher: Dispatcher<Arc<InMemoryMessageBus>, Arc<InMemoryMessageScheduler>>,
        saga_queues: Vec<(Endpoint, Subscription<Envelope>)>,
        notifications: Subscription<Envelope>,
    }

    impl Harness {
        fn new() -> Self {
            let repositories = SagaRepositories::in_memory();
            let bus = InMemoryMessageBus::arc();
            let scheduler = InMemoryMessageScheduler::arc();
            let dispatcher = Dispatcher::new(&repositories, bus.clone(), scheduler.clone(), 3);
            let saga_queues = [Endpoint::JobType, Endpoint::Job, Endpoint::JobAttempt]
                .into_iter()
                .map(|endpoint| {
                    let queue = bus.subscribe(&endpoint);
                    (endpoint, queue)
                })
                .collect();
            let notifications = bus.subscribe(&Endpoint::Notifications);

            Self {
                repositories,
                bus,
                scheduler,
                dispatcher,
                saga_queues,
                notifications,
            }
        }

        fn send(&self, endpoint: Endpoint, message: JobMessage, now: DateTime<Utc>) {
            self.bus.send(Envelope::new(endpoint, message, now)).unwrap();
        }

        fn submit_with(&self, job_id: JobId, job_type: &str, limit: u32, policy: RetryPolicy, max_secs: u64, now: DateTime<Utc>) {
            self.send(
                Endpoint::Job,
                JobMessage::SubmitJob(SubmitJob {
                    job_id,
                    job_type: key(job_type),
                    payload: json!({ "job": job_id.to_string() }),
                    retry_policy: policy,
                    max_attempt_duration: Duration::from_secs(max_secs),
                    concurrent_job_limit: limit,
                }),
                now,
            );
        }

        fn submit(&self, job_type: &str, limit: u32, policy: RetryPolicy, now: DateTime<Utc>) -> JobId {
            let job_id = JobId::new();
            self.submit_with(job_id, job_type, limit, policy, 60, now);
            job_id
        }

        /// Dispatch until every state machine queue is empty.
        fn drain(&self, now: DateTime<Utc>) -> Vec<DispatchOutcome> {
            self.drain_where(now, |_| true)
        }

        /// Dispatch until every queue but `held` is empty; `held` keeps its messages.
        fn drain_except(&self, held: &Endpoint, now: DateTime<Utc>) {
            self.drain_where(now, |endpoint| endpoint != held);
        }

        fn drain_where<F>(&self, now: DateTime<Utc>, include: F) -> Vec<DispatchOutcome>
        where
            F: Fn(&Endpoint) -> bool,
        {
            let mut outcomes = Vec::new();
            loop {
                let mut progressed = false;
                for (endpoint, queue) in &self.saga_queues {
                    if !include(endpoint) {
                        continue;
                    }
                    while let Ok(envelope) = queue.try_recv() {
                        outcomes.push(self.dispatcher.dispatch(&envelope, now).unwrap());
                        progressed = true;
                    }
                }
                if !progressed {
                    return outcomes;
                }
            }
        }

        /// Deliver the scheduled messages due at `now`, then drain.
        fn advance_to(&self, now: DateTime<Utc>) {
            for envelope in self.scheduler.release_due(now).unwrap() {
                self.bus.send(envelope).unwrap();
            }
            self.drain(now);
        }

        /// Remove the undelivered messages of a state machine queue.
        fn take_queued(&self, endpoint: &Endpoint) -> Vec<Envelope> {
            let mut taken = Vec::new();
            for (_, queue) in self.saga_queues.iter().filter(|(e, _)| e == endpoint) {
                while let Ok(envelope) = queue.try_recv() {
                    taken.push(envelope);
                }
            }
            taken
        }

        fn take_work(&self, job_type: &str) -> Vec<ExecuteAttempt> {
            let queue = self.bus.subscribe(&Endpoint::JobConsumer(key(job_type)));
            let mut work = Vec::new();
            while let Ok(envelope) = queue.try_recv() {
                match envelope.into_message() {
                    JobMessage::ExecuteAttempt(item) => work.push(item),
                    other => panic!("unexpected message on consumer queue: {other:?}"),
                }
            }
            work
        }

        fn complete(&self, work: &ExecuteAttempt, now: DateTime<Utc>) -> Vec<DispatchOutcome> {
            self.send(
                Endpoint::JobAttempt,
                JobMessage::AttemptCompleted(AttemptCompleted {
                    job_id: work.job_id,
                    attempt_id: work.attempt_id,
                    result: json!({ "retry": work.retry_number }),
                }),
                now,
            );
            self.drain(now)
        }

        fn fault(&self, work: &ExecuteAttempt, now: DateTime<Utc>) {
            self.send(
                Endpoint::JobAttempt,
                JobMessage::AttemptFaulted(AttemptFaulted {
                    job_id: work.job_id,
                    attempt_id: work.attempt_id,
                    reason: format!("failure on retry {}", work.retry_number),
                    timed_out: false,
                }),
                now,
            );
            self.drain(now);
        }

        fn cancel(&self, job_id: JobId, now: DateTime<Utc>) {
            self.send(
                Endpoint::Job,
                JobMessage::CancelRequested(CancelRequested {
                    job_id,
                    reason: Some("operator request".to_string()),
                }),
                now,
            );
            self.drain(now);
        }

        fn job(&self, job_id: JobId) -> Job {
            self.repositories.jobs.load(&job_id).unwrap().unwrap().instance
        }

        fn job_version(&self, job_id: JobId) -> u64 {
            self.repositories.jobs.load(&job_id).unwrap().unwrap().version
        }

        fn job_type(&self, job_type: &str) -> JobType {
            self.repositories
                .job_types
                .load(&key(job_type))
                .unwrap()
                .unwrap()
                .instance
        }

        fn attempt(&self, attempt_id: AttemptId) -> JobAttempt {
            self.repositories
                .attempts
                .load(&attempt_id)
                .unwrap()
                .unwrap()
                .instance
        }

        fn notifications(&self) -> Vec<JobMessage> {
            let mut messages = Vec::new();
            while let Ok(envelope) = self.notifications.try_recv() {
                messages.push(envelope.into_message());
            }
            messages
        }
    }

    #[test]
    fn concurrency_limit_queues_excess_jobs_until_a_slot_frees() {
        let h = Harness::new();
        let now = t0();

        let a = h.submit("export", 2, RetryPolicy::none(), now);
        let b = h.submit("export", 2, RetryPolicy::none(), now);
        let c = h.submit("export", 2, RetryPolicy::none(), now);
        h.drain(now);

        let work = h.take_work("export");
        let started: HashSet<JobId> = work.iter().map(|w| w.job_id).collect();
        assert_eq!(started, HashSet::from([a, b]));
        assert_eq!(h.job(a).status(), JobStatus::Running);
        assert_eq!(h.job(b).status(), JobStatus::Running);
        assert_eq!(h.job(c).status(), JobStatus::WaitingForSlot);

        let job_type = h.job_type("export");
        assert_eq!(job_type.running_count(), 2);
        assert_eq!(job_type.pending_count(), 1);

        let done = now + secs(5);
        let work_a = work.iter().find(|w| w.job_id == a).unwrap();
        h.complete(work_a, done);

        assert_eq!(h.job(a).status(), JobStatus::Completed);
        assert_eq!(h.job(c).status(), JobStatus::Running);
        let next = h.take_work("export");
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].job_id, c);

        let job_type = h.job_type("export");
        assert_eq!(job_type.running_count(), 2);
        assert_eq!(job_type.pending_count(), 0);
        assert!(!job_type.holds_slot(a));

        let notifications = h.notifications();
        assert!(matches!(
            notifications.as_slice(),
            [JobMessage::JobCompleted(n)] if n.job_id == a && n.completed_at == done
        ));
    }

    #[test]
    fn faulted_attempts_retry_until_success() {
        let h = Harness::new();
        let now = t0();
        let d = h.submit("import", 1, RetryPolicy::immediate(2), now);
        h.drain(now);

        for retry_number in 0..2 {
            let work = h.take_work("import");
            assert_eq!(work.len(), 1);
            assert_eq!(work[0].retry_number, retry_number);
            assert_eq!(work[0].attempt_id, AttemptId::for_retry(d, retry_number));
            h.fault(&work[0], now + secs(i64::from(retry_number) + 1));
            assert_eq!(h.job(d).status(), JobStatus::Running);
        }

        let last = h.take_work("import");
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].retry_number, 2);
        h.complete(&last[0], now + secs(10));

        let job = h.job(d);
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.retry_count(), 2);
        assert_eq!(job.result(), Some(&json!({ "retry": 2 })));

        let statuses: Vec<(u32, AttemptStatus)> = job
            .attempt_ids()
            .iter()
            .map(|id| {
                let attempt = h.attempt(*id);
                (attempt.retry_number(), attempt.status())
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                (0, AttemptStatus::Faulted),
                (1, AttemptStatus::Faulted),
                (2, AttemptStatus::Completed),
            ]
        );
        assert_eq!(h.job_type("import").running_count(), 0);
    }

    #[test]
    fn retry_backoff_defers_execution_but_keeps_the_slot() {
        let h = Harness::new();
        let now = t0();
        let job_id = h.submit("sync", 1, RetryPolicy::fixed(1, Duration::from_secs(30)), now);
        let waiting = h.submit("sync", 1, RetryPolicy::none(), now);
        h.drain(now);

        let first = h.take_work("sync");
        h.fault(&first[0], now + secs(1));

        assert!(h.take_work("sync").is_empty(), "retry runs only after the backoff");
        assert_eq!(h.job(job_id).status(), JobStatus::Running);
        assert_eq!(h.job(waiting).status(), JobStatus::WaitingForSlot);
        assert!(h.job_type("sync").holds_slot(job_id));

        h.advance_to(now + secs(20));
        assert!(h.take_work("sync").is_empty());

        h.advance_to(now + secs(31));
        let retry = h.take_work("sync");
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].retry_number, 1);
        assert_eq!(retry[0].deadline, now + secs(31) + secs(60));
    }

    #[test]
    fn exhausted_retries_fault_the_job_and_free_the_slot() {
        let h = Harness::new();
        let now = t0();
        let f = h.submit("render", 1, RetryPolicy::none(), now);
        let g = h.submit("render", 1, RetryPolicy::none(), now);
        h.drain(now);

        let work = h.take_work("render");
        assert_eq!(work.len(), 1);
        h.fault(&work[0], now + secs(2));

        let job = h.job(f);
        assert_eq!(job.status(), JobStatus::Faulted);
        assert_eq!(job.fault_reason(), Some("failure on retry 0"));
        assert_eq!(h.job(g).status(), JobStatus::Running);

        let notifications = h.notifications();
        assert!(matches!(
            notifications.as_slice(),
            [JobMessage::JobFaulted(n)] if n.job_id == f && n.attempts == 1
        ));
    }

    #[test]
    fn timed_out_attempt_is_retried_and_its_late_result_dropped() {
        let h = Harness::new();
        let now = t0();
        let e = JobId::new();
        h.submit_with(e, "slow", 1, RetryPolicy::immediate(1), 10, now);
        h.drain(now);

        let first = h.take_work("slow");
        assert_eq!(first[0].deadline, now + secs(10));

        h.advance_to(now + secs(11));
        let first_attempt = h.attempt(first[0].attempt_id);
        assert_eq!(first_attempt.status(), AttemptStatus::TimedOut);
        assert!(first_attempt.fault_reason().is_some_and(|r| r.contains("10000ms")));

        let retry = h.take_work("slow");
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].retry_number, 1);
        assert_eq!(h.job(e).active_attempt(), Some(retry[0].attempt_id));

        let late = h.complete(&first[0], now + secs(12));
        assert_eq!(late, vec![DispatchOutcome::Ignored]);
        assert_eq!(h.job(e).status(), JobStatus::Running);

        h.complete(&retry[0], now + secs(13));
        let job = h.job(e);
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.result(), Some(&json!({ "retry": 1 })));
    }

    #[test]
    fn duplicate_completion_is_idempotent() {
        let h = Harness::new();
        let now = t0();
        let job_id = h.submit("export", 1, RetryPolicy::none(), now);
        h.drain(now);

        let work = h.take_work("export");
        h.complete(&work[0], now + secs(1));
        let version = h.job_version(job_id);

        let duplicate = h.complete(&work[0], now + secs(2));
        assert_eq!(duplicate, vec![DispatchOutcome::Ignored]);
        assert_eq!(h.job_version(job_id), version);
        assert_eq!(h.job_type("export").running_count(), 0);
        assert_eq!(h.notifications().len(), 1);
    }

    #[test]
    fn duplicate_submission_creates_one_job() {
        let h = Harness::new();
        let now = t0();
        let job_id = JobId::new();
        h.submit_with(job_id, "export", 1, RetryPolicy::none(), 60, now);
        h.submit_with(job_id, "export", 1, RetryPolicy::none(), 60, now);
        h.drain(now);

        assert_eq!(h.take_work("export").len(), 1);
        assert_eq!(h.job_version(job_id), 2, "submitted, then granted");
        assert_eq!(h.job_type("export").running_count(), 1);
    }

    #[test]
    fn cancel_while_waiting_withdraws_the_request() {
        let h = Harness::new();
        let now = t0();
        let running = h.submit("export", 1, RetryPolicy::none(), now);
        let waiting = h.submit("export", 1, RetryPolicy::none(), now);
        h.drain(now);
        let work = h.take_work("export");

        h.cancel(waiting, now + secs(1));
        assert_eq!(h.job(waiting).status(), JobStatus::Canceled);
        assert!(h.job(waiting).attempt_ids().is_empty());
        let job_type = h.job_type("export");
        assert_eq!(job_type.pending_count(), 0);
        assert!(job_type.holds_slot(running));

        h.complete(&work[0], now + secs(2));
        assert_eq!(h.job_type("export").running_count(), 0);
        assert!(h.take_work("export").is_empty());

        let notifications = h.notifications();
        assert!(matches!(
            notifications.as_slice(),
            [JobMessage::JobCanceled(c), JobMessage::JobCompleted(_)]
                if c.job_id == waiting && c.reason.as_deref() == Some("operator request")
        ));
    }

    #[test]
    fn cancel_while_running_releases_the_slot_once() {
        let h = Harness::new();
        let now = t0();
        let j = h.submit("export", 1, RetryPolicy::immediate(3), now);
        let k = h.submit("export", 1, RetryPolicy::none(), now);
        h.drain(now);
        let work = h.take_work("export");
        let attempt_id = work[0].attempt_id;

        h.cancel(j, now + secs(1));
        assert_eq!(h.job(j).status(), JobStatus::Canceled);
        assert_eq!(h.attempt(attempt_id).status(), AttemptStatus::Canceled);
        assert!(!h.scheduler.is_pending(&ScheduleId::attempt_timeout(attempt_id)));
        assert_eq!(h.job(k).status(), JobStatus::Running);

        // The worker finishes after the cancellation: nothing changes.
        h.complete(&work[0], now + secs(2));
        h.fault(&work[0], now + secs(2));
        let job_type = h.job_type("export");
        assert_eq!(job_type.active_jobs(), &[k]);
        assert_eq!(h.job(j).attempt_ids().len(), 1);

        h.cancel(j, now + secs(3));
        assert_eq!(h.job_type("export").active_jobs(), &[k]);
    }

    #[test]
    fn attempt_canceled_before_its_start_is_delivered_never_runs() {
        let h = Harness::new();
        let now = t0();
        let j = h.submit("export", 1, RetryPolicy::none(), now);
        let k = h.submit("export", 1, RetryPolicy::none(), now);

        // j holds the slot, but its StartAttempt is still in flight.
        h.drain_except(&Endpoint::JobAttempt, now);
        let in_flight = h.take_queued(&Endpoint::JobAttempt);
        assert!(matches!(
            in_flight.as_slice(),
            [envelope] if matches!(envelope.message(), JobMessage::StartAttempt(s) if s.job_id == j)
        ));

        // The cancellation overtakes it; k gets the slot.
        h.cancel(j, now + secs(1));
        assert_eq!(h.job(j).status(), JobStatus::Canceled);
        let attempt_id = AttemptId::for_retry(j, 0);
        assert_eq!(h.attempt(attempt_id).status(), AttemptStatus::Canceled);

        for envelope in in_flight {
            h.bus.send(envelope).unwrap();
        }
        h.drain(now + secs(2));

        assert_eq!(h.attempt(attempt_id).status(), AttemptStatus::Canceled);
        assert!(!h.scheduler.is_pending(&ScheduleId::attempt_timeout(attempt_id)));
        let work = h.take_work("export");
        assert_eq!(work.iter().map(|w| w.job_id).collect::<Vec<_>>(), vec![k]);
        assert_eq!(h.job_type("export").active_jobs(), &[k]);
    }

    #[test]
    fn job_canceled_before_its_submission_is_handled_never_runs() {
        let h = Harness::new();
        let now = t0();
        let j = JobId::new();

        h.cancel(j, now);
        assert_eq!(h.job(j).status(), JobStatus::Canceled);

        h.submit_with(j, "export", 1, RetryPolicy::none(), 60, now + secs(1));
        h.drain(now + secs(1));

        let job = h.job(j);
        assert_eq!(job.status(), JobStatus::Canceled);
        assert!(job.attempt_ids().is_empty());
        assert!(h.repositories.job_types.load(&key("export")).unwrap().is_none());
        assert!(h.take_work("export").is_empty());
        assert!(matches!(
            h.notifications().as_slice(),
            [JobMessage::JobCanceled(c)] if c.job_id == j
        ));

        // The job type is unaffected for later submissions.
        let k = h.submit("export", 1, RetryPolicy::none(), now + secs(2));
        h.drain(now + secs(2));
        assert_eq!(h.job(k).status(), JobStatus::Running);
        assert_eq!(h.take_work("export").len(), 1);
    }

    #[test]
    fn limit_changes_grant_queued_jobs_without_preempting() {
        let h = Harness::new();
        let now = t0();
        let jobs: Vec<JobId> = (0..3)
            .map(|_| h.submit("export", 1, RetryPolicy::none(), now))
            .collect();
        h.drain(now);
        assert_eq!(h.take_work("export").len(), 1);

        let set_limit = |limit: u32| {
            h.send(
                Endpoint::JobType,
                JobMessage::SetConcurrentJobLimit(SetConcurrentJobLimit {
                    job_type: key("export"),
                    concurrent_job_limit: limit,
                }),
                now,
            );
            h.drain(now);
        };

        set_limit(3);
        assert_eq!(h.take_work("export").len(), 2);
        assert!(jobs.iter().all(|id| h.job(*id).status() == JobStatus::Running));

        set_limit(1);
        let job_type = h.job_type("export");
        assert_eq!(job_type.concurrent_job_limit(), 1);
        assert_eq!(job_type.running_count(), 3);

        let late = h.submit("export", 1, RetryPolicy::none(), now);
        h.drain(now);
        assert_eq!(h.job(late).status(), JobStatus::WaitingForSlot);
    }

    fn service_options() -> JobServiceOptions {
        JobServiceOptions::default()
            .with_default_retry_policy(RetryPolicy::none())
            .with_default_max_attempt_duration(Duration::from_secs(30))
            .with_poll_interval(Duration::from_millis(10))
            .with_scheduler_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn service_never_runs_more_jobs_than_the_limit() {
        let job_type = key("e2e.sleep");
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let options = service_options().with_worker_threads(4).with_job_type(
            &job_type,
            JobTypeOptions {
                concurrent_job_limit: Some(2),
                ..JobTypeOptions::default()
            },
        );

        let (running_h, peak_h) = (Arc::clone(&running), Arc::clone(&peak));
        let handle = JobService::new(options)
            .register_handler(job_type.clone(), move |ctx| {
                let now_running = running_h.fetch_add(1, Ordering::SeqCst) + 1;
                peak_h.fetch_max(now_running, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                running_h.fetch_sub(1, Ordering::SeqCst);
                JobOutcome::Completed(ctx.payload.clone())
            })
            .start()
            .unwrap();
        let client = handle.client().clone();

        let ids: Vec<JobId> = (0..6)
            .map(|n| client.submit(&job_type, json!({ "n": n })).unwrap())
            .collect();

        for (n, id) in ids.iter().enumerate() {
            let job = client
                .wait_for_terminal(*id, Duration::from_secs(10))
                .unwrap()
                .unwrap();
            assert_eq!(job.status(), JobStatus::Completed);
            assert_eq!(job.result(), Some(&json!({ "n": n })));
        }

        let stats = handle.consumer_stats();
        handle.shutdown();

        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak concurrency was {peak}");
        assert_eq!(stats.attempts_completed, 6);
    }

    #[test]
    fn worker_only_node_executes_jobs_for_a_state_machine_node() {
        let job_type = key("e2e.echo");
        let repositories = SagaRepositories::in_memory();
        let bus = InMemoryMessageBus::arc();
        let scheduler = InMemoryMessageScheduler::arc();

        let state_machines = JobService::new(service_options())
            .with_repositories(repositories.clone())
            .with_transport(bus.clone(), scheduler.clone())
            .start()
            .unwrap();

        let workers = JobService::new(service_options().with_host_state_machines(false))
            .with_repositories(repositories)
            .with_transport(bus, scheduler)
            .register_handler(job_type.clone(), |ctx| {
                if ctx.payload["fail"].as_bool().unwrap_or(false) {
                    JobOutcome::faulted("asked to fail")
                } else {
                    JobOutcome::completed()
                }
            })
            .start()
            .unwrap();

        let client = state_machines.client().clone();
        let ok = client.submit(&job_type, json!({ "fail": false })).unwrap();
        let bad = client.submit(&job_type, json!({ "fail": true })).unwrap();

        let ok = client.wait_for_terminal(ok, Duration::from_secs(10)).unwrap().unwrap();
        let bad = client.wait_for_terminal(bad, Duration::from_secs(10)).unwrap().unwrap();

        workers.shutdown();
        state_machines.shutdown();

        assert_eq!(ok.status(), JobStatus::Completed);
        assert_eq!(bad.status(), JobStatus::Faulted);
        assert_eq!(bad.fault_reason(), Some("asked to fail"));
    }
}
