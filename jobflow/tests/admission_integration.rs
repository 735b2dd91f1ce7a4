//! Admission and runner integration tests.
//!
//! Covers the load decision, the RUNNING hand-off, the runner's execution
//! context and how it reconciles final job states and incidents.

use std::sync::Arc;
use std::time::Duration;

use jobflow::*;
use jobflow_testkit::{
    FailingProcessor, GatedProcessor, InMemoryServiceRegistry, RecordingIncidentSink,
    RecordingProcessor, StaticIdentityDirectory,
};
use tokio::time::timeout;

const HOST: &str = "worker-1";

struct Harness {
    registry: InMemoryServiceRegistry,
    identity: StaticIdentityDirectory,
    incidents: RecordingIncidentSink,
}

impl Harness {
    fn new() -> Self {
        Self {
            registry: InMemoryServiceRegistry::new(HOST),
            identity: StaticIdentityDirectory::permissive(),
            incidents: RecordingIncidentSink::new(),
        }
    }

    fn producer<P: JobProcessor>(&self, job_type: &str, processor: P) -> JobProducer<P> {
        self.producer_with(job_type, ProducerConfig::default(), processor)
    }

    fn producer_with<P: JobProcessor>(
        &self,
        job_type: &str,
        config: ProducerConfig,
        processor: P,
    ) -> JobProducer<P> {
        JobProducer::new(
            job_type,
            config,
            Arc::new(self.registry.clone()),
            Arc::new(self.identity.clone()),
            Arc::new(self.incidents.clone()),
            Arc::new(processor),
        )
    }

    /// Create a job and mark it DISPATCHING on `host`.
    async fn dispatching_job(&self, job_type: &str, load: f32, host: &str) -> Job {
        let mut job = self
            .registry
            .create_job(NewJob::new(job_type, "PROCESS", vec!["mp-1".into()], load))
            .await
            .unwrap();
        job.set_status(JobStatus::Dispatching);
        job.processing_host = Some(host.to_string());
        self.registry.update_job(job).await.unwrap()
    }
}

async fn join(handle: RunnerHandle) -> Result<(), RegistryError> {
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("runner did not finish")
        .expect("runner panicked")
}

#[tokio::test]
async fn test_foreign_job_type_is_declined() {
    let harness = Harness::new();
    let producer = harness.producer("encode", RecordingProcessor::new());
    let job = harness.dispatching_job("compose", 1.0, HOST).await;

    assert!(!producer.is_ready_to_accept(&job).await.unwrap());
}

#[tokio::test]
async fn test_admission_follows_host_load() {
    let harness = Harness::new();
    let producer = harness.producer("encode", RecordingProcessor::new());
    let job = harness.dispatching_job("encode", 1.0, HOST).await;

    // 3.0 + 1.0 reaches the maximum of 4.0 exactly.
    harness.registry.set_base_load(HOST, 3.0);
    assert!(producer.is_ready_to_accept(&job).await.unwrap());

    harness.registry.set_base_load(HOST, 3.5);
    assert!(!producer.is_ready_to_accept(&job).await.unwrap());
}

#[tokio::test]
async fn test_oversized_job_forgiven_only_when_configured() {
    let harness = Harness::new();
    let job = harness.dispatching_job("encode", 6.0, HOST).await;

    let lenient = harness.producer("encode", RecordingProcessor::new());
    assert!(lenient.is_ready_to_accept(&job).await.unwrap());

    let config = ProducerConfig {
        accept_exceeding_max_load: false,
        ..ProducerConfig::default()
    };
    let strict = harness.producer_with("encode", config, RecordingProcessor::new());
    assert!(!strict.is_ready_to_accept(&job).await.unwrap());
}

#[tokio::test]
async fn test_unknown_host_is_an_error() {
    let harness = Harness::new();
    let producer = harness.producer_with(
        "encode",
        ProducerConfig::default().with_host("worker-9"),
        RecordingProcessor::new(),
    );
    let job = harness.dispatching_job("encode", 1.0, "worker-9").await;

    let err = producer.is_ready_to_accept(&job).await.unwrap_err();
    assert!(matches!(err, RegistryError::HostNotFound(host) if host == "worker-9"));
}

#[tokio::test]
async fn test_running_is_persisted_before_processing() {
    let harness = Harness::new();
    let processor = RecordingProcessor::new().with_payload("done");
    let producer = harness.producer("encode", processor.clone());
    let job = harness.dispatching_job("encode", 1.0, HOST).await;

    join(producer.accept_job(job.clone()).await.unwrap())
        .await
        .unwrap();

    let calls = processor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].status, JobStatus::Running);
    assert_eq!(calls[0].processing_host.as_deref(), Some(HOST));

    let stored = harness.registry.job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Finished);
    assert_eq!(stored.payload.as_deref(), Some("done"));
    assert!(stored.started_at.is_some());
    assert!(stored.completed_at.is_some());
    assert_eq!(harness.incidents.count(), 0);
}

#[tokio::test]
async fn test_persist_failure_does_not_start_runner() {
    let harness = Harness::new();
    let processor = RecordingProcessor::new();
    let producer = harness.producer("encode", processor.clone());
    let job = harness.dispatching_job("encode", 1.0, HOST).await;

    harness.registry.fail_next_updates(1);
    let err = producer.accept_job(job.clone()).await.unwrap_err();

    assert!(matches!(err, AdmissionError::PersistRunning { job_id, .. } if job_id == job.id));
    tokio::time::sleep(Duration::from_millis(20)).await;
    processor.assert_processed_count_eq(0);
    assert_eq!(
        harness.registry.job(job.id).unwrap().status,
        JobStatus::Dispatching
    );
}

#[tokio::test]
async fn test_runner_installs_job_context() {
    let harness = Harness::new();
    let processor = RecordingProcessor::new();
    let producer = harness.producer("encode", processor.clone());

    let parent = JobId::new();
    let submitter = ExecutionContext::new(
        Organization::new("default", "Default"),
        User::new("admin", "default"),
    )
    .with_current_job(Some(parent));

    let handle = submitter
        .scope(async {
            let job = harness.dispatching_job("encode", 1.0, HOST).await;
            producer.accept_job(job).await.unwrap()
        })
        .await;
    join(handle).await.unwrap();

    let calls = processor.calls();
    let ctx = calls[0].context.clone().expect("context installed");
    assert_eq!(ctx.user.username, "admin");
    assert_eq!(ctx.organization.id, "default");
    assert_eq!(ctx.current_job, Some(calls[0].job_id));
    assert_eq!(ctx.submitted_by, Some(parent));

    // Created inside the submitter's scope, so the job is a child of it.
    let stored = harness.registry.job(calls[0].job_id).unwrap();
    assert_eq!(stored.parent_job_id, Some(parent));
    assert_eq!(stored.creator, "admin");

    assert!(ExecutionContext::current().is_none());
}

#[tokio::test]
async fn test_failure_marks_job_failed_and_reports_incident() {
    let harness = Harness::new();
    let producer = harness.producer("encode", FailingProcessor::with_message("codec crashed"));
    let job = harness.dispatching_job("encode", 1.0, HOST).await;

    join(producer.accept_job(job.clone()).await.unwrap())
        .await
        .unwrap();

    assert_eq!(harness.registry.job(job.id).unwrap().status, JobStatus::Failed);
    let incidents = harness.incidents.incidents();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].job_id, job.id);
    assert_eq!(incidents[0].job_status, JobStatus::Failed);
    assert_eq!(incidents[0].severity, Severity::Failure);
    assert!(incidents[0].message.contains("codec crashed"));
}

#[tokio::test]
async fn test_registry_failure_in_processor_propagates() {
    let harness = Harness::new();
    let producer = harness.producer("encode", FailingProcessor::registry_unavailable());
    let job = harness.dispatching_job("encode", 1.0, HOST).await;

    let result = join(producer.accept_job(job.clone()).await.unwrap()).await;

    assert!(matches!(result, Err(RegistryError::Unavailable(_))));
    assert_eq!(harness.registry.job(job.id).unwrap().status, JobStatus::Failed);
    assert_eq!(harness.incidents.count_severity(Severity::Failure), 1);
}

#[tokio::test]
async fn test_cancellation_is_left_to_the_canceller() {
    let harness = Harness::new();
    let registry: Arc<dyn ServiceRegistry> = Arc::new(harness.registry.clone());
    let processor = GatedProcessor::new(Arc::clone(&registry));
    let producer = harness.producer("encode", processor.clone());
    let job = harness.dispatching_job("encode", 1.0, HOST).await;

    let handle = producer.accept_job(job.clone()).await.unwrap();
    while processor.started().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(cancel_job(registry.as_ref(), job.id).await.unwrap());
    processor.release();
    join(handle).await.unwrap();

    assert_eq!(harness.registry.job(job.id).unwrap().status, JobStatus::Canceled);
    assert_eq!(harness.incidents.count(), 0);
}

#[tokio::test]
async fn test_success_keeps_state_set_while_running() {
    let harness = Harness::new();
    let producer = harness.producer(
        "encode",
        RecordingProcessor::new()
            .with_payload("late")
            .with_delay(Duration::from_millis(50)),
    );
    let job = harness.dispatching_job("encode", 1.0, HOST).await;

    let handle = producer.accept_job(job.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel_job(&harness.registry, job.id).await.unwrap();
    join(handle).await.unwrap();

    let stored = harness.registry.job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Canceled);
    assert!(stored.payload.is_none());
}

#[tokio::test]
async fn test_unresolvable_identity_fails_job() {
    let mut harness = Harness::new();
    harness.identity =
        StaticIdentityDirectory::new().with_organization(Organization::new("default", "Default"));
    let processor = RecordingProcessor::new();
    let producer = harness.producer("encode", processor.clone());
    let job = harness.dispatching_job("encode", 1.0, HOST).await;

    join(producer.accept_job(job.clone()).await.unwrap())
        .await
        .unwrap();

    processor.assert_processed_count_eq(0);
    assert_eq!(harness.registry.job(job.id).unwrap().status, JobStatus::Failed);
    assert!(harness.incidents.incidents()[0].message.contains("system"));
}

#[tokio::test]
async fn test_count_jobs_by_status() {
    let harness = Harness::new();
    let producer = harness.producer("encode", RecordingProcessor::new());
    harness.dispatching_job("encode", 1.0, HOST).await;
    harness.dispatching_job("encode", 1.0, HOST).await;
    harness.dispatching_job("compose", 1.0, HOST).await;

    assert_eq!(producer.count_jobs(JobStatus::Dispatching).await.unwrap(), 2);
    assert_eq!(producer.count_jobs(JobStatus::Running).await.unwrap(), 0);
}

mod dispatch {
    use super::*;

    fn dispatcher(harness: &Harness, hosts: &[&str]) -> (ProducerDispatcher, RecordingProcessor) {
        let processor = RecordingProcessor::new();
        let dispatcher = ProducerDispatcher::new(Arc::new(harness.registry.clone()));
        for host in hosts {
            harness.registry.register_host(*host, 4.0);
            dispatcher.register(Arc::new(harness.producer_with(
                "encode",
                ProducerConfig::default().with_host(*host),
                processor.clone(),
            )));
        }
        (dispatcher, processor)
    }

    async fn queued_job(harness: &Harness, load: f32) -> Job {
        let mut job = harness
            .registry
            .create_job(NewJob::new("encode", "PROCESS", Vec::new(), load))
            .await
            .unwrap();
        job.set_status(JobStatus::Queued);
        harness.registry.update_job(job).await.unwrap()
    }

    #[tokio::test]
    async fn test_least_loaded_host_wins() {
        let harness = Harness::new();
        let (dispatcher, processor) = dispatcher(&harness, &["worker-a", "worker-b"]);
        harness.registry.set_base_load("worker-a", 2.0);
        let job = queued_job(&harness, 1.0).await;

        let status = dispatcher.dispatch(job.clone(), None).await.unwrap();

        assert_eq!(
            status,
            DispatchStatus::Accepted {
                host: "worker-b".to_string()
            }
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(processor.calls()[0].processing_host.as_deref(), Some("worker-b"));
    }

    #[tokio::test]
    async fn test_preferred_host_restricts_candidates() {
        let harness = Harness::new();
        let (dispatcher, _) = dispatcher(&harness, &["worker-a", "worker-b"]);
        harness.registry.set_base_load("worker-a", 2.0);
        let job = queued_job(&harness, 1.0).await;

        let status = dispatcher.dispatch(job, Some("worker-a")).await.unwrap();

        assert_eq!(
            status,
            DispatchStatus::Accepted {
                host: "worker-a".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_declined_job_returns_to_queue() {
        let harness = Harness::new();
        let (dispatcher, processor) = dispatcher(&harness, &["worker-a"]);
        harness.registry.set_base_load("worker-a", 4.0);
        let job = queued_job(&harness, 1.0).await;

        let status = dispatcher.dispatch(job.clone(), None).await.unwrap();

        assert_eq!(status, DispatchStatus::Declined);
        let stored = harness.registry.job(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert!(stored.processing_host.is_none());
        processor.assert_processed_count_eq(0);
    }

    /// Producer whose RUNNING write is rejected by the registry.
    struct BrokenHandoff {
        inner: Arc<dyn JobAdmission>,
        registry: InMemoryServiceRegistry,
    }

    #[async_trait::async_trait]
    impl JobAdmission for BrokenHandoff {
        fn job_type(&self) -> &str {
            self.inner.job_type()
        }

        fn host(&self) -> String {
            self.inner.host()
        }

        async fn is_ready_to_accept(&self, job: &Job) -> Result<bool, RegistryError> {
            let ready = self.inner.is_ready_to_accept(job).await?;
            self.registry.fail_next_updates(1);
            Ok(ready)
        }

        async fn admit(&self, job: Job) -> Result<(), AdmissionError> {
            self.inner.admit(job).await
        }
    }

    #[tokio::test]
    async fn test_failed_admission_returns_job_to_queue() {
        let harness = Harness::new();
        harness.registry.register_host("worker-a", 4.0);
        let processor = RecordingProcessor::new();
        let producer: Arc<dyn JobAdmission> = Arc::new(harness.producer_with(
            "encode",
            ProducerConfig::default().with_host("worker-a"),
            processor.clone(),
        ));
        let dispatcher = ProducerDispatcher::new(Arc::new(harness.registry.clone()));
        dispatcher.register(Arc::new(BrokenHandoff {
            inner: Arc::clone(&producer),
            registry: harness.registry.clone(),
        }));
        let job = queued_job(&harness, 1.0).await;

        let err = dispatcher.dispatch(job.clone(), None).await.unwrap_err();

        assert!(matches!(err, AdmissionError::PersistRunning { .. }));
        let stored = harness.registry.job(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert!(stored.processing_host.is_none());
        processor.assert_processed_count_eq(0);

        let retry = ProducerDispatcher::new(Arc::new(harness.registry.clone()));
        retry.register(producer);
        let status = retry.dispatch(stored, None).await.unwrap();
        assert_eq!(
            status,
            DispatchStatus::Accepted {
                host: "worker-a".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_type_is_undispatchable() {
        let harness = Harness::new();
        let (dispatcher, _) = dispatcher(&harness, &["worker-a"]);
        let mut job = harness
            .registry
            .create_job(NewJob::new("compose", "PROCESS", Vec::new(), 1.0))
            .await
            .unwrap();
        job.set_status(JobStatus::Queued);
        let job = harness.registry.update_job(job).await.unwrap();

        let status = dispatcher.dispatch(job.clone(), None).await.unwrap();

        assert_eq!(status, DispatchStatus::Undispatchable);
        assert_eq!(harness.registry.job(job.id).unwrap().status, JobStatus::Queued);
    }
}
