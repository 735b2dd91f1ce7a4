//! Benchmarks for admission and workflow advancement using criterion.
//!
//! These benchmarks measure:
//! - The load decision alone
//! - A producer's admission check against the in-memory registry
//! - Dispatching and running a job to completion
//! - Running a short workflow end to end

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use jobflow::*;
use jobflow_testkit::{
    InMemoryServiceRegistry, RecordingIncidentSink, RecordingProcessor, StaticIdentityDirectory,
    SucceedingHandler,
};
use tokio::runtime::Runtime;

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn producer(registry: &InMemoryServiceRegistry) -> JobProducer<RecordingProcessor> {
    JobProducer::new(
        "encode",
        ProducerConfig::default(),
        Arc::new(registry.clone()),
        Arc::new(StaticIdentityDirectory::permissive()),
        Arc::new(RecordingIncidentSink::new()),
        Arc::new(RecordingProcessor::new()),
    )
}

/// Benchmark: the load decision.
fn bench_can_accept(c: &mut Criterion) {
    let policy = LoadPolicy::default();

    c.bench_function("can_accept", |b| {
        b.iter(|| {
            policy.can_accept(
                black_box(3.5),
                black_box(1.0),
                black_box(4.0),
                black_box(true),
            )
        })
    });
}

/// Benchmark: admission check with a growing number of active jobs.
fn bench_is_ready_to_accept(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("is_ready_to_accept");
    for active in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(active), &active, |b, &active| {
            let registry = InMemoryServiceRegistry::new("worker-1");
            for _ in 0..active {
                let mut job = Job::new("encode", "PROCESS", Vec::new(), 0.001);
                job.status = JobStatus::Running;
                job.processing_host = Some("worker-1".to_string());
                registry.insert_job(job);
            }
            let producer = producer(&registry);
            let job = Job::new("encode", "PROCESS", Vec::new(), 1.0);

            b.to_async(&rt).iter(|| async {
                producer
                    .is_ready_to_accept(&job)
                    .await
                    .expect("admission check should succeed")
            });
        });
    }
    group.finish();
}

/// Benchmark: dispatch a queued job and wait for its runner.
fn bench_dispatch_and_run(c: &mut Criterion) {
    let rt = create_runtime();

    c.bench_function("dispatch_and_run", |b| {
        let registry = InMemoryServiceRegistry::new("worker-1");
        let producer = producer(&registry);

        b.to_async(&rt).iter(|| async {
            let mut job = registry
                .create_job(NewJob::new("encode", "PROCESS", Vec::new(), 1.0))
                .await
                .expect("create should succeed");
            job.set_status(JobStatus::Dispatching);
            let job = registry.update_job(job).await.expect("update should succeed");
            producer
                .accept_job(job)
                .await
                .expect("admission should succeed")
                .await
                .expect("runner should not panic")
                .expect("runner should succeed");
        });
    });
}

/// Benchmark: a three step workflow from start to SUCCEEDED.
fn bench_workflow(c: &mut Criterion) {
    let rt = create_runtime();

    c.bench_function("workflow_three_steps", |b| {
        let service = WorkflowServiceBuilder::new(WorkflowConfig::default().with_poll_interval(1))
            .with_registry(Arc::new(InMemoryServiceRegistry::new("worker-1")))
            .with_identity(Arc::new(StaticIdentityDirectory::permissive()))
            .with_incidents(Arc::new(RecordingIncidentSink::new()))
            .with_handler("step", Arc::new(SucceedingHandler::new()))
            .build()
            .expect("service should build");
        let listener = Arc::new(WorkflowStateListener::terminal());
        service.add_listener(listener.clone());
        let definition = (0..3).fold(WorkflowDefinition::new("bench"), |def, _| {
            def.with_operation(OperationDefinition::new("step"))
        });

        b.to_async(&rt).iter(|| async {
            let id = service
                .start(&definition, MediaPackage::new("mp"), None, BTreeMap::new())
                .expect("start should succeed")
                .id;
            listener
                .wait_for(id, Duration::from_secs(5))
                .await
                .expect("workflow should finish");
        });
    });
}

criterion_group!(
    benches,
    bench_can_accept,
    bench_is_ready_to_accept,
    bench_dispatch_and_run,
    bench_workflow
);
criterion_main!(benches);
