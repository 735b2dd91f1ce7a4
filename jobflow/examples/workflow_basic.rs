//! Basic workflow example with in-memory collaborators.
//!
//! Registers an `encode` producer on two hosts, then runs a workflow whose
//! first operation dispatches an encode job and whose second operation is
//! flaky and retried once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobflow::*;
use jobflow_testkit::{
    FlakyHandler, InMemoryServiceRegistry, RecordingIncidentSink, StaticIdentityDirectory,
};

/// Pretends to encode the media package named in the job arguments.
struct EncodeProcessor;

#[async_trait]
impl JobProcessor for EncodeProcessor {
    async fn process(&self, job: &Job) -> Result<Option<String>, ProcessingError> {
        let user = ExecutionContext::current()
            .map(|ctx| ctx.user.username)
            .unwrap_or_default();
        println!(
            "[PRODUCER] encoding {:?} on {} as {}",
            job.arguments,
            job.processing_host.as_deref().unwrap_or("?"),
            user
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Some(format!("encoded:{}", job.arguments.join(","))))
    }
}

/// Dispatches one encode job for the workflow's media package.
struct EncodeHandler;

#[async_trait]
impl WorkflowOperationHandler for EncodeHandler {
    async fn start(
        &self,
        workflow: &WorkflowInstance,
        ctx: &OperationContext,
    ) -> Result<OperationResult, OperationError> {
        let job = ctx
            .dispatch_and_wait("encode", "ENCODE", vec![workflow.media_package.id.clone()], 1.0)
            .await?;
        Ok(OperationResult::proceed()
            .with_property("encode.payload", job.payload.unwrap_or_default()))
    }
}

struct PrintingListener;

impl WorkflowListener for PrintingListener {
    fn state_changed(&self, workflow: &WorkflowInstance) {
        println!("[WORKFLOW] {} -> {}", workflow.id, workflow.state);
    }

    fn operation_changed(
        &self,
        _workflow: &WorkflowInstance,
        operation: &WorkflowOperationInstance,
    ) {
        println!("[OPERATION] {} -> {}", operation.template, operation.state);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let registry = InMemoryServiceRegistry::new("worker-1").with_host("worker-2", 2.0);
    let shared: Arc<dyn ServiceRegistry> = Arc::new(registry.clone());
    let identity: Arc<dyn IdentityDirectory> = Arc::new(StaticIdentityDirectory::permissive());
    let incidents = RecordingIncidentSink::new();

    let dispatcher = Arc::new(ProducerDispatcher::new(Arc::clone(&shared)));
    for host in ["worker-1", "worker-2"] {
        dispatcher.register(Arc::new(JobProducer::new(
            "encode",
            ProducerConfig::default().with_host(host),
            Arc::clone(&shared),
            Arc::clone(&identity),
            Arc::new(incidents.clone()),
            Arc::new(EncodeProcessor),
        )));
    }

    let service = WorkflowServiceBuilder::new(WorkflowConfig::default().with_poll_interval(20))
        .with_registry(Arc::clone(&shared))
        .with_identity(identity)
        .with_incidents(Arc::new(incidents.clone()))
        .with_dispatcher(dispatcher)
        .with_handler("encode", Arc::new(EncodeHandler))
        .with_handler("publish", Arc::new(FlakyHandler::failing_times(1)))
        .build()?;

    let terminal = Arc::new(WorkflowStateListener::terminal());
    service.add_listener(terminal.clone());
    service.add_listener(Arc::new(PrintingListener));

    let definition = WorkflowDefinition::new("encode-and-publish")
        .with_title("Encode and publish")
        .with_operation(OperationDefinition::new("encode"))
        .with_operation(
            OperationDefinition::new("publish")
                .with_retry_strategy(RetryStrategy::Retry)
                .with_max_attempts(2),
        );
    service.register_definition(definition)?;

    let media_package = MediaPackage::new("mp-42").with_title("Lecture 42");
    let workflow = service.start_by_id("encode-and-publish", media_package, BTreeMap::new())?;

    match terminal.wait_for(workflow.id, Duration::from_secs(10)).await {
        Some(state) => println!("[MAIN] workflow ended {state}"),
        None => anyhow::bail!("workflow {} did not finish", workflow.id),
    }

    let workflow = service.get_workflow_by_id(workflow.id)?;
    println!(
        "[MAIN] payload: {}",
        workflow.configuration("encode.payload").unwrap_or("none")
    );
    println!("[MAIN] incidents: {}", incidents.count());
    println!("[MAIN] jobs in registry: {}", registry.job_count());
    Ok(())
}
