//! Jobflow - job admission and workflow orchestration.
//!
//! A library for running asynchronous jobs across a cluster of hosts and for
//! driving multi-step workflows whose operations are backed by those jobs.
//!
//! # Core Concepts
//!
//! - **Job**: a unit of dispatched work tracked by a [`ServiceRegistry`]. Jobs
//!   move through [`JobStatus`] states from INSTANTIATED to a terminal state.
//!
//! - **Admission**: a [`JobProducer`] decides whether its host has capacity
//!   for a job using the [`LoadPolicy`], persists RUNNING, and hands the job
//!   to a detached runner that records the final state.
//!
//! - **Execution context**: runners and workflow tasks install an
//!   [`ExecutionContext`] (identity and current job) in a task-local scope.
//!
//! - **Workflows**: a [`WorkflowService`] advances [`WorkflowInstance`]s one
//!   operation at a time, applying each operation's [`RetryStrategy`] when
//!   its [`WorkflowOperationHandler`] fails.
//!
//! - **Events**: listeners ([`WorkflowListener`]) are called on every
//!   transition, and the same transitions are broadcast on a
//!   [`WorkflowEventBus`].
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use jobflow::*;
//!
//! let service = WorkflowServiceBuilder::new(WorkflowConfig::default())
//!     .with_registry(registry)
//!     .with_identity(identity)
//!     .with_incidents(incidents)
//!     .with_handler("inspect", Arc::new(InspectHandler))
//!     .build()?;
//!
//! let definition = WorkflowDefinition::new("publish")
//!     .with_operation(OperationDefinition::new("inspect"));
//! let workflow = service.start(&definition, MediaPackage::new("mp-1"), None, Default::default())?;
//! ```

/// Cooperative cancellation.
///
/// [`CancelToken`] is shared between a workflow task and the job barrier it
/// waits on, so stop and pause can interrupt a waiting operation.
pub mod cancel;

/// Configuration structures for producers and the workflow engine.
///
/// The `config` module defines [`ProducerConfig`] (with property-map
/// loading) and [`WorkflowConfig`].
pub mod config;

/// Task-scoped identity and job lineage.
pub mod context;

/// Error types for every layer: registry, identity, processing, admission,
/// operations and the workflow service.
pub mod error;

/// Workflow event publishing and subscription.
///
/// The `events` module provides [`WorkflowEvent`], the publisher and
/// subscriber traits, and [`WorkflowEventBus`] for in-process broadcasting.
pub mod events;

/// Identity directory seam used to resolve organizations and users.
pub mod identity;

/// Core job definitions.
///
/// The `job` module defines [`Job`], [`JobId`], [`JobStatus`] and the
/// [`NewJob`] creation request.
pub mod job;

/// Host load accounting and the admission load model.
///
/// The `load` module defines [`NodeLoad`], [`SystemLoad`], [`LoadPolicy`]
/// and failover host selection.
pub mod load;

#[cfg(feature = "metrics")]
/// Prometheus metrics, enabled by the `metrics` feature.
pub mod metrics;

/// Job admission and execution.
///
/// The `producer` module provides:
/// - [`JobProducer`] - admission controller for one job type
/// - [`JobProcessor`] - the work performed for each admitted job
/// - [`JobDispatcher`] and [`ProducerDispatcher`] - routing queued jobs to producers
pub mod producer;

/// Service registry and incident sink seams.
pub mod registry;

/// Tracing spans and metric recording helpers.
pub mod telemetry;

/// Workflow engine.
///
/// The `workflow` module provides:
/// - [`WorkflowDefinition`] and [`OperationDefinition`] - what to run
/// - [`WorkflowService`] and [`WorkflowServiceBuilder`] - running it
/// - [`WorkflowOperationHandler`] and [`OperationContext`] - operation implementations
/// - [`WorkflowQuery`] and [`WorkflowSet`] - searching instances
/// - [`WorkflowListener`] and [`WorkflowStateListener`] - observing transitions
pub mod workflow;

pub use cancel::*;
pub use config::*;
pub use context::*;
pub use error::*;
pub use events::*;
pub use identity::*;
pub use job::*;
pub use load::*;
pub use producer::*;
pub use registry::*;
pub use workflow::*;
