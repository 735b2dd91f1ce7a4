use std::fmt;
use std::sync::Arc;

use crate::config::WorkflowConfig;
use crate::identity::IdentityDirectory;
use crate::producer::JobDispatcher;
use crate::registry::{IncidentSink, ServiceRegistry};

use super::handler::{
    ERROR_RESOLUTION_HANDLER_ID, ErrorResolutionHandler, HandlerRegistry, WorkflowOperationHandler,
};
use super::service::WorkflowService;

/// Builder for constructing a [`WorkflowService`] with explicit dependencies.
///
/// The registry, identity directory and incident sink are required. The
/// dispatcher is optional; without one, jobs dispatched by handlers stay
/// queued until something else routes them. A handler for
/// [`ERROR_RESOLUTION_HANDLER_ID`] is installed unless one is supplied.
///
/// # Example
///
/// ```ignore
/// use jobflow::*;
///
/// let service = WorkflowServiceBuilder::new(WorkflowConfig::default())
///     .with_registry(registry)
///     .with_identity(identity)
///     .with_incidents(incidents)
///     .with_dispatcher(dispatcher)
///     .with_handler("inspect", Arc::new(InspectHandler))
///     .build()?;
/// ```
pub struct WorkflowServiceBuilder {
    config: WorkflowConfig,
    registry: Option<Arc<dyn ServiceRegistry>>,
    identity: Option<Arc<dyn IdentityDirectory>>,
    incidents: Option<Arc<dyn IncidentSink>>,
    dispatcher: Option<Arc<dyn JobDispatcher>>,
    handlers: HandlerRegistry,
}

impl fmt::Debug for WorkflowServiceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowServiceBuilder")
            .field("config", &self.config)
            .field("registry_set", &self.registry.is_some())
            .field("identity_set", &self.identity.is_some())
            .field("incidents_set", &self.incidents.is_some())
            .field("dispatcher_set", &self.dispatcher.is_some())
            .field("handlers", &self.handlers)
            .finish()
    }
}

impl WorkflowServiceBuilder {
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            config,
            registry: None,
            identity: None,
            incidents: None,
            dispatcher: None,
            handlers: HandlerRegistry::new(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityDirectory>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_incidents(mut self, incidents: Arc<dyn IncidentSink>) -> Self {
        self.incidents = Some(incidents);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn JobDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Register the handler for an operation template.
    pub fn with_handler(
        self,
        template: impl Into<String>,
        handler: Arc<dyn WorkflowOperationHandler>,
    ) -> Self {
        self.handlers.register(template, handler);
        self
    }

    /// Build the `WorkflowService` with all configured dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if any required dependency is missing.
    pub fn build(self) -> anyhow::Result<WorkflowService> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry dependency missing"))?;
        let identity = self
            .identity
            .ok_or_else(|| anyhow::anyhow!("identity dependency missing"))?;
        let incidents = self
            .incidents
            .ok_or_else(|| anyhow::anyhow!("incidents dependency missing"))?;
        if self.config.event_channel_capacity == 0 {
            anyhow::bail!("event_channel_capacity must be greater than zero");
        }

        if !self.handlers.contains(ERROR_RESOLUTION_HANDLER_ID) {
            self.handlers
                .register(ERROR_RESOLUTION_HANDLER_ID, Arc::new(ErrorResolutionHandler));
        }

        Ok(WorkflowService::new(
            self.config,
            registry,
            identity,
            incidents,
            self.dispatcher,
            self.handlers,
        ))
    }
}
