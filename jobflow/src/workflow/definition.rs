use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::instance::UNBOUNDED_ATTEMPTS;

/// What the engine does when an operation fails.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Fail the operation.
    #[default]
    None,
    /// Run the operation again in place.
    Retry,
    /// Pause the workflow behind an error-resolution step until an operator
    /// resumes it.
    Hold,
    /// Run the operation again on a different host.
    Failover,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::None => "none",
            RetryStrategy::Retry => "retry",
            RetryStrategy::Hold => "hold",
            RetryStrategy::Failover => "failover",
        }
    }

    /// Attempts allowed when a definition does not set its own.
    pub fn default_max_attempts(&self) -> i32 {
        match self {
            RetryStrategy::None => 1,
            RetryStrategy::Retry | RetryStrategy::Failover => 2,
            RetryStrategy::Hold => UNBOUNDED_ATTEMPTS,
        }
    }
}

impl Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(RetryStrategy::None),
            "retry" => Ok(RetryStrategy::Retry),
            "hold" => Ok(RetryStrategy::Hold),
            "failover" => Ok(RetryStrategy::Failover),
            other => Err(anyhow::anyhow!("unknown retry strategy: {other}")),
        }
    }
}

/// Template of a single workflow step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationDefinition {
    /// Handler template name.
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub retry_strategy: RetryStrategy,
    /// Overrides [`RetryStrategy::default_max_attempts`]. HOLD ignores it.
    #[serde(default)]
    pub max_attempts: Option<i32>,
    #[serde(default = "default_fail_on_error")]
    pub fail_on_error: bool,
    /// Definition spliced in after this operation when it fails.
    #[serde(default)]
    pub exception_handler_workflow: Option<String>,
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
}

fn default_fail_on_error() -> bool {
    true
}

impl OperationDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            retry_strategy: RetryStrategy::None,
            max_attempts: None,
            fail_on_error: true,
            exception_handler_workflow: None,
            configuration: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    pub fn with_max_attempts(mut self, attempts: i32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_fail_on_error(mut self, fail: bool) -> Self {
        self.fail_on_error = fail;
        self
    }

    pub fn with_exception_handler(mut self, definition_id: impl Into<String>) -> Self {
        self.exception_handler_workflow = Some(definition_id.into());
        self
    }

    pub fn with_configuration(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }

    /// Attempts granted to instances of this operation.
    pub fn effective_max_attempts(&self) -> i32 {
        match (self.retry_strategy, self.max_attempts) {
            (RetryStrategy::Hold, _) => UNBOUNDED_ATTEMPTS,
            (_, Some(attempts)) if attempts == UNBOUNDED_ATTEMPTS || attempts >= 1 => attempts,
            (strategy, _) => strategy.default_max_attempts(),
        }
    }
}

/// An ordered list of operations that can be started as a workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub operations: Vec<OperationDefinition>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            description: None,
            operations: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_operation(mut self, operation: OperationDefinition) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn templates(&self) -> impl Iterator<Item = &str> {
        self.operations.iter().map(|op| op.id.as_str())
    }
}
