use serde::{Deserialize, Serialize};

use super::instance::{WorkflowId, WorkflowInstance, WorkflowState};

/// Filter and page over stored workflow instances.
///
/// All set criteria must match. Results are ordered by creation time, then
/// id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowQuery {
    pub id: Option<WorkflowId>,
    pub media_package: Option<String>,
    /// Template of the current operation.
    pub current_operation: Option<String>,
    pub creator: Option<String>,
    pub organization: Option<String>,
    /// Case-insensitive substring of the media package's text fields.
    pub text: Option<String>,
    /// Match any of these states; empty matches all.
    pub states: Vec<WorkflowState>,
    pub not_states: Vec<WorkflowState>,
    /// Page size; `None` returns every match.
    pub count: Option<usize>,
    /// Zero-based page index.
    pub start_page: usize,
}

impl WorkflowQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: WorkflowId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_media_package(mut self, id: impl Into<String>) -> Self {
        self.media_package = Some(id.into());
        self
    }

    pub fn with_current_operation(mut self, template: impl Into<String>) -> Self {
        self.current_operation = Some(template.into());
        self
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_state(mut self, state: WorkflowState) -> Self {
        self.states.push(state);
        self
    }

    pub fn without_state(mut self, state: WorkflowState) -> Self {
        self.not_states.push(state);
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_start_page(mut self, page: usize) -> Self {
        self.start_page = page;
        self
    }

    pub fn matches(&self, workflow: &WorkflowInstance) -> bool {
        if self.id.is_some_and(|id| id != workflow.id) {
            return false;
        }
        if self
            .media_package
            .as_ref()
            .is_some_and(|mp| *mp != workflow.media_package.id)
        {
            return false;
        }
        if let Some(template) = &self.current_operation {
            match workflow.current_operation() {
                Some(op) if op.template == *template => {}
                _ => return false,
            }
        }
        if self.creator.as_ref().is_some_and(|c| *c != workflow.creator) {
            return false;
        }
        if self
            .organization
            .as_ref()
            .is_some_and(|o| *o != workflow.organization)
        {
            return false;
        }
        if !self.states.is_empty() && !self.states.contains(&workflow.state) {
            return false;
        }
        if self.not_states.contains(&workflow.state) {
            return false;
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let found = workflow
                .media_package
                .text_fields()
                .chain(workflow.title.as_deref())
                .any(|field| field.to_lowercase().contains(&needle));
            if !found {
                return false;
            }
        }
        true
    }
}

/// One page of query results.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSet {
    pub items: Vec<WorkflowInstance>,
    /// Matches across all pages.
    pub total_count: usize,
    pub start_page: usize,
    pub page_size: Option<usize>,
}

impl WorkflowSet {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Page `query` over `matches`, which must already be filtered.
    pub(crate) fn page(mut matches: Vec<WorkflowInstance>, query: &WorkflowQuery) -> Self {
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let total_count = matches.len();

        let items = match query.count {
            Some(count) => matches
                .into_iter()
                .skip(query.start_page.saturating_mul(count))
                .take(count)
                .collect(),
            None => matches,
        };

        Self {
            items,
            total_count,
            start_page: query.start_page,
            page_size: query.count,
        }
    }
}

/// Per-state workflow counts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatistics {
    pub total: usize,
    pub instantiated: usize,
    pub running: usize,
    pub paused: usize,
    pub stopped: usize,
    pub succeeded: usize,
    pub failing: usize,
    pub failed: usize,
}

impl WorkflowStatistics {
    pub(crate) fn record(&mut self, state: WorkflowState) {
        self.total += 1;
        match state {
            WorkflowState::Instantiated => self.instantiated += 1,
            WorkflowState::Running => self.running += 1,
            WorkflowState::Paused => self.paused += 1,
            WorkflowState::Stopped => self.stopped += 1,
            WorkflowState::Succeeded => self.succeeded += 1,
            WorkflowState::Failing => self.failing += 1,
            WorkflowState::Failed => self.failed += 1,
        }
    }

    pub fn get(&self, state: WorkflowState) -> usize {
        match state {
            WorkflowState::Instantiated => self.instantiated,
            WorkflowState::Running => self.running,
            WorkflowState::Paused => self.paused,
            WorkflowState::Stopped => self.stopped,
            WorkflowState::Succeeded => self.succeeded,
            WorkflowState::Failing => self.failing,
            WorkflowState::Failed => self.failed,
        }
    }
}
