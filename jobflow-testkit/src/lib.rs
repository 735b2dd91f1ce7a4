//! In-memory collaborators and test doubles for exercising jobflow.

mod handlers;
mod identity;
mod mock;
mod processor;
mod registry;

pub use handlers::*;
pub use identity::StaticIdentityDirectory;
pub use mock::{DispatchRecord, MockDispatcher};
pub use processor::*;
pub use registry::{InMemoryServiceRegistry, Incident, RecordingIncidentSink};
