mod controller;
mod dispatch;
mod runner;

pub use controller::{JobAdmission, JobProcessor, JobProducer, RunnerHandle};
pub use dispatch::{DispatchStatus, JobDispatcher, ProducerDispatcher};
