//! `quarry-workers`: the worker contract and everything that runs jobs.
//!
//! A [`WorkerPool`] claims jobs from the shared queue and hands each one to
//! a fresh [`Worker`] built by the [`WorkerRegistry`]. Processors are
//! workers that derive a dataset from its parent; see [`processor`].

pub mod context;
pub mod pool;
pub mod processor;
pub mod processors;
pub mod registry;
pub mod worker;
pub mod workers;

pub use context::{open_connection, WorkerContext};
pub use pool::WorkerPool;
pub use processor::{Processor, ProcessorOption, ProcessorRun, ProcessorWorker};
pub use registry::{RegistryEntry, WorkerFactory, WorkerRegistry};
pub use worker::{EnsureJob, WorkOutcome, Worker};
