//! # flowrunner-core
//!
//! The execution core of flowrunner: accepts task submissions, launches
//! agent flows as isolated child processes, carries their output and
//! interactive input over a Redis-backed stream bus, and persists task
//! lifecycle and results.
//!
//! ## Components
//!
//! - [`bus`] — typed pub/sub and append-only streams over Redis primitives
//! - [`mediator`] — correlates input requests and responses by request_id
//! - [`supervisor`] — owns child processes: isolated workdir, process
//!   group, signals, exit status
//! - [`scheduler`] — admission (quota, permission), the dispatch queue,
//!   and the worker pool
//! - [`runner`] — the per-task control actor: the single authoritative
//!   writer for a task's state
//! - [`control`] — cancellation propagation and signal escalation
//! - [`results`] — drains final output, archives the workdir, attaches the
//!   results summary
//! - [`reaper`] — the periodic reconciler for orphaned tasks and expired
//!   streams
//!
//! Collaborator seams (persistence, object storage, authentication,
//! permission) live in [`store`], [`storage`], and [`auth`] with shippable
//! default implementations.

pub mod auth;
pub mod bus;
pub mod config;
pub mod control;
pub mod mediator;
pub mod reaper;
pub mod results;
pub mod runner;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod supervisor;
pub mod telemetry;

// Re-export primary types
pub use auth::{AllowAll, AuthVerifier, ClientCredential, PermissionOracle, StaticTokenVerifier};
pub use bus::{MemoryBus, RedisBus, StreamBus, StreamFrom};
pub use config::Config;
pub use mediator::Mediator;
pub use reaper::Reaper;
pub use runner::TaskRunner;
pub use scheduler::{Scheduler, SubmitOptions, WorkerPool};
pub use storage::{FsObjectStore, ObjectStore};
pub use store::{MemoryTaskStore, RedisTaskStore, TaskPatch, TaskStore};
pub use supervisor::{ChildHandle, ExitDisposition, Supervisor};
