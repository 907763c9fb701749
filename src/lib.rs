//! Revision-ingestion engine for repository statistics.
//!
//! Turns a stream of revision identifiers from a source-control tool into
//! fully-populated revision records (commit metadata plus per-file
//! diffstats) by pipelining subprocess calls across worker threads, and
//! persists the results in an on-disk cache so repeated report runs skip
//! the expensive fetches.
//!
//! Components, leaves first:
//!
//! - [`jobqueue::JobQueue`]: bounded MPMC work queue with per-key status
//!   tracking, connecting producers and workers.
//! - [`subprocess`]: scoped child-process pipes with guaranteed reap.
//! - [`backend::Backend`]: the capability trait abstracting one VCS
//!   tool; [`backend::git::GitBackend`] drives the `git` CLI.
//! - [`backend::prefetch::Prefetcher`]: two queues, two worker pools,
//!   one long-lived child per worker.
//! - [`cache::Cache`]: transparent backend decorator persisting
//!   revisions in rotated zlib segments plus an append-only gzip index.
//! - [`report`]: the thin driver mapping a callback over a branch.
//!
//! Data flow: the driver asks the iterator for revision ids, batches them
//! to `prefetch`, then requests each by id. The cache checks its index;
//! on a miss it delegates to the prefetcher-backed backend and persists
//! the completed record.
//!
//! Scheduling is parallel native threads with blocking I/O throughout.
//! There is no async runtime; every worker spends most of its time
//! blocked on a
//! pipe.

pub mod backend;
pub mod cache;
pub mod jobqueue;
pub mod report;
pub mod revision;
pub mod subprocess;
pub mod wire;

pub use backend::{open_repository, Backend, BackendError, LogIterator, Tag};
pub use cache::{Cache, CacheConfig, CacheError, CheckOutcome};
pub use jobqueue::{JobQueue, JobStatus};
pub use report::{map_branch, ReportError};
pub use revision::{Diffstat, FileStat, Revision};
pub use subprocess::ProcessError;
