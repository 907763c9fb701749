//! Report driver: maps a callback over a branch's revisions.
//!
//! The driver materialises the branch iterator, schedules every id for
//! prefetching, then requests each revision in order and hands it to the
//! callback. Between revisions it polls a shared terminate flag so a
//! signal handler can cut a long run short. The backend is finalized on
//! every exit path.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backend::{Backend, BackendError};
use crate::revision::Revision;

/// Errors from a report run.
#[derive(Debug)]
#[non_exhaustive]
pub enum ReportError {
    /// The backend failed while iterating or fetching.
    Backend(BackendError),
    /// The terminate flag was set.
    Terminated,
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(err) => write!(f, "{err}"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend(err) => Some(err),
            Self::Terminated => None,
        }
    }
}

impl From<BackendError> for ReportError {
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}

/// Maps `callback` over all revisions of `branch`, oldest first.
///
/// Revisions are borrowed by the callback for the duration of the call
/// only. Returning `ControlFlow::Break(())` stops the run early without an
/// error. Returns the number of revisions mapped.
///
/// # Errors
/// [`ReportError::Terminated`] if `terminate` was observed set;
/// [`ReportError::Backend`] for any backend failure. The backend's
/// `finalize` runs in either case.
pub fn map_branch<B, F>(
    backend: &mut B,
    branch: &str,
    terminate: &AtomicBool,
    mut callback: F,
) -> Result<usize, ReportError>
where
    B: Backend + ?Sized,
    F: FnMut(&Revision) -> ControlFlow<()>,
{
    let result = run(backend, branch, terminate, &mut callback);
    let finalized = backend.finalize();
    if result.is_ok() {
        finalized?;
    }
    result
}

fn run<B, F>(
    backend: &mut B,
    branch: &str,
    terminate: &AtomicBool,
    callback: &mut F,
) -> Result<usize, ReportError>
where
    B: Backend + ?Sized,
    F: FnMut(&Revision) -> ControlFlow<()>,
{
    eprintln!("report: initializing iterator for branch '{branch}'");
    let iterator = backend.iterator(branch, None, None)?;
    let ids = iterator.ids().to_vec();
    backend.prefetch(&ids)?;

    let mut mapped = 0;
    for id in &ids {
        if terminate.load(Ordering::Relaxed) {
            return Err(ReportError::Terminated);
        }
        let revision = backend.revision(id)?;
        mapped += 1;
        match callback(&revision) {
            ControlFlow::Continue(()) => {}
            ControlFlow::Break(()) => break,
        }
    }
    eprintln!("report: mapped {mapped} revisions");
    Ok(mapped)
}
