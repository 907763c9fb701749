//! Concurrent prefetching of revision metadata and diffstats.
//!
//! The [`Prefetcher`] owns two [`JobQueue`]s (one for commit metadata,
//! one for diffstats) and a pool of worker threads per queue. Each worker
//! talks to its own `git` child process:
//!
//! - **Metadata workers** pull batches of up to 128 ids, feed the bare
//!   hashes to a per-batch `rev-list --stdin --header --no-walk` child,
//!   close the write half, and parse the concatenated headers coming
//!   back. Headers are separated by a NUL byte at line start; the first
//!   header line is the hash, which maps back to the original (possibly
//!   pair-form) id.
//! - **Diffstat workers** pin one `diff-tree --stdin` child for their
//!   whole life. Each request writes the revision line followed by the
//!   sentinel line; the child echoes the sentinel untouched, which bounds
//!   the response in the shared output stream. Requests are one-at-a-time
//!   because the child writes unbounded output per revision.
//!
//! File descriptors are bounded by one child per worker. A worker whose
//! child dies fails its in-flight key and exits; it is not respawned
//! within a run. A worker whose child cannot even be spawned drains its
//! queue marking every key failed, so result readers never hang.
//!
//! Shutdown is `stop()` (queues wake and drain) then `wait()` (join
//! threads, fail any leftover keys).

use std::io::BufRead;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ahash::AHashMap;

use crate::jobqueue::JobQueue;
use crate::revision::Diffstat;

use super::diff;
use super::git::GitContext;
use super::header::{parse_header, CommitMeta};
use super::split_revision;

/// Revisions per metadata batch: one child process serves this many
/// headers before being reaped.
const META_BATCH: usize = 128;

/// Coordinates background fetching of revision data.
pub struct Prefetcher {
    meta_queue: Arc<JobQueue<String, CommitMeta>>,
    diff_queue: Arc<JobQueue<String, Diffstat>>,
    workers: Vec<JoinHandle<()>>,
}

impl Prefetcher {
    /// Spawns both worker pools.
    ///
    /// `workers_per_pool` defaults to half the logical CPUs, at least one.
    /// The count is fixed for the lifetime of the prefetcher.
    #[must_use]
    pub(crate) fn new(ctx: GitContext, workers_per_pool: Option<usize>) -> Self {
        let count = workers_per_pool
            .unwrap_or_else(|| num_cpus::get() / 2)
            .max(1);
        eprintln!("prefetch: using {count} threads per worker pool");

        let meta_queue = Arc::new(JobQueue::new());
        let diff_queue = Arc::new(JobQueue::new());
        let mut workers = Vec::with_capacity(count * 2);
        for _ in 0..count {
            let queue = Arc::clone(&diff_queue);
            let worker_ctx = ctx.clone();
            workers.push(thread::spawn(move || diffstat_worker(worker_ctx, &queue)));
        }
        for _ in 0..count {
            let queue = Arc::clone(&meta_queue);
            let worker_ctx = ctx.clone();
            workers.push(thread::spawn(move || metadata_worker(worker_ctx, &queue)));
        }

        Self {
            meta_queue,
            diff_queue,
            workers,
        }
    }

    /// Submits ids to both queues.
    pub fn prefetch(&self, ids: &[String]) {
        self.diff_queue.put(ids.iter().cloned());
        self.meta_queue.put(ids.iter().cloned());
    }

    /// Blocks until the metadata for `id` is terminal; `None` on failure.
    pub fn get_meta(&self, id: &str) -> Option<CommitMeta> {
        self.meta_queue.get_result(&id.to_string())
    }

    /// Blocks until the diffstat for `id` is terminal; `None` on failure.
    pub fn get_diffstat(&self, id: &str) -> Option<Diffstat> {
        self.diff_queue.get_result(&id.to_string())
    }

    /// Non-blocking: true if `id` has been scheduled for metadata.
    pub fn will_fetch_meta(&self, id: &str) -> bool {
        self.meta_queue.has_arg(&id.to_string())
    }

    /// Non-blocking: true if `id` has been scheduled for a diffstat.
    pub fn will_fetch_diffstat(&self, id: &str) -> bool {
        self.diff_queue.has_arg(&id.to_string())
    }

    /// Stops both queues; workers drain and exit.
    pub fn stop(&self) {
        self.diff_queue.stop();
        self.meta_queue.stop();
    }

    /// Joins all workers, then fails any keys left without a terminal
    /// state so blocked readers unblock.
    pub fn wait(&mut self) {
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.meta_queue.fail_remaining();
        self.diff_queue.fail_remaining();
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

/// Drains the queue marking every key failed. Fallback for a worker whose
/// child cannot be spawned: readers get a failure instead of a hang.
fn fail_sink<R>(queue: &JobQueue<String, R>) {
    while let Some(id) = queue.get_arg() {
        queue.failed(&id);
    }
}

/// Diffstat worker loop: one long-lived `diff-tree --stdin` child.
fn diffstat_worker(ctx: GitContext, queue: &JobQueue<String, Diffstat>) {
    let mut pipe = match ctx.spawn(&["diff-tree", "-U0", "--no-renames", "--stdin", "--root"]) {
        Ok(pipe) => pipe,
        Err(err) => {
            eprintln!("prefetch: diffstat worker failed to start: {err}");
            fail_sink(queue);
            return;
        }
    };

    while let Some(id) = queue.get_arg() {
        let (parent, child) = split_revision(&id);
        let request = match parent {
            Some(parent) => format!("{child} {parent}\n{}\n", diff::SENTINEL as char),
            None => format!("{child}\n{}\n", diff::SENTINEL as char),
        };
        if let Err(err) = pipe.send(request.as_bytes()) {
            eprintln!("prefetch: diffstat pipe broke: {err}");
            queue.failed(&id);
            break;
        }
        match diff::parse(pipe.reader()) {
            Ok(stat) => queue.done(id, stat),
            Err(err) => {
                eprintln!("prefetch: error reading diff for {id}: {err}");
                queue.failed(&id);
                break;
            }
        }
    }
}

/// Metadata worker loop: a fresh `rev-list --stdin --header --no-walk`
/// child per batch of up to [`META_BATCH`] ids.
fn metadata_worker(ctx: GitContext, queue: &JobQueue<String, CommitMeta>) {
    while let Some(batch) = queue.get_args(META_BATCH) {
        let mut pipe = match ctx.spawn(&["rev-list", "--stdin", "--header", "--no-walk"]) {
            Ok(pipe) => pipe,
            Err(err) => {
                eprintln!("prefetch: metadata worker failed to start: {err}");
                for id in &batch {
                    queue.failed(id);
                }
                fail_sink(queue);
                return;
            }
        };

        // Bare child hash -> original (possibly pair-form) id.
        let mut revmap: AHashMap<String, String> = AHashMap::new();
        let mut request = String::new();
        for id in &batch {
            let (_, child) = split_revision(id);
            request.push_str(child);
            request.push('\n');
            revmap.insert(child.to_string(), id.clone());
        }
        if let Err(err) = pipe.send(request.as_bytes()) {
            eprintln!("prefetch: metadata pipe broke: {err}");
            for id in &batch {
                queue.failed(id);
            }
            continue;
        }
        pipe.close_write();

        parse_batch(pipe.reader(), &mut revmap, queue);

        // Anything the child never reported fails rather than dangles.
        for id in revmap.into_values() {
            queue.failed(&id);
        }
    }
}

/// Parses the concatenated `--header` stream, completing queue keys as
/// headers are recognised. Recognised keys are removed from `revmap`.
fn parse_batch(
    reader: &mut dyn BufRead,
    revmap: &mut AHashMap<String, String>,
    queue: &JobQueue<String, CommitMeta>,
) {
    let mut header: Vec<String> = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                eprintln!("prefetch: error reading headers: {err}");
                break;
            }
        }
        if line.ends_with(b"\n") {
            line.pop();
        }
        // A NUL at line start closes the previous header.
        if line.first() == Some(&0) {
            finish_header(&header, revmap, queue);
            header.clear();
            header.push(String::from_utf8_lossy(&line[1..]).into_owned());
        } else {
            header.push(String::from_utf8_lossy(&line).into_owned());
        }
    }
    finish_header(&header, revmap, queue);
}

/// Completes the queue key for one accumulated header, if it belongs to
/// this batch. Parse failures mark the key failed; the worker continues.
fn finish_header(
    header: &[String],
    revmap: &mut AHashMap<String, String>,
    queue: &JobQueue<String, CommitMeta>,
) {
    let Some(hash) = header.first() else { return };
    let Some(id) = revmap.remove(hash) else { return };
    match parse_header(header) {
        Ok(meta) => queue.done(id, meta),
        Err(err) => {
            eprintln!("prefetch: error parsing revision header: {err}");
            queue.failed(&id);
        }
    }
}
