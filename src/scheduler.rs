//! Task scheduling across viewers.
//!
//! The [`Scheduler`] owns the list of live [`GopTask`]s. Every viewer
//! contributes GOP-aligned [`TaskRange`]s; the scheduler merges duplicates
//! (same seek bounds) across viewers, keeps the tasks that are still wanted,
//! creates tasks for new ranges, and retires the rest.
//!
//! The list is published as an immutable [`TaskList`] snapshot behind one
//! lock. Readers clone the `Arc` and work on a self-consistent list without
//! holding the lock, so a slow worker never blocks the others or the
//! viewers. Every publication bumps a generation number; each worker reports
//! the generation it last finished an iteration with, and a retired task is
//! only released once every worker has moved past its retirement.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::seek_index::SeekBounds;
use crate::task::{GopTask, TaskRange};
use crate::texture::DeferredTextures;

/// The three pipeline workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Worker {
    Demux,
    Decode,
    Convert,
}

impl Worker {
    pub(crate) const ALL: [Worker; 3] = [Worker::Demux, Worker::Decode, Worker::Convert];

    pub(crate) fn name(self) -> &'static str {
        match self {
            Worker::Demux => "snapcache-demux",
            Worker::Decode => "snapcache-decode",
            Worker::Convert => "snapcache-convert",
        }
    }

    fn slot(self) -> usize {
        match self {
            Worker::Demux => 0,
            Worker::Decode => 1,
            Worker::Convert => 2,
        }
    }
}

/// Generation value of a worker that is not running.
pub(crate) const NOT_RUNNING: u64 = u64::MAX;

/// An immutable, index-ordered snapshot of the live tasks.
pub(crate) struct TaskList<P, F> {
    generation: u64,
    tasks: Vec<Arc<GopTask<P, F>>>,
}

impl<P, F> TaskList<P, F> {
    fn empty(generation: u64) -> Self {
        Self {
            generation,
            tasks: Vec::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn tasks(&self) -> &[Arc<GopTask<P, F>>] {
        &self.tasks
    }

    /// The live task responsible for `index`, if any.
    ///
    /// Tasks are sorted by index range and never overlap, so at most one
    /// task can own an index.
    pub(crate) fn find_owner(&self, index: u32) -> Option<&Arc<GopTask<P, F>>> {
        let position = self
            .tasks
            .partition_point(|task| task.index_range().end <= index);
        self.tasks
            .get(position)
            .filter(|task| task.owns_index(index) && task.is_active())
    }

    /// Next task to demux: an in-view task first, otherwise the one closest
    /// to a view window. Returns `None` while more than `max_demuxed` tasks
    /// are fully demuxed but not yet decoded.
    pub(crate) fn find_next_demux_task(&self, max_demuxed: usize) -> Option<Arc<GopTask<P, F>>> {
        let waiting = self
            .tasks
            .iter()
            .filter(|task| task.is_active() && task.is_demuxer_eof() && !task.is_decoder_eof())
            .count();
        if waiting > max_demuxed {
            return None;
        }

        let mut candidates = self
            .tasks
            .iter()
            .filter(|task| task.is_active() && !task.is_demuxing());
        let mut nearest: Option<&Arc<GopTask<P, F>>> = None;
        for task in &mut candidates {
            if task.in_view() {
                return Some(task.clone());
            }
            if nearest.is_none_or(|best| task.distance_to_view() < best.distance_to_view()) {
                nearest = Some(task);
            }
        }
        nearest.cloned()
    }

    /// Earliest task with demuxed packets the decoder has not consumed yet.
    pub(crate) fn find_next_decoder_task(&self) -> Option<Arc<GopTask<P, F>>> {
        self.tasks
            .iter()
            .find(|task| task.is_active() && task.has_decoder_work())
            .cloned()
    }

    /// Earliest task holding decoded but unconverted frames.
    pub(crate) fn find_next_convert_task(&self) -> Option<Arc<GopTask<P, F>>> {
        self.tasks
            .iter()
            .find(|task| task.is_active() && task.has_unconverted())
            .cloned()
    }
}

struct Retired<P, F> {
    generation: u64,
    task: Arc<GopTask<P, F>>,
}

/// Summary of one task-list update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct UpdateSummary {
    pub(crate) kept: usize,
    pub(crate) created: usize,
    pub(crate) retired: usize,
}

/// Owner of the published task list.
pub(crate) struct Scheduler<P, F> {
    published: Mutex<Arc<TaskList<P, F>>>,
    retired: Mutex<Vec<Retired<P, F>>>,
    observed: [AtomicU64; 3],
    pending_frames: Arc<AtomicUsize>,
    deferred: Arc<DeferredTextures>,
}

impl<P, F> Scheduler<P, F> {
    pub(crate) fn new(pending_frames: Arc<AtomicUsize>, deferred: Arc<DeferredTextures>) -> Self {
        Self {
            published: Mutex::new(Arc::new(TaskList::empty(0))),
            retired: Mutex::new(Vec::new()),
            observed: [
                AtomicU64::new(NOT_RUNNING),
                AtomicU64::new(NOT_RUNNING),
                AtomicU64::new(NOT_RUNNING),
            ],
            pending_frames,
            deferred,
        }
    }

    /// The currently published list.
    pub(crate) fn current(&self) -> Arc<TaskList<P, F>> {
        self.published.lock().clone()
    }

    /// Record that `worker` finished an iteration working with `generation`.
    pub(crate) fn observe(&self, worker: Worker, generation: u64) {
        self.observed[worker.slot()].store(generation, Ordering::Release);
    }

    /// Merge `ranges` from every viewer and publish the resulting list.
    pub(crate) fn apply(&self, ranges: Vec<TaskRange>) -> UpdateSummary {
        let mut merged: BTreeMap<SeekBounds, TaskRange> = BTreeMap::new();
        for range in ranges {
            match merged.get_mut(&range.seek_bounds) {
                Some(existing) => {
                    existing.in_view |= range.in_view;
                    existing.distance_to_view =
                        existing.distance_to_view.min(range.distance_to_view);
                }
                None => {
                    merged.insert(range.seek_bounds, range);
                }
            }
        }

        let mut published = self.published.lock();
        let generation = published.generation + 1;
        let mut summary = UpdateSummary::default();
        let mut tasks = Vec::with_capacity(merged.len());
        let mut retiring = Vec::new();

        for task in &published.tasks {
            match merged.remove(&task.seek_bounds()) {
                Some(range) => {
                    task.set_view(range.in_view, range.distance_to_view);
                    tasks.push(task.clone());
                    summary.kept += 1;
                }
                None => {
                    task.cancel();
                    retiring.push(Retired {
                        generation,
                        task: task.clone(),
                    });
                    summary.retired += 1;
                }
            }
        }
        for range in merged.into_values() {
            tasks.push(Arc::new(GopTask::new(
                &range,
                self.pending_frames.clone(),
                self.deferred.clone(),
            )));
            summary.created += 1;
        }
        tasks.sort_by_key(|task| task.index_range().start);

        *published = Arc::new(TaskList { generation, tasks });
        drop(published);
        self.retired.lock().extend(retiring);

        log::debug!(
            "Task list generation {generation}: {} kept, {} created, {} retired",
            summary.kept,
            summary.created,
            summary.retired
        );
        summary
    }

    /// Release retired tasks every running worker has moved past.
    /// Returns how many were released.
    pub(crate) fn reclaim(&self) -> usize {
        let horizon = self
            .observed
            .iter()
            .map(|generation| generation.load(Ordering::Acquire))
            .min()
            .unwrap_or(NOT_RUNNING);

        let mut retired = self.retired.lock();
        let before = retired.len();
        retired.retain(|entry| {
            if entry.generation <= horizon {
                entry.task.release_resources();
                false
            } else {
                true
            }
        });
        let released = before - retired.len();
        if released > 0 {
            log::trace!("Released {released} retired task(s)");
        }
        released
    }

    /// Drop every task, live or retired. Only valid while no worker runs.
    pub(crate) fn flush(&self) {
        let mut published = self.published.lock();
        for task in &published.tasks {
            task.cancel();
            task.release_resources();
        }
        *published = Arc::new(TaskList::empty(published.generation + 1));
        drop(published);

        for entry in self.retired.lock().drain(..) {
            entry.task.release_resources();
        }
        for worker in Worker::ALL {
            self.observe(worker, NOT_RUNNING);
        }
    }

    pub(crate) fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }
}
