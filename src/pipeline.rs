//! The demux, decode and convert worker threads.
//!
//! Each worker owns one collaborator for the lifetime of the pipeline and
//! hands it back when joined, so the engine can flush and reuse it across a
//! reconfiguration. Workers poll the published task list, do one unit of
//! work, report the list generation they used, and sleep briefly when there
//! was nothing to do.
//!
//! A collaborator error ends its worker with an error log. The other two
//! workers keep running; affected snapshots simply stay placeholders.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::backend::{DecodedFrame, DemuxedPacket, Demuxer, FrameConverter, VideoDecoder};
use crate::configuration::{EngineOptions, ResolvedOutput};
use crate::error::SnapcacheError;
use crate::scheduler::{NOT_RUNNING, Scheduler, TaskList, Worker};
use crate::task::{GopTask, Offer};
use crate::viewer::ViewerRegistry;
use crate::window::SnapGeometry;

/// Backpressure and polling settings copied from [`EngineOptions`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tuning {
    pub(crate) packet_queue_depth: usize,
    pub(crate) max_pending_frames: usize,
    pub(crate) max_demuxed_tasks: usize,
    pub(crate) idle_sleep: Duration,
}

impl From<&EngineOptions> for Tuning {
    fn from(options: &EngineOptions) -> Self {
        Self {
            packet_queue_depth: options.packet_queue_depth,
            max_pending_frames: options.max_pending_frames,
            max_demuxed_tasks: options.max_demuxed_tasks,
            idle_sleep: options.idle_sleep,
        }
    }
}

/// State shared by the three workers of one pipeline run.
pub(crate) struct PipelineContext<P, F> {
    pub(crate) scheduler: Arc<Scheduler<P, F>>,
    pub(crate) viewers: Arc<ViewerRegistry>,
    pub(crate) pending_frames: Arc<AtomicUsize>,
    pub(crate) geometry: SnapGeometry,
    pub(crate) output: ResolvedOutput,
    pub(crate) video_stream_index: usize,
    pub(crate) tuning: Tuning,
    quit: AtomicBool,
}

impl<P, F> PipelineContext<P, F> {
    pub(crate) fn new(
        scheduler: Arc<Scheduler<P, F>>,
        viewers: Arc<ViewerRegistry>,
        pending_frames: Arc<AtomicUsize>,
        geometry: SnapGeometry,
        output: ResolvedOutput,
        video_stream_index: usize,
        tuning: Tuning,
    ) -> Self {
        Self {
            scheduler,
            viewers,
            pending_frames,
            geometry,
            output,
            video_stream_index,
            tuning,
            quit: AtomicBool::new(false),
        }
    }

    fn should_quit(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    fn idle(&self) {
        thread::sleep(self.tuning.idle_sleep);
    }

    /// Fold viewer range changes into the task list, then release retired
    /// tasks nobody can still be using.
    fn refresh_tasks(&self) {
        if let Some(ranges) = self.viewers.collect_changed_ranges() {
            self.scheduler.apply(ranges);
        }
        self.scheduler.reclaim();
    }
}

/// The collaborators of an opened source while no pipeline runs.
pub(crate) struct Collaborators<P, F> {
    pub(crate) demuxer: Option<Box<dyn Demuxer<P>>>,
    pub(crate) decoder: Option<Box<dyn VideoDecoder<P, F>>>,
    pub(crate) converter: Option<Box<dyn FrameConverter<F>>>,
}

/// Marks a worker as not running when its thread ends, panics included.
struct ObserveOnExit<'a, P, F> {
    scheduler: &'a Scheduler<P, F>,
    worker: Worker,
}

impl<P, F> Drop for ObserveOnExit<'_, P, F> {
    fn drop(&mut self) {
        self.scheduler.observe(self.worker, NOT_RUNNING);
        log::debug!("{} thread exited", self.worker.name());
    }
}

/// Three running workers.
pub(crate) struct Pipeline<P: Send + 'static, F: Send + 'static> {
    context: Arc<PipelineContext<P, F>>,
    demux: Option<JoinHandle<Box<dyn Demuxer<P>>>>,
    decode: Option<JoinHandle<Box<dyn VideoDecoder<P, F>>>>,
    convert: Option<JoinHandle<Box<dyn FrameConverter<F>>>>,
}

impl<P: Send + 'static, F: Send + 'static> Pipeline<P, F> {
    /// Spawn one worker per available collaborator.
    pub(crate) fn start(
        context: PipelineContext<P, F>,
        collaborators: Collaborators<P, F>,
    ) -> Result<Self, SnapcacheError> {
        let context = Arc::new(context);
        let generation = context.scheduler.current().generation();
        for worker in Worker::ALL {
            context.scheduler.observe(worker, generation);
        }

        let mut pipeline = Self {
            context: context.clone(),
            demux: None,
            decode: None,
            convert: None,
        };

        if let Some(mut demuxer) = collaborators.demuxer {
            let context = context.clone();
            pipeline.demux = Some(spawn(Worker::Demux, move || {
                run_demux(&context, demuxer.as_mut());
                demuxer
            })?);
        } else {
            log::warn!("No demuxer available; snapshots will not be produced");
            context.scheduler.observe(Worker::Demux, NOT_RUNNING);
        }

        if let Some(mut decoder) = collaborators.decoder {
            let context = context.clone();
            pipeline.decode = Some(spawn(Worker::Decode, move || {
                run_decode(&context, decoder.as_mut());
                decoder
            })?);
        } else {
            log::warn!("No decoder available; snapshots will not be produced");
            context.scheduler.observe(Worker::Decode, NOT_RUNNING);
        }

        if let Some(mut converter) = collaborators.converter {
            let context = context.clone();
            pipeline.convert = Some(spawn(Worker::Convert, move || {
                run_convert(&context, converter.as_mut());
                converter
            })?);
        } else {
            log::warn!("No frame converter available; snapshots will not be produced");
            context.scheduler.observe(Worker::Convert, NOT_RUNNING);
        }

        log::debug!(
            "Pipeline started: snapshot interval {:.1} ms, cache size {}",
            context.geometry.snapshot_interval_ms(),
            context.geometry.cache_size()
        );
        Ok(pipeline)
    }

    /// Signal every worker to quit, join them, and take back their
    /// collaborators. A worker that panicked loses its collaborator.
    pub(crate) fn stop(mut self) -> Collaborators<P, F> {
        self.context.quit.store(true, Ordering::Release);
        Collaborators {
            demuxer: join(Worker::Demux, self.demux.take()),
            decoder: join(Worker::Decode, self.decode.take()),
            converter: join(Worker::Convert, self.convert.take()),
        }
    }
}

impl<P: Send + 'static, F: Send + 'static> Drop for Pipeline<P, F> {
    fn drop(&mut self) {
        self.context.quit.store(true, Ordering::Release);
        join(Worker::Demux, self.demux.take());
        join(Worker::Decode, self.decode.take());
        join(Worker::Convert, self.convert.take());
    }
}

fn spawn<T, W>(worker: Worker, body: W) -> Result<JoinHandle<T>, SnapcacheError>
where
    T: Send + 'static,
    W: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(worker.name().to_string())
        .spawn(body)
        .map_err(|error| SnapcacheError::ThreadSpawn {
            name: worker.name(),
            reason: error.to_string(),
        })
}

fn join<T>(worker: Worker, handle: Option<JoinHandle<T>>) -> Option<T> {
    match handle?.join() {
        Ok(collaborator) => Some(collaborator),
        Err(_) => {
            log::error!("{} thread panicked", worker.name());
            None
        }
    }
}

/// Where the demuxer stands between tasks.
enum DemuxPosition<P> {
    /// Unknown; the next task must seek.
    Unknown,
    /// Stopped right at a GOP boundary, holding its first packet.
    AtBoundary {
        pts: i64,
        packet: DemuxedPacket<P>,
    },
}

fn run_demux<P, F>(context: &PipelineContext<P, F>, demuxer: &mut dyn Demuxer<P>) {
    let _exit = ObserveOnExit {
        scheduler: &context.scheduler,
        worker: Worker::Demux,
    };
    let mut position = DemuxPosition::Unknown;
    let mut current: Option<Arc<GopTask<P, F>>> = None;

    while !context.should_quit() {
        context.refresh_tasks();
        let list = context.scheduler.current();

        if current
            .as_ref()
            .is_some_and(|task| !task.is_active() || task.is_demuxer_eof())
        {
            current = None;
        }
        if current.is_none() {
            current = list.find_next_demux_task(context.tuning.max_demuxed_tasks);
            if let Some(task) = &current {
                task.mark_demuxing();
                if let Err(error) = position_demuxer(demuxer, task, &mut position) {
                    log::error!("Demux thread stopped: {error}");
                    break;
                }
            }
        }

        let worked = match &current {
            Some(task) => match demux_step(context, demuxer, task, &mut position) {
                Ok(worked) => worked,
                Err(error) => {
                    log::error!("Demux thread stopped: {error}");
                    break;
                }
            },
            None => false,
        };

        context.scheduler.observe(Worker::Demux, list.generation());
        if !worked {
            context.idle();
        }
    }
}

/// Seek to the start of `task`, unless the demuxer already stopped exactly
/// there at the end of the previous task.
fn position_demuxer<P, F>(
    demuxer: &mut dyn Demuxer<P>,
    task: &GopTask<P, F>,
    position: &mut DemuxPosition<P>,
) -> Result<(), SnapcacheError> {
    let low = task.seek_bounds().low;
    match std::mem::replace(position, DemuxPosition::Unknown) {
        DemuxPosition::AtBoundary { pts, packet } if pts == low => {
            log::trace!("Task {} continues at pts {low} without seeking", task.id());
            task.push_packet(packet);
            Ok(())
        }
        _ => {
            log::trace!("Task {} seeks to pts {low}", task.id());
            demuxer.seek(low)
        }
    }
}

/// Read at most one packet for `task`. Returns whether any work was done.
fn demux_step<P, F>(
    context: &PipelineContext<P, F>,
    demuxer: &mut dyn Demuxer<P>,
    task: &GopTask<P, F>,
    position: &mut DemuxPosition<P>,
) -> Result<bool, SnapcacheError> {
    if task.queued_packets() >= context.tuning.packet_queue_depth {
        return Ok(false);
    }
    let high = task.seek_bounds().high;
    match demuxer.read_packet()? {
        None => {
            log::trace!("Task {} reached end of input", task.id());
            task.mark_demuxer_eof();
        }
        Some(packet) if packet.stream_index != context.video_stream_index => {}
        Some(packet) if packet.is_key && packet.pts >= high => {
            log::trace!("Task {} demuxed up to pts {high}", task.id());
            task.mark_demuxer_eof();
            *position = DemuxPosition::AtBoundary {
                pts: packet.pts,
                packet,
            };
        }
        Some(packet) => task.push_packet(packet),
    }
    Ok(true)
}

/// Outcome of one decode step.
enum DecodeStep {
    Worked,
    Finished,
    Idle,
}

fn run_decode<P, F>(context: &PipelineContext<P, F>, decoder: &mut dyn VideoDecoder<P, F>) {
    let _exit = ObserveOnExit {
        scheduler: &context.scheduler,
        worker: Worker::Decode,
    };
    let mut current: Option<Arc<GopTask<P, F>>> = None;

    while !context.should_quit() {
        let list = context.scheduler.current();

        if current.as_ref().is_some_and(|task| !task.is_active()) {
            log::trace!("Decode task cancelled; flushing decoder");
            decoder.flush();
            current = None;
        }

        let step = if context.pending_frames.load(Ordering::Acquire)
            >= context.tuning.max_pending_frames
        {
            Ok(DecodeStep::Idle)
        } else {
            if current.is_none() {
                current = list.find_next_decoder_task();
                if let Some(task) = &current {
                    task.mark_decoding();
                }
            }
            match &current {
                Some(task) => decode_step(context, decoder, &list, task),
                None => Ok(DecodeStep::Idle),
            }
        };

        let idle = match step {
            Ok(DecodeStep::Worked) => false,
            Ok(DecodeStep::Finished) => {
                current = None;
                false
            }
            Ok(DecodeStep::Idle) => true,
            Err(error) => {
                log::error!("Decode thread stopped: {error}");
                break;
            }
        };

        context.scheduler.observe(Worker::Decode, list.generation());
        if idle {
            context.idle();
        }
    }
}

fn decode_step<P, F>(
    context: &PipelineContext<P, F>,
    decoder: &mut dyn VideoDecoder<P, F>,
    list: &TaskList<P, F>,
    task: &GopTask<P, F>,
) -> Result<DecodeStep, SnapcacheError> {
    if let Some(packet) = task.pop_packet() {
        decoder.send_packet(packet)?;
        drain_decoder(context, decoder, list)?;
        return Ok(DecodeStep::Worked);
    }
    if task.is_demuxer_eof() {
        decoder.send_eof()?;
        drain_decoder(context, decoder, list)?;
        decoder.flush();
        task.mark_decoder_eof();
        log::trace!(
            "Task {} decoded: {} snapshot(s) ready",
            task.id(),
            task.ready_count()
        );
        return Ok(DecodeStep::Finished);
    }
    Ok(DecodeStep::Idle)
}

fn drain_decoder<P, F>(
    context: &PipelineContext<P, F>,
    decoder: &mut dyn VideoDecoder<P, F>,
    list: &TaskList<P, F>,
) -> Result<(), SnapcacheError> {
    while let Some(frame) = decoder.receive_frame()? {
        deliver_frame(context, list, frame);
    }
    Ok(())
}

/// Hand a decoded frame to the task owning its nearest snapshot index.
/// Frames outside the timeline, or whose owner is gone, are dropped.
fn deliver_frame<P, F>(context: &PipelineContext<P, F>, list: &TaskList<P, F>, frame: DecodedFrame<F>) {
    let geometry = &context.geometry;
    let (index, bias) = geometry.nearest_index(frame.pts);
    if index < 0 || index > i64::from(geometry.max_index()) {
        return;
    }
    let index = index as u32;
    let Some(owner) = list.find_owner(index) else {
        log::trace!("Dropping frame pts {} for unowned index {index}", frame.pts);
        return;
    };
    let timestamp_ms = geometry.pts_to_millis(frame.pts);
    if let Offer::Rejected(_) = owner.offer(index, frame.pts, bias, timestamp_ms, frame.payload) {
        log::trace!("Frame pts {} rejected for index {index}", frame.pts);
    }
}

fn run_convert<P, F>(context: &PipelineContext<P, F>, converter: &mut dyn FrameConverter<F>) {
    let _exit = ObserveOnExit {
        scheduler: &context.scheduler,
        worker: Worker::Convert,
    };

    while !context.should_quit() {
        let list = context.scheduler.current();
        let task = list.find_next_convert_task();

        let mut failure = None;
        if let Some(task) = &task {
            for (cell, frame) in task.take_unconverted() {
                if failure.is_none() {
                    match converter.convert(&frame, &context.output) {
                        Ok(image) => cell.set_image(image),
                        Err(error) => failure = Some(error),
                    }
                }
                drop(frame);
                context.pending_frames.fetch_sub(1, Ordering::AcqRel);
            }
        }
        if let Some(error) = failure {
            log::error!("Convert thread stopped: {error}");
            break;
        }

        context.scheduler.observe(Worker::Convert, list.generation());
        if task.is_none() {
            context.idle();
        }
    }
}
