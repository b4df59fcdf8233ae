//! Bounded worker pool for background texture compression.
//!
//! One pool serves every open chart. Jobs wait in `todo_list` (FIFO) until a
//! slot in `running_list` frees up; at most `max_jobs` run at once on a
//! dedicated rayon pool. Workers only touch their own ticket and send one
//! [`CompletionEvent`] per job over a channel. The consumer thread drains it
//! with [`CompressionWorkerPool::dispatch_pending`], which is the only place
//! results reach a factory.
//!
//! Tickets refer to their factory by [`FactoryId`]. A result is delivered only
//! if the ticket was not aborted and the id is still registered, so a factory
//! that purged its jobs (or was dropped) never sees a late completion. A
//! result for a registered factory the resolver does not know is held back
//! until a later dispatch reaches that factory.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{job_timing_enabled, CacheConfig};
use crate::error::{TexCacheError, TexResult};
use crate::format::{ColorScheme, RasterFormat, TileGrid, TileRect};
use crate::raster::{
    compressor_for, half_scale_chart_bits, zip_texture, CompressedLevel, RasterSource,
    TextureCompressor,
};

/// Liveness token identifying a registered factory. Never reused by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FactoryId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    Queued,
    Running,
    Completed,
    Aborted,
}

/// What a factory hands the pool when it asks for work.
#[derive(Clone)]
pub struct JobClient {
    pub id: FactoryId,
    pub chart_path: PathBuf,
    pub source: Arc<dyn RasterSource>,
    pub grid: TileGrid,
    pub max_level: u32,
}

/// One compression job: a tile, the levels to build and who asked.
pub struct JobTicket {
    ident: u64,
    factory: FactoryId,
    chart_path: PathBuf,
    rect: TileRect,
    index: usize,
    level_min: u32,
    max_level: u32,
    scheme: ColorScheme,
    throttle: bool,
    post_zip: bool,
    source: Arc<dyn RasterSource>,
    abort: AtomicBool,
    state: Mutex<TicketState>,
}

impl JobTicket {
    pub fn ident(&self) -> u64 {
        self.ident
    }

    pub fn factory(&self) -> FactoryId {
        self.factory
    }

    pub fn chart_path(&self) -> &Path {
        &self.chart_path
    }

    pub fn rect(&self) -> TileRect {
        self.rect
    }

    /// Linear tile index in the owning chart's grid.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn level_min(&self) -> u32 {
        self.level_min
    }

    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    pub fn scheme(&self) -> ColorScheme {
        self.scheme
    }

    pub fn state(&self) -> TicketState {
        *self.state.lock()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    fn set_state(&self, state: TicketState) {
        *self.state.lock() = state;
    }

    fn mark_aborted(&self) {
        self.abort.store(true, Ordering::Release);
        let mut state = self.state.lock();
        if *state == TicketState::Queued {
            *state = TicketState::Aborted;
        }
    }

    fn same_work(&self, factory: FactoryId, index: usize, scheme: ColorScheme) -> bool {
        self.factory == factory && self.index == index && self.scheme == scheme
    }
}

impl std::fmt::Debug for JobTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTicket")
            .field("ident", &self.ident)
            .field("factory", &self.factory)
            .field("chart_path", &self.chart_path)
            .field("rect", &self.rect)
            .field("levels", &(self.level_min..=self.max_level))
            .field("scheme", &self.scheme)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

/// Levels produced by a finished job.
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub levels: Vec<CompressedLevel>,
    pub elapsed: Duration,
}

/// Posted by a worker when its job ends, successfully or not.
#[derive(Debug)]
pub struct CompletionEvent {
    pub ticket: Arc<JobTicket>,
    pub result: TexResult<JobOutput>,
}

/// Result of [`CompressionWorkerPool::schedule_job`].
#[derive(Debug)]
pub enum ScheduleOutcome {
    /// Dispatched to a worker.
    Started,
    /// Waiting in the todo list.
    Queued,
    /// Same tile already queued or running; retry on a later frame.
    Refused,
    /// Compressed on the caller's thread.
    Completed(JobOutput),
}

impl ScheduleOutcome {
    pub fn accepted(&self) -> bool {
        !matches!(self, ScheduleOutcome::Refused)
    }
}

/// Receives delivered job results on the consumer thread.
pub trait CompletionSink {
    fn job_completed(&mut self, ticket: &JobTicket, output: JobOutput);
}

/// Maps a ticket's factory id to the live factory, if any.
pub trait FactoryResolver {
    fn resolve(&mut self, id: FactoryId) -> Option<&mut dyn CompletionSink>;
}

impl<S: CompletionSink> FactoryResolver for HashMap<FactoryId, S> {
    fn resolve(&mut self, id: FactoryId) -> Option<&mut dyn CompletionSink> {
        self.get_mut(&id).map(|s| s as &mut dyn CompletionSink)
    }
}

/// Diagnostic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub started: u64,
    pub aborted: u64,
    pub refused: u64,
    pub purged: u64,
    pub running: usize,
    pub queued: usize,
    pub held: usize,
}

#[derive(Default)]
struct PoolState {
    running_list: VecDeque<Arc<JobTicket>>,
    todo_list: VecDeque<Arc<JobTicket>>,
    /// Finished results waiting for their factory to dispatch.
    held: VecDeque<(Arc<JobTicket>, JobOutput)>,
    live: HashSet<FactoryId>,
}

impl PoolState {
    fn active(&self) -> impl Iterator<Item = &Arc<JobTicket>> {
        self.running_list
            .iter()
            .chain(self.todo_list.iter())
            .chain(self.held.iter().map(|(t, _)| t))
            .filter(|t| !t.is_aborted())
    }
}

/// Process-wide compression scheduler, shared as `Arc<CompressionWorkerPool>`.
pub struct CompressionWorkerPool {
    max_jobs: usize,
    compressor: Arc<dyn TextureCompressor>,
    /// `None` when `max_jobs == 0`: every job runs on the caller's thread.
    workers: Option<rayon::ThreadPool>,
    state: Mutex<PoolState>,
    events_tx: Sender<CompletionEvent>,
    events_rx: Receiver<CompletionEvent>,
    next_factory: AtomicU64,
    next_ticket: AtomicU64,
    jobs_started: AtomicU64,
    jobs_aborted: AtomicU64,
    jobs_refused: AtomicU64,
    jobs_purged: AtomicU64,
    job_timing: bool,
}

impl CompressionWorkerPool {
    /// Pool with the software compressor for `config.raster_format`.
    pub fn new(config: &CacheConfig) -> TexResult<Self> {
        Self::with_compressor(config.max_jobs, compressor_for(config.raster_format))
    }

    pub fn with_compressor(
        max_jobs: usize,
        compressor: Arc<dyn TextureCompressor>,
    ) -> TexResult<Self> {
        let workers = if max_jobs > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(max_jobs)
                    .thread_name(|idx| format!("texcache-compress-{}", idx))
                    .build()?,
            )
        } else {
            None
        };
        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        info!(
            "[POOL] {} compression workers, format {:?}",
            max_jobs,
            compressor.format()
        );

        Ok(Self {
            max_jobs,
            compressor,
            workers,
            state: Mutex::new(PoolState::default()),
            events_tx,
            events_rx,
            next_factory: AtomicU64::new(1),
            next_ticket: AtomicU64::new(1),
            jobs_started: AtomicU64::new(0),
            jobs_aborted: AtomicU64::new(0),
            jobs_refused: AtomicU64::new(0),
            jobs_purged: AtomicU64::new(0),
            job_timing: job_timing_enabled(),
        })
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    pub fn raster_format(&self) -> RasterFormat {
        self.compressor.format()
    }

    /// Register a new factory and return its liveness token.
    pub fn register_factory(&self) -> FactoryId {
        let id = FactoryId(self.next_factory.fetch_add(1, Ordering::Relaxed));
        self.state.lock().live.insert(id);
        id
    }

    /// Purge the factory's jobs and forget it; later events for it are dropped.
    pub fn unregister_factory(&self, id: FactoryId) {
        self.purge_factory(id);
        self.state.lock().live.remove(&id);
    }

    pub fn is_registered(&self, id: FactoryId) -> bool {
        self.state.lock().live.contains(&id)
    }

    /// Request compression of the tile at `rect` for levels
    /// `level_min..=client.max_level`.
    ///
    /// `immediate` (or a pool without workers) compresses on the caller's
    /// thread and returns the output directly. Otherwise the job joins the
    /// todo list and starts as soon as a slot is free.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_job(
        &self,
        client: &JobClient,
        rect: &TileRect,
        level_min: u32,
        scheme: ColorScheme,
        throttle: bool,
        immediate: bool,
        post_zip: bool,
    ) -> TexResult<ScheduleOutcome> {
        let index = client
            .grid
            .array_index(rect.x, rect.y)
            .ok_or(TexCacheError::OutOfBounds {
                x: rect.x as i64,
                y: rect.y as i64,
                width: client.grid.size_x,
                height: client.grid.size_y,
            })?;
        if level_min > client.max_level {
            return Err(TexCacheError::InvalidLevel {
                level: level_min,
                max: client.max_level,
            });
        }
        let tile_rect = client.grid.array_xy(index).unwrap_or(*rect);

        let mut state = self.state.lock();
        if state
            .active()
            .any(|t| t.same_work(client.id, index, scheme))
        {
            self.jobs_refused.fetch_add(1, Ordering::Relaxed);
            debug!("[POOL] refused duplicate {} {:?}", tile_rect, scheme);
            return Ok(ScheduleOutcome::Refused);
        }

        let ticket = Arc::new(JobTicket {
            ident: self.next_ticket.fetch_add(1, Ordering::Relaxed),
            factory: client.id,
            chart_path: client.chart_path.clone(),
            rect: tile_rect,
            index,
            level_min,
            max_level: client.max_level,
            scheme,
            throttle,
            post_zip,
            source: Arc::clone(&client.source),
            abort: AtomicBool::new(false),
            state: Mutex::new(TicketState::Queued),
        });

        if immediate || self.workers.is_none() {
            drop(state);
            ticket.set_state(TicketState::Running);
            return match self.do_thread_job(&ticket) {
                Ok(output) => {
                    ticket.set_state(TicketState::Completed);
                    Ok(ScheduleOutcome::Completed(output))
                }
                Err(e) => {
                    ticket.set_state(TicketState::Aborted);
                    self.jobs_aborted.fetch_add(1, Ordering::Relaxed);
                    Err(e)
                }
            };
        }

        state.todo_list.push_back(Arc::clone(&ticket));
        self.fill_slots(&mut state);

        if ticket.state() == TicketState::Running {
            Ok(ScheduleOutcome::Started)
        } else {
            Ok(ScheduleOutcome::Queued)
        }
    }

    /// Move the oldest queued ticket to a free worker slot.
    pub fn start_top_job(&self) -> bool {
        let mut state = self.state.lock();
        self.start_top_job_locked(&mut state)
    }

    fn start_top_job_locked(&self, state: &mut PoolState) -> bool {
        let Some(workers) = self.workers.as_ref() else {
            return false;
        };
        if state.running_list.len() >= self.max_jobs {
            return false;
        }
        let Some(ticket) = state.todo_list.pop_front() else {
            return false;
        };

        ticket.set_state(TicketState::Running);
        state.running_list.push_back(Arc::clone(&ticket));
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
        debug!(
            "[POOL] start job {} {} levels {}..={}",
            ticket.ident, ticket.rect, ticket.level_min, ticket.max_level
        );

        let tx = self.events_tx.clone();
        let compressor = Arc::clone(&self.compressor);
        let job_timing = self.job_timing;
        workers.spawn(move || {
            let result = run_job(&ticket, compressor.as_ref(), job_timing);
            // The receiver only goes away with the pool itself.
            let _ = tx.send(CompletionEvent { ticket, result });
        });
        true
    }

    fn fill_slots(&self, state: &mut PoolState) {
        while self.start_top_job_locked(state) {}
    }

    fn do_thread_job(&self, ticket: &JobTicket) -> TexResult<JobOutput> {
        run_job(ticket, self.compressor.as_ref(), self.job_timing)
    }

    /// Apply one completion on the consumer thread.
    ///
    /// Returns true when the result reached its factory. Aborted or failed
    /// jobs, and jobs whose factory is gone, only release their slot. A
    /// result for a registered factory that `resolver` cannot reach is held
    /// for a later dispatch.
    pub fn on_evt_thread(
        &self,
        event: CompletionEvent,
        resolver: &mut dyn FactoryResolver,
    ) -> bool {
        let CompletionEvent { ticket, result } = event;

        let live = {
            let mut state = self.state.lock();
            if let Some(pos) = state
                .running_list
                .iter()
                .position(|t| t.ident == ticket.ident)
            {
                state.running_list.remove(pos);
            }
            state.live.contains(&ticket.factory)
        };

        let delivered = match result {
            Ok(output) if live && !ticket.is_aborted() => match resolver.resolve(ticket.factory)
            {
                Some(sink) => {
                    ticket.set_state(TicketState::Completed);
                    sink.job_completed(&ticket, output);
                    true
                }
                None => {
                    self.hold(ticket, output);
                    let mut state = self.state.lock();
                    self.fill_slots(&mut state);
                    return false;
                }
            },
            Ok(_) => {
                debug!("[POOL] discarded result of aborted job {}", ticket.ident);
                false
            }
            Err(e) => {
                warn!(
                    "[POOL] job {} for {} failed: {}",
                    ticket.ident,
                    ticket.chart_path.display(),
                    e
                );
                false
            }
        };

        if !delivered {
            ticket.set_state(TicketState::Aborted);
            self.jobs_aborted.fetch_add(1, Ordering::Relaxed);
        }

        let mut state = self.state.lock();
        self.fill_slots(&mut state);
        delivered
    }

    fn hold(&self, ticket: Arc<JobTicket>, output: JobOutput) {
        let mut state = self.state.lock();
        if state.live.contains(&ticket.factory) && !ticket.is_aborted() {
            debug!("[POOL] holding result of job {} for its factory", ticket.ident);
            state.held.push_back((ticket, output));
        } else {
            ticket.set_state(TicketState::Aborted);
            self.jobs_aborted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Deliver held results whose factory `resolver` can reach.
    fn deliver_held(&self, resolver: &mut dyn FactoryResolver) -> usize {
        let mut delivered = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                let pos = state
                    .held
                    .iter()
                    .position(|(t, _)| resolver.resolve(t.factory).is_some());
                pos.and_then(|pos| state.held.remove(pos))
            };
            let Some((ticket, output)) = next else {
                return delivered;
            };
            if let Some(sink) = resolver.resolve(ticket.factory) {
                ticket.set_state(TicketState::Completed);
                sink.job_completed(&ticket, output);
                delivered += 1;
            }
        }
    }

    /// Wait up to `timeout` for the next completion without applying it.
    pub fn recv_event(&self, timeout: Duration) -> Option<CompletionEvent> {
        self.events_rx.recv_timeout(timeout).ok()
    }

    /// Apply held results `resolver` can reach and every completion already
    /// posted. Returns the number handled.
    pub fn dispatch_pending(&self, resolver: &mut dyn FactoryResolver) -> usize {
        let mut handled = self.deliver_held(resolver);
        while let Ok(event) = self.events_rx.try_recv() {
            self.on_evt_thread(event, resolver);
            handled += 1;
        }
        handled
    }

    /// Block up to `timeout` for one completion, then drain the rest. Does
    /// not block when a held result was delivered.
    pub fn wait_and_dispatch(
        &self,
        resolver: &mut dyn FactoryResolver,
        timeout: Duration,
    ) -> usize {
        let held = self.deliver_held(resolver);
        if held > 0 {
            return held + self.dispatch_pending(resolver);
        }
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => {
                self.on_evt_thread(event, resolver);
                1 + self.dispatch_pending(resolver)
            }
            Err(_) => 0,
        }
    }

    fn purge_where(&self, matches: impl Fn(&JobTicket) -> bool) -> usize {
        let mut state = self.state.lock();
        let before = state.todo_list.len();
        state.todo_list.retain(|t| {
            if matches(t) {
                t.mark_aborted();
                false
            } else {
                true
            }
        });
        let removed = before - state.todo_list.len();

        // Running jobs cannot be stopped; their completion becomes a no-op.
        for ticket in state.running_list.iter().filter(|t| matches(t)) {
            ticket.mark_aborted();
        }

        let held_before = state.held.len();
        state.held.retain(|(t, _)| {
            if matches(t) {
                t.mark_aborted();
                t.set_state(TicketState::Aborted);
                false
            } else {
                true
            }
        });
        let dropped = held_before - state.held.len();
        self.jobs_aborted.fetch_add(dropped as u64, Ordering::Relaxed);

        self.jobs_purged.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Remove queued jobs of `chart_path` (every chart when `None`) and abort
    /// running ones. Returns the number of queued jobs removed.
    pub fn purge_job_list(&self, chart_path: Option<&Path>) -> usize {
        let removed = self.purge_where(|t| chart_path.map_or(true, |p| t.chart_path == p));
        if removed > 0 {
            info!(
                "[POOL] purged {} queued jobs for {}",
                removed,
                chart_path.map_or_else(|| "all charts".to_string(), |p| p.display().to_string())
            );
        }
        removed
    }

    /// Remove queued and abort running jobs owned by one factory.
    pub fn purge_factory(&self, id: FactoryId) -> usize {
        self.purge_where(|t| t.factory == id)
    }

    /// Whether any live job belongs to `chart_path`.
    pub fn as_job(&self, chart_path: &Path) -> bool {
        self.state
            .lock()
            .active()
            .any(|t| t.chart_path == chart_path)
    }

    /// State of the live ticket for a tile, if one exists.
    pub fn ticket_state(
        &self,
        factory: FactoryId,
        index: usize,
        scheme: ColorScheme,
    ) -> Option<TicketState> {
        self.state
            .lock()
            .active()
            .find(|t| t.same_work(factory, index, scheme))
            .map(|t| t.state())
    }

    pub fn running_job_count(&self) -> usize {
        self.state.lock().running_list.len()
    }

    pub fn queued_job_count(&self) -> usize {
        self.state.lock().todo_list.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            started: self.jobs_started.load(Ordering::Relaxed),
            aborted: self.jobs_aborted.load(Ordering::Relaxed),
            refused: self.jobs_refused.load(Ordering::Relaxed),
            purged: self.jobs_purged.load(Ordering::Relaxed),
            running: state.running_list.len(),
            queued: state.todo_list.len(),
            held: state.held.len(),
        }
    }

    /// Purge every job and forget every factory. Call once at application
    /// teardown; running workers finish but their results are dropped.
    pub fn shutdown(&self) {
        self.purge_job_list(None);
        self.state.lock().live.clear();
    }
}

impl Drop for CompressionWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run a job, turning a panicking source or compressor into an error.
fn run_job(
    ticket: &JobTicket,
    compressor: &dyn TextureCompressor,
    job_timing: bool,
) -> TexResult<JobOutput> {
    let result = catch_unwind(AssertUnwindSafe(|| do_job(ticket, compressor)))
        .unwrap_or_else(|_| Err(TexCacheError::Compression("worker panicked".into())));

    if job_timing {
        if let Ok(output) = &result {
            debug!(
                "[JOB TIMING] {} {} levels={} total={:.2?}",
                ticket.chart_path.display(),
                ticket.rect,
                output.levels.len(),
                output.elapsed
            );
        }
    }
    result
}

/// Read source pixels at `level_min` and compress every level up to
/// `max_level`, halving in between.
pub fn do_job(ticket: &JobTicket, compressor: &dyn TextureCompressor) -> TexResult<JobOutput> {
    let t0 = Instant::now();
    if ticket.is_aborted() {
        return Err(TexCacheError::Aborted);
    }

    let mut width = (ticket.rect.width as u32) >> ticket.level_min;
    let mut height = (ticket.rect.height as u32) >> ticket.level_min;
    let mut rgb = ticket
        .source
        .read_rgb(&ticket.rect, ticket.level_min, ticket.scheme)?;

    let mut levels = Vec::with_capacity((ticket.max_level - ticket.level_min + 1) as usize);
    for level in ticket.level_min..=ticket.max_level {
        if ticket.is_aborted() {
            return Err(TexCacheError::Aborted);
        }

        let data = compressor.compress(&rgb, width, height)?;
        let zipped = ticket.post_zip.then(|| zip_texture(&data));
        levels.push(CompressedLevel {
            level,
            data,
            zipped,
        });

        if level < ticket.max_level {
            rgb = half_scale_chart_bits(width, height, &rgb);
            width /= 2;
            height /= 2;
            if ticket.throttle {
                std::thread::yield_now();
            }
        }
    }

    Ok(JobOutput {
        levels,
        elapsed: t0.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Dxt1Compressor;
    use crate::test_utils::{SourceMode, TestChart};

    const WAIT: Duration = Duration::from_secs(10);

    #[derive(Default)]
    struct RecordingSink {
        completed: Vec<(usize, ColorScheme, Vec<u32>)>,
    }

    impl CompletionSink for RecordingSink {
        fn job_completed(&mut self, ticket: &JobTicket, output: JobOutput) {
            let levels = output.levels.iter().map(|l| l.level).collect();
            self.completed.push((ticket.index(), ticket.scheme(), levels));
        }
    }

    fn pool(max_jobs: usize) -> Arc<CompressionWorkerPool> {
        Arc::new(CompressionWorkerPool::with_compressor(max_jobs, Arc::new(Dxt1Compressor)).unwrap())
    }

    fn client(pool: &CompressionWorkerPool, chart: Arc<TestChart>) -> JobClient {
        let (w, h) = chart.dimensions();
        JobClient {
            id: pool.register_factory(),
            chart_path: chart.chart_path().to_path_buf(),
            source: chart,
            grid: TileGrid::new(w, h, 64),
            max_level: 2,
        }
    }

    fn tile(index: i32) -> TileRect {
        TileRect::new((index % 4) * 64, (index / 4) * 64, 64, 64)
    }

    fn schedule(pool: &CompressionWorkerPool, client: &JobClient, index: i32) -> ScheduleOutcome {
        pool.schedule_job(client, &tile(index), 0, ColorScheme::Day, true, false, false)
            .unwrap()
    }

    fn sinks(client: &JobClient) -> HashMap<FactoryId, RecordingSink> {
        HashMap::from([(client.id, RecordingSink::default())])
    }

    #[test]
    fn test_third_job_waits_for_free_slot() {
        let pool = pool(2);
        let client = client(&pool, TestChart::shared("/charts/a.kap", 256, 256));

        assert!(matches!(schedule(&pool, &client, 0), ScheduleOutcome::Started));
        assert!(matches!(schedule(&pool, &client, 1), ScheduleOutcome::Started));
        assert!(matches!(schedule(&pool, &client, 2), ScheduleOutcome::Queued));
        assert_eq!(pool.running_job_count(), 2);
        assert_eq!(pool.queued_job_count(), 1);

        let mut sinks = sinks(&client);
        let event = pool.recv_event(WAIT).expect("job completion");
        assert!(event.ticket.index() == 0 || event.ticket.index() == 1);
        assert!(pool.on_evt_thread(event, &mut sinks));

        assert_eq!(pool.running_job_count(), 2);
        assert_eq!(pool.queued_job_count(), 0);
        assert_eq!(pool.stats().started, 3);
        assert_eq!(
            pool.ticket_state(client.id, 2, ColorScheme::Day),
            Some(TicketState::Running)
        );
    }

    #[test]
    fn test_running_list_never_exceeds_max_jobs() {
        let pool = pool(3);
        let client = client(&pool, TestChart::shared("/charts/a.kap", 256, 256));
        let mut sinks = sinks(&client);

        for i in 0..16 {
            assert!(schedule(&pool, &client, i).accepted());
            assert!(pool.running_job_count() <= 3);
        }

        let mut handled = 0;
        while handled < 16 {
            let n = pool.wait_and_dispatch(&mut sinks, WAIT);
            assert!(n > 0, "timed out waiting for jobs");
            handled += n;
            assert!(pool.running_job_count() <= 3);
        }

        let sink = &sinks[&client.id];
        assert_eq!(sink.completed.len(), 16);
        assert!(sink.completed.iter().all(|(_, _, levels)| levels == &vec![0, 1, 2]));
        assert_eq!(pool.stats().started, 16);
        assert_eq!(pool.running_job_count(), 0);
    }

    #[test]
    fn test_duplicate_request_refused() {
        let pool = pool(1);
        let client = client(&pool, TestChart::shared("/charts/a.kap", 256, 256));

        assert!(schedule(&pool, &client, 0).accepted());
        assert!(schedule(&pool, &client, 1).accepted());
        assert!(!schedule(&pool, &client, 0).accepted());
        assert!(!schedule(&pool, &client, 1).accepted());

        // A different scheme is different work.
        let other = pool
            .schedule_job(&client, &tile(1), 0, ColorScheme::Night, true, false, false)
            .unwrap();
        assert!(other.accepted());
        assert_eq!(pool.stats().refused, 2);
    }

    #[test]
    fn test_purge_job_list_by_chart_path() {
        let pool = pool(1);
        let a = client(&pool, TestChart::shared("/charts/a.kap", 256, 256));
        let b = client(&pool, TestChart::shared("/charts/b.kap", 256, 256));

        assert!(matches!(schedule(&pool, &a, 0), ScheduleOutcome::Started));
        schedule(&pool, &a, 1);
        schedule(&pool, &b, 0);
        schedule(&pool, &a, 2);
        assert_eq!(pool.queued_job_count(), 3);

        let removed = pool.purge_job_list(Some(Path::new("/charts/a.kap")));
        assert_eq!(removed, 2);
        assert_eq!(pool.stats().purged, 2);
        assert_eq!(pool.queued_job_count(), 1);
        assert!(pool.as_job(Path::new("/charts/b.kap")));
        assert!(!pool.as_job(Path::new("/charts/a.kap")));

        // The running job of chart a completes as a no-op and frees its slot.
        let mut sinks: HashMap<FactoryId, RecordingSink> = HashMap::from([
            (a.id, RecordingSink::default()),
            (b.id, RecordingSink::default()),
        ]);
        let event = pool.recv_event(WAIT).unwrap();
        assert_eq!(event.ticket.factory(), a.id);
        assert!(!pool.on_evt_thread(event, &mut sinks));
        assert_eq!(pool.stats().aborted, 1);

        let event = pool.recv_event(WAIT).unwrap();
        assert_eq!(event.ticket.factory(), b.id);
        assert!(pool.on_evt_thread(event, &mut sinks));
        assert!(sinks[&a.id].completed.is_empty());
        assert_eq!(sinks[&b.id].completed.len(), 1);
    }

    #[test]
    fn test_purge_all_charts() {
        let pool = pool(1);
        let a = client(&pool, TestChart::shared("/charts/a.kap", 256, 256));
        let b = client(&pool, TestChart::shared("/charts/b.kap", 256, 256));
        schedule(&pool, &a, 0);
        schedule(&pool, &a, 1);
        schedule(&pool, &b, 1);

        assert_eq!(pool.purge_job_list(None), 2);
        assert_eq!(pool.queued_job_count(), 0);
        assert_eq!(pool.stats().purged, 2);
    }

    #[test]
    fn test_late_event_after_factory_purge_is_noop() {
        let pool = pool(2);
        let client = client(&pool, TestChart::shared("/charts/a.kap", 256, 256));
        schedule(&pool, &client, 0);

        pool.purge_factory(client.id);
        let mut sinks = sinks(&client);
        assert_eq!(pool.wait_and_dispatch(&mut sinks, WAIT), 1);
        assert!(sinks[&client.id].completed.is_empty());
        assert_eq!(pool.running_job_count(), 0);
    }

    #[test]
    fn test_unregistered_factory_never_receives_results() {
        let pool = pool(1);
        let client = client(&pool, TestChart::shared("/charts/a.kap", 256, 256));
        schedule(&pool, &client, 0);
        let event = pool.recv_event(WAIT).unwrap();

        pool.unregister_factory(client.id);
        assert!(!pool.is_registered(client.id));

        let mut sinks = sinks(&client);
        assert!(!pool.on_evt_thread(event, &mut sinks));
        assert!(sinks[&client.id].completed.is_empty());
    }

    #[test]
    fn test_result_held_until_its_factory_dispatches() {
        let pool = pool(1);
        let a = client(&pool, TestChart::shared("/charts/a.kap", 256, 256));
        let b = client(&pool, TestChart::shared("/charts/b.kap", 256, 256));
        schedule(&pool, &b, 0);
        schedule(&pool, &b, 1);

        // Only a's sink is known here; b's results wait for b.
        let mut only_a = sinks(&a);
        let event = pool.recv_event(WAIT).unwrap();
        assert!(!pool.on_evt_thread(event, &mut only_a));
        assert_eq!(pool.stats().held, 1);
        assert_eq!(pool.stats().aborted, 0);
        assert_eq!(pool.running_job_count(), 1);
        assert!(pool.as_job(Path::new("/charts/b.kap")));
        assert!(!schedule(&pool, &b, 0).accepted());

        let mut only_b = sinks(&b);
        let mut handled = 0;
        while handled < 2 {
            let n = pool.wait_and_dispatch(&mut only_b, WAIT);
            assert!(n > 0, "timed out waiting for jobs");
            handled += n;
        }
        assert!(only_a[&a.id].completed.is_empty());
        let mut indices: Vec<usize> = only_b[&b.id].completed.iter().map(|c| c.0).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(pool.stats().held, 0);
        assert!(!pool.as_job(Path::new("/charts/b.kap")));
    }

    #[test]
    fn test_purge_drops_held_results() {
        let pool = pool(1);
        let a = client(&pool, TestChart::shared("/charts/a.kap", 256, 256));
        let b = client(&pool, TestChart::shared("/charts/b.kap", 256, 256));
        schedule(&pool, &b, 0);

        let event = pool.recv_event(WAIT).unwrap();
        assert!(!pool.on_evt_thread(event, &mut sinks(&a)));
        assert_eq!(pool.stats().held, 1);

        assert_eq!(pool.purge_factory(b.id), 0);
        assert_eq!(pool.stats().held, 0);
        assert_eq!(pool.stats().aborted, 1);
        let mut only_b = sinks(&b);
        assert_eq!(pool.dispatch_pending(&mut only_b), 0);
        assert!(only_b[&b.id].completed.is_empty());
    }

    #[test]
    fn test_failed_job_releases_slot() {
        let pool = pool(1);
        let chart = TestChart::with_mode("/charts/bad.kap", 256, 256, SourceMode::Fail);
        let client = client(&pool, Arc::new(chart));
        schedule(&pool, &client, 0);
        schedule(&pool, &client, 1);

        let mut sinks = sinks(&client);
        let mut handled = 0;
        while handled < 2 {
            let n = pool.wait_and_dispatch(&mut sinks, WAIT);
            assert!(n > 0, "timed out waiting for jobs");
            handled += n;
        }
        assert_eq!(pool.stats().aborted, 2);
        assert_eq!(pool.running_job_count(), 0);
        assert!(sinks[&client.id].completed.is_empty());
        assert_eq!(pool.ticket_state(client.id, 0, ColorScheme::Day), None);
    }

    #[test]
    fn test_panicking_source_does_not_kill_pool() {
        let pool = pool(1);
        let chart = TestChart::with_mode("/charts/panic.kap", 256, 256, SourceMode::Panic);
        let client = client(&pool, Arc::new(chart));
        schedule(&pool, &client, 0);

        let event = pool.recv_event(WAIT).unwrap();
        assert!(event.result.is_err());
        let mut bad_sinks = sinks(&client);
        assert!(!pool.on_evt_thread(event, &mut bad_sinks));

        let good = self::client(&pool, TestChart::shared("/charts/ok.kap", 256, 256));
        schedule(&pool, &good, 0);
        let mut good_sinks = sinks(&good);
        assert_eq!(pool.wait_and_dispatch(&mut good_sinks, WAIT), 1);
        assert_eq!(good_sinks[&good.id].completed.len(), 1);
    }

    #[test]
    fn test_immediate_job_runs_on_caller() {
        let pool = pool(2);
        let client = client(&pool, TestChart::shared("/charts/a.kap", 256, 256));

        let outcome = pool
            .schedule_job(&client, &tile(5), 1, ColorScheme::Dusk, false, true, true)
            .unwrap();
        let ScheduleOutcome::Completed(output) = outcome else {
            panic!("expected synchronous completion");
        };
        assert_eq!(output.levels.iter().map(|l| l.level).collect::<Vec<_>>(), vec![1, 2]);
        assert!(output.levels.iter().all(|l| l.zipped.is_some()));
        // 32x32 DXT1 at level 1
        assert_eq!(output.levels[0].data.len(), 8 * 8 * 8);
        assert_eq!(pool.running_job_count(), 0);
        assert_eq!(pool.stats().started, 0);
    }

    #[test]
    fn test_pool_without_workers_is_synchronous() {
        let pool = pool(0);
        let client = client(&pool, TestChart::shared("/charts/a.kap", 256, 256));
        let outcome = schedule(&pool, &client, 0);
        assert!(matches!(outcome, ScheduleOutcome::Completed(_)));
        assert!(!pool.start_top_job());
    }

    #[test]
    fn test_out_of_range_requests_rejected() {
        let pool = pool(1);
        let client = client(&pool, TestChart::shared("/charts/a.kap", 256, 256));
        let result = pool.schedule_job(
            &client,
            &TileRect::new(256, 0, 64, 64),
            0,
            ColorScheme::Day,
            true,
            false,
            false,
        );
        assert!(matches!(result, Err(TexCacheError::OutOfBounds { .. })));

        let result = pool.schedule_job(&client, &tile(0), 3, ColorScheme::Day, true, false, false);
        assert!(matches!(result, Err(TexCacheError::InvalidLevel { .. })));
    }

    #[test]
    fn test_shutdown_drops_everything() {
        let pool = pool(1);
        let client = client(&pool, TestChart::shared("/charts/a.kap", 256, 256));
        schedule(&pool, &client, 0);
        schedule(&pool, &client, 1);

        pool.shutdown();
        assert_eq!(pool.queued_job_count(), 0);
        assert!(!pool.is_registered(client.id));

        let mut sinks = sinks(&client);
        pool.wait_and_dispatch(&mut sinks, WAIT);
        assert!(sinks[&client.id].completed.is_empty());
    }
}
