//! Frame pipeline driver.
//!
//! The driver runs as the rift's entry tear. Every iteration it fans out
//! simulation of frame `f`, rendering of frame `f - 1` and GPU execution of
//! frame `f - 2` in one `split_and_unchain`, so the three stages of different
//! frames overlap while each frame still goes through them in order.
//!
//! Stage data moves between stages through rotating tags:
//!
//! | ring | written by | freed by |
//! |---|---|---|
//! | `SIMULATION` | simulation | rendering, after its callback |
//! | `RENDERING` | rendering | GPU execution, after its callback |
//! | `FRAME_SHARED` | any stage | GPU execution, after its callback |
//! | `GPU_EXEC` | GPU execution, as scratch | GPU execution, after its callback |

use crate::allocator::{HeapConfig, TaggedHeap};
use crate::context::Context;
use crate::error::{Result, RivenError};
use crate::metrics::StatsSnapshot;
use crate::rift::{Rift, RiftConfig, RiftHints, RiftMemory};
use crate::tag::{FrameTagRing, MemoryTag};
use crate::tear::Tear;
use crate::tracing::TraceEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// A stage callback. Runs on a fiber and may split further work.
pub type StageFn = Arc<dyn Fn(&Context<'_>, &FrameStage) + Send + Sync>;

/// The three callbacks a pipeline needs. All are required.
#[derive(Clone, Default)]
pub struct StageCallbacks {
    pub simulation: Option<StageFn>,
    pub rendering: Option<StageFn>,
    pub gpu_exec: Option<StageFn>,
}

impl StageCallbacks {
    pub fn new<S, R, G>(simulation: S, rendering: R, gpu_exec: G) -> Self
    where
        S: Fn(&Context<'_>, &FrameStage) + Send + Sync + 'static,
        R: Fn(&Context<'_>, &FrameStage) + Send + Sync + 'static,
        G: Fn(&Context<'_>, &FrameStage) + Send + Sync + 'static,
    {
        StageCallbacks {
            simulation: Some(Arc::new(simulation)),
            rendering: Some(Arc::new(rendering)),
            gpu_exec: Some(Arc::new(gpu_exec)),
        }
    }

    fn resolve(&self) -> Result<[StageFn; 3]> {
        let simulation = self
            .simulation
            .clone()
            .ok_or(RivenError::MissingCallback("simulation"))?;
        let rendering = self
            .rendering
            .clone()
            .ok_or(RivenError::MissingCallback("rendering"))?;
        let gpu_exec = self
            .gpu_exec
            .clone()
            .ok_or(RivenError::MissingCallback("gpu_exec"))?;
        Ok([simulation, rendering, gpu_exec])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Initializing,
    Running,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageKind {
    Simulation,
    Rendering,
    GpuExec,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            StageKind::Simulation => "simulation",
            StageKind::Rendering => "rendering",
            StageKind::GpuExec => "gpu_exec",
        }
    }
}

/// Stop signals shared between the driver, its callbacks and other threads.
#[derive(Clone, Debug, Default)]
pub struct PipelineControl {
    stop: Arc<AtomicBool>,
    exit: Arc<AtomicBool>,
}

impl PipelineControl {
    /// Stops issuing new frames; frames already in flight finish.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Terminates at the next iteration, abandoning frames in flight.
    pub fn force_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn exit_forced(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }
}

/// Everything a stage callback gets to know about its frame.
#[derive(Clone)]
pub struct FrameStage {
    pub kind: StageKind,
    pub frame: u64,
    /// Time between the start of this iteration and the previous one.
    pub delta: Duration,
    /// Tag holding the previous stage's output for this frame.
    pub input_tag: Option<MemoryTag>,
    /// Tag this stage writes. Simulation and rendering hand it to the next
    /// stage; for GPU execution it is scratch freed when the callback returns.
    pub output_tag: Option<MemoryTag>,
    /// Tag living from simulation to GPU execution of this frame.
    pub shared_tag: MemoryTag,
    pub heap: Arc<TaggedHeap>,
    pub control: PipelineControl,
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub frames_simulated: u64,
    pub frames_rendered: u64,
    pub frames_executed: u64,
    /// Every state the driver went through, in order.
    pub history: Vec<PipelineState>,
    pub forced_exit: bool,
    pub stats: StatsSnapshot,
    /// Tear spans, when the hints enabled tracing.
    #[serde(skip)]
    pub trace: Vec<TraceEvent>,
}

/// The driver state machine. Runs inside a fiber.
pub struct FramePipeline {
    callbacks: [StageFn; 3],
    heap: Arc<TaggedHeap>,
    simulation_ring: FrameTagRing,
    rendering_ring: FrameTagRing,
    shared_ring: FrameTagRing,
    gpu_ring: FrameTagRing,
    control: PipelineControl,
    frame_limit: Option<u64>,
    state: PipelineState,
    history: Vec<PipelineState>,
    simulated: u64,
    rendered: u64,
    executed: u64,
}

impl FramePipeline {
    pub fn new(
        config: &RiftConfig,
        callbacks: &StageCallbacks,
        heap: Arc<TaggedHeap>,
        control: PipelineControl,
    ) -> Result<Self> {
        let cycle = config.frames_in_flight;
        Ok(FramePipeline {
            callbacks: callbacks.resolve()?,
            heap,
            simulation_ring: FrameTagRing::new(MemoryTag::SIMULATION, cycle)?,
            rendering_ring: FrameTagRing::new(MemoryTag::RENDERING, cycle)?,
            shared_ring: FrameTagRing::new(MemoryTag::FRAME_SHARED, cycle)?,
            gpu_ring: FrameTagRing::new(MemoryTag::GPU_EXEC, cycle)?,
            control,
            frame_limit: config.debug_frame_limit,
            state: PipelineState::Initializing,
            history: vec![PipelineState::Initializing],
            simulated: 0,
            rendered: 0,
            executed: 0,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn transition(&mut self, next: PipelineState) {
        log::debug!("frame pipeline: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Runs frames until the pipeline terminates.
    pub fn drive(mut self, ctx: &Context<'_>) -> PipelineReport {
        self.transition(PipelineState::Running);
        let mut last_tick = Instant::now();
        let mut forced_exit = false;

        loop {
            if self.control.exit_forced() {
                log::warn!(
                    "frame pipeline forced to exit with {} frame(s) in flight",
                    self.simulated - self.executed
                );
                forced_exit = true;
                break;
            }
            if self.state == PipelineState::Running {
                let limit_reached = self.frame_limit.is_some_and(|limit| self.simulated >= limit);
                if limit_reached || self.control.stop_requested() {
                    self.transition(PipelineState::Draining);
                }
            }

            let simulate = self.state == PipelineState::Running;
            let render = self.rendered < self.simulated;
            let execute = self.executed < self.rendered;
            if !simulate && !render && !execute {
                break;
            }

            let now = Instant::now();
            let delta = now - last_tick;
            last_tick = now;

            let mut tears = Vec::with_capacity(3);
            if simulate {
                tears.push(self.stage_tear(StageKind::Simulation, self.simulated, delta));
            }
            if render {
                tears.push(self.stage_tear(StageKind::Rendering, self.rendered, delta));
            }
            if execute {
                tears.push(self.stage_tear(StageKind::GpuExec, self.executed, delta));
            }
            if let Err(err) = ctx.split_and_unchain(tears) {
                log::error!("frame pipeline failed to split stage work: {err}");
                break;
            }

            self.simulated += u64::from(simulate);
            self.rendered += u64::from(render);
            self.executed += u64::from(execute);
        }

        let rings = [
            &self.simulation_ring,
            &self.rendering_ring,
            &self.shared_ring,
            &self.gpu_ring,
        ];
        for ring in rings {
            for tag in ring.tags() {
                self.heap.free(tag);
            }
        }
        self.transition(PipelineState::Terminated);
        log::info!(
            "frame pipeline terminated after {} frame(s)",
            self.executed
        );

        PipelineReport {
            frames_simulated: self.simulated,
            frames_rendered: self.rendered,
            frames_executed: self.executed,
            history: self.history,
            forced_exit,
            stats: StatsSnapshot::default(),
            trace: Vec::new(),
        }
    }

    fn stage_tear(&self, kind: StageKind, frame: u64, delta: Duration) -> Tear {
        let simulation_tag = self.simulation_ring.tag_for(frame);
        let rendering_tag = self.rendering_ring.tag_for(frame);
        let (callback, input_tag, output_tag) = match kind {
            StageKind::Simulation => (&self.callbacks[0], None, Some(simulation_tag)),
            StageKind::Rendering => (&self.callbacks[1], Some(simulation_tag), Some(rendering_tag)),
            StageKind::GpuExec => (
                &self.callbacks[2],
                Some(rendering_tag),
                Some(self.gpu_ring.tag_for(frame)),
            ),
        };
        let stage = FrameStage {
            kind,
            frame,
            delta,
            input_tag,
            output_tag,
            shared_tag: self.shared_ring.tag_for(frame),
            heap: Arc::clone(&self.heap),
            control: self.control.clone(),
        };
        let callback = Arc::clone(callback);

        Tear::new(kind.name(), move |ctx| {
            callback(ctx, &stage);
            match stage.kind {
                StageKind::Simulation => {}
                StageKind::Rendering => {
                    if let Some(tag) = stage.input_tag {
                        stage.heap.free(tag);
                    }
                }
                StageKind::GpuExec => {
                    for tag in [stage.input_tag, stage.output_tag].into_iter().flatten() {
                        stage.heap.free(tag);
                    }
                    stage.heap.free(stage.shared_tag);
                }
            }
        })
    }
}

/// A configured engine: rift hints, heap sizing and stage callbacks.
pub struct Engine {
    config: RiftConfig,
    heap_config: HeapConfig,
    callbacks: StageCallbacks,
    control: PipelineControl,
}

impl Engine {
    /// Validates the callbacks, then the hints. Nothing is spawned yet.
    pub fn new(hints: &RiftHints, callbacks: StageCallbacks) -> Result<Self> {
        callbacks.resolve()?;
        Ok(Engine {
            config: RiftConfig::from_hints(hints)?,
            heap_config: HeapConfig::default(),
            callbacks,
            control: PipelineControl::default(),
        })
    }

    pub fn with_heap_config(mut self, heap_config: HeapConfig) -> Self {
        self.heap_config = heap_config;
        self
    }

    pub fn config(&self) -> &RiftConfig {
        &self.config
    }

    /// Handle for stopping the pipeline from a callback or another thread.
    pub fn control(&self) -> PipelineControl {
        self.control.clone()
    }

    /// Bootstraps the rift and runs the pipeline until it terminates.
    pub fn run(self) -> Result<PipelineReport> {
        let heap = Arc::new(TaggedHeap::with_config(
            self.config.thread_count,
            self.heap_config.clone(),
        )?);
        let pipeline = FramePipeline::new(
            &self.config,
            &self.callbacks,
            Arc::clone(&heap),
            self.control.clone(),
        )?;

        let (sender, receiver) = crossbeam::channel::bounded(1);
        let memory = RiftMemory::allocate(&self.config);
        let exit = Rift::bootstrap_with(&self.config, memory, Some(heap), move |ctx| {
            let _ = sender.send(pipeline.drive(ctx));
        })?;

        let mut report = receiver.try_recv().map_err(|_| {
            RivenError::FeatureUnsupported("frame pipeline ended without a report".into())
        })?;
        report.stats = exit.stats;
        report.trace = exit.trace;
        Ok(report)
    }
}
