use riven::{Engine, FrameStage, RiftHints, StageCallbacks, Tear};
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const DEMO_FRAME_LIMIT: u64 = 128;
const PARTICLES_PER_FRAME: usize = 4096;
const PARTICLE_BATCHES: usize = 16;

fn load_hints() -> Result<RiftHints, Box<dyn std::error::Error>> {
    let mut hints = match std::env::args().nth(1) {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(&path)?)?,
        None => RiftHints::default(),
    };
    if hints.debug_frame_limit == 0 {
        hints.debug_frame_limit = DEMO_FRAME_LIMIT;
    }
    Ok(hints)
}

fn simulate(ctx: &riven::Context<'_>, stage: &FrameStage) {
    let Some(output) = stage.output_tag else {
        return;
    };
    let batch = PARTICLES_PER_FRAME / PARTICLE_BATCHES;
    let tears = (0..PARTICLE_BATCHES).map(|index| {
        Tear::new("particles", move |ctx| {
            let Ok(memory) = ctx.alloc(batch * size_of::<[f32; 4]>(), 16, output) else {
                log::warn!("particle batch {index}: tagged heap exhausted");
                return;
            };
            let particles = memory.cast::<[f32; 4]>().as_ptr();
            for i in 0..batch {
                let x = (index * batch + i) as f32;
                // SAFETY: the block holds `batch` particles and is private to this tear.
                unsafe { particles.add(i).write([x, x * 0.5, 0.0, 1.0]) };
            }
        })
    });
    if let Err(err) = ctx.split_and_unchain(tears) {
        log::error!("frame {}: simulation split failed: {err}", stage.frame);
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let hints = match load_hints() {
        Ok(hints) => hints,
        Err(err) => {
            log::error!("failed to load hints: {err}");
            return ExitCode::FAILURE;
        }
    };

    let rendered = Arc::new(AtomicU64::new(0));
    let submitted = Arc::new(AtomicU64::new(0));
    let render_count = Arc::clone(&rendered);
    let submit_count = Arc::clone(&submitted);

    let callbacks = StageCallbacks::new(
        simulate,
        move |_, stage: &FrameStage| {
            if let Some(tag) = stage.input_tag {
                let bytes: usize = (0..stage.heap.thread_count())
                    .map(|worker| stage.heap.usage(tag.for_worker(worker)).bytes_used)
                    .sum();
                log::trace!("frame {}: rendering {bytes} bytes of particles", stage.frame);
            }
            render_count.fetch_add(1, Ordering::Relaxed);
        },
        move |_, stage: &FrameStage| {
            log::trace!("frame {}: submitted after {:?}", stage.frame, stage.delta);
            submit_count.fetch_add(1, Ordering::Relaxed);
        },
    );

    let engine = match Engine::new(&hints, callbacks) {
        Ok(engine) => engine,
        Err(err) => {
            log::error!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    log::info!("starting frame pipeline with {:?}", engine.config());

    match engine.run() {
        Ok(report) => {
            log::info!(
                "{} frames simulated, {} rendered, {} submitted",
                report.frames_simulated,
                rendered.load(Ordering::Relaxed),
                submitted.load(Ordering::Relaxed)
            );
            if !report.trace.is_empty() {
                if let Err(err) = riven::tracing::export_to_file(&report.trace, "riven_trace.json") {
                    log::warn!("failed to write trace: {err}");
                }
            }
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(err) => log::warn!("failed to serialize report: {err}"),
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("frame pipeline failed: {err}");
            ExitCode::from(err.code().unsigned_abs() as u8)
        }
    }
}
