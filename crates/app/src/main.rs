//! gridflow - Headless Demo Entry Point
//!
//! Runs the frame pipeline with a simulation step on the grid queue and a
//! draw on the render queue, against either the emulated GPU or Vulkan.
//! Every `transition_every` frames the demo fully synchronizes and switches
//! the orchestration mode, like a scene change would.
//!
//! Usage: `gridflow [config.ron]`

use std::path::PathBuf;

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use gridflow_core::{BackendKind, Config, OrchestrationMode};
use gridflow_frame::soft::{Completion, SoftDevice};
use gridflow_frame::{CommandRecorder, PresentOutcome, PresentTarget, QueueProvider, Session};
use gridflow_rhi::VulkanProvider;
use tracing::{debug, info, trace};

/// Fixed simulation step in seconds.
const SIM_DT: f32 = 1.0 / 60.0;

/// Descriptor slots the draw of one frame binds.
const DRAW_DESCRIPTORS: u32 = 32;

/// Back buffers of the emulated swap chain.
const SOFT_BACK_BUFFERS: usize = 3;

/// Parameters uploaded for each simulation step.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct SimParams {
    gravity: Vec4,
    dt: f32,
    step: u32,
    _pad: [u32; 2],
}

/// What a simulation step hands to the draw.
#[derive(Debug)]
struct GridOutput {
    step: u32,
    params_offset: u64,
}

/// Demo state carried across frames.
#[derive(Default)]
struct Demo {
    step: u32,
    presented: u64,
    skipped: u64,
}

/// Mode the next scene runs in.
fn next_mode(mode: OrchestrationMode) -> OrchestrationMode {
    match mode {
        OrchestrationMode::Unified => OrchestrationMode::InterQueue,
        OrchestrationMode::InterQueue => OrchestrationMode::MultiGpu,
        OrchestrationMode::MultiGpu => OrchestrationMode::Unified,
    }
}

fn clear_color(frame: u64) -> Vec4 {
    let t = (frame % 120) as f32 / 120.0;
    Vec4::new(0.1, 0.2 + 0.3 * t, 0.4, 1.0)
}

impl Demo {
    fn frame<D: QueueProvider, P: PresentTarget>(
        &mut self,
        session: &mut Session<D, P>,
        frame: u64,
        full_sync: bool,
    ) -> Result<()> {
        let context = session.begin_frame(clear_color(frame))?;
        trace!(
            "Frame {} in slot {}, fence {}",
            context.frame_id, context.frame_index, context.fence_value
        );

        session.profile_begin("update");
        let output = if session.update_begin(f64::from(SIM_DT))? {
            let params = SimParams {
                gravity: Vec4::new(0.0, -9.81, 0.0, 0.0),
                dt: SIM_DT,
                step: self.step,
                _pad: [0; 2],
            };
            let upload = session.upload(&[params])?;
            // Stands in for the advection and pressure dispatches.
            session.recorder()?.barrier();
            self.step += 1;
            Some(session.publish(GridOutput {
                step: self.step,
                params_offset: upload.offset,
            }))
        } else {
            None
        };
        session.update_end()?;
        session.profile_end("update")?;

        session.pre_draw_begin()?;
        session.recorder()?.barrier();
        session.pre_draw_end()?;

        session.profile_begin("draw");
        session.draw_begin()?;
        if let Some(proxy) = &output {
            let grid = session.acquire(proxy)?;
            trace!(
                "Drawing grid step {} (params at {})",
                grid.step, grid.params_offset
            );
        }
        let slots = session.reserve_descriptors(DRAW_DESCRIPTORS)?;
        trace!("Draw descriptors {}..{}", slots.start, slots.end());
        session.recorder()?.barrier();
        session.draw_end()?;
        session.profile_end("draw")?;

        match session.end_frame(full_sync)? {
            PresentOutcome::Presented => self.presented += 1,
            PresentOutcome::Skipped => self.skipped += 1,
        }
        Ok(())
    }
}

/// Runs the configured number of frames on `provider`.
fn run<D: QueueProvider, P: PresentTarget>(
    provider: &D,
    present: P,
    config: &Config,
) -> Result<()> {
    let mut session = Session::new(provider, present, config)?;
    let mut demo = Demo::default();
    let transition_every = config.frames.transition_every;

    for frame in 0..config.frames.frames {
        let transition = transition_every > 0 && (frame + 1) % transition_every == 0;
        demo.frame(&mut session, frame, transition)?;

        if transition {
            let requested = next_mode(session.orchestrator().requested_mode());
            let mode = session.reconfigure(provider, requested)?;
            info!(
                "Scene transition after frame {}: {} (requested {})",
                frame,
                mode.name(),
                requested.name()
            );
        }
    }
    session.shutdown()?;

    let stats = session.orchestrator().stats();
    info!(
        "{} frames: {} presented, {} skipped; {} simulation steps, {} skipped, {} acquisitions",
        session.pipeline().frame_id(),
        demo.presented,
        demo.skipped,
        stats.steps,
        stats.skipped_steps,
        stats.acquisitions
    );
    if let Some(mean) = session.throttle().mean_frame_time() {
        info!(
            "Mean frame time {:.3} ms, {} frame(s) in flight wanted",
            mean * 1000.0,
            session.throttle().desired_frames_in_flight()
        );
    }
    for sample in session.profiler().report() {
        let gpu = sample
            .gpu_ms
            .map_or_else(|| "-".to_string(), |ms| format!("{ms:.3} ms"));
        info!(
            "{:<8} cpu {:.3} ms, gpu {} ({} scopes)",
            sample.label, sample.cpu_ms, gpu, sample.count
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load_or_default(path.as_deref()).context("Failed to load config")?;

    gridflow_core::init_logging(config.log_filter.as_deref());
    info!(
        "Starting gridflow ({:?} backend, {} frames)",
        config.backend, config.frames.frames
    );
    debug!("{:#?}", config);

    match config.backend {
        BackendKind::Soft => {
            let device = SoftDevice::new(&config.soft_gpu, Completion::Timed);
            run(&device, device.swapchain(SOFT_BACK_BUFFERS), &config)
        }
        BackendKind::Vulkan => {
            let provider =
                VulkanProvider::new(&config.vulkan).context("Failed to initialize Vulkan")?;
            run(&provider, provider.presenter(), &config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes_cycle() {
        let mut mode = OrchestrationMode::Unified;
        for _ in 0..3 {
            mode = next_mode(mode);
        }
        assert_eq!(mode, OrchestrationMode::Unified);
    }

    #[test]
    fn test_sim_params_layout() {
        assert_eq!(std::mem::size_of::<SimParams>(), 32);
    }

    #[test]
    fn test_demo_runs_on_soft_backend() {
        let config = Config::from_ron_str(
            "(frames: (frames: 24, transition_every: 8), \
             soft_gpu: (frame_cost_us: 50, grid_cost_us: 80, dedicated_device: true))",
        )
        .unwrap();
        let device = SoftDevice::new(&config.soft_gpu, Completion::OnWait);
        let mut session = Session::new(&device, device.swapchain(3), &config).unwrap();
        let mut demo = Demo::default();

        for frame in 0..config.frames.frames {
            demo.frame(&mut session, frame, false).unwrap();
        }
        session.shutdown().unwrap();

        assert_eq!(session.pipeline().frame_id(), 24);
        assert_eq!(demo.presented + demo.skipped, 24);
        assert!(demo.step > 0);
    }

    #[test]
    fn test_run_switches_modes() {
        let config =
            Config::from_ron_str("(frames: (frames: 12, transition_every: 4))").unwrap();
        let device = SoftDevice::new(&config.soft_gpu, Completion::OnWait);
        run(&device, device.swapchain(3), &config).unwrap();
    }
}
