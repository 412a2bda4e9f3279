//! Integration tests driving whole frame loops on the soft backend.

use glam::Vec4;
use gridflow_core::{Config, OrchestrationMode, UploadSettings};
use gridflow_frame::soft::{Completion, SoftDevice, SoftQueue, SoftSwapchain};
use gridflow_frame::{
    CommandRecorder, DevicePlacement, FramePipeline, GpuQueue, PresentOutcome, QueueProvider,
    QueueRole, Session,
};
use proptest::prelude::*;

const CLEAR: Vec4 = Vec4::new(0.1, 0.2, 0.3, 1.0);

fn pipeline(
    frame_count: usize,
    completion: Completion,
) -> (SoftQueue, FramePipeline<SoftQueue, SoftSwapchain>) {
    let queue = SoftQueue::new(QueueRole::Render, completion);
    let swapchain = SoftSwapchain::new(queue.clone(), 3, 2);
    let pipeline =
        FramePipeline::new(queue.clone(), swapchain, frame_count, &UploadSettings::default())
            .expect("Failed to create pipeline");
    (queue, pipeline)
}

fn config(mode: OrchestrationMode, dedicated_device: bool) -> Config {
    let mut config = Config::default();
    config.queues.mode = mode;
    config.soft_gpu.dedicated_device = dedicated_device;
    config.soft_gpu.dedicated_queue = true;
    config.soft_gpu.frame_cost_us = 200;
    config.soft_gpu.grid_cost_us = 300;
    config
}

/// One frame of the demo loop: simulation step, handoff, draw.
fn run_frame(
    session: &mut Session<SoftDevice, SoftSwapchain>,
    frame: u64,
    full_sync: bool,
) -> PresentOutcome {
    session.begin_frame(CLEAR).unwrap();

    session.profile_begin("update");
    let proxy = if session.update_begin(1.0 / 60.0).unwrap() {
        session.recorder().unwrap().barrier();
        session.upload(&[frame as f32; 64]).unwrap();
        Some(session.publish(frame))
    } else {
        None
    };
    session.update_end().unwrap();
    session.profile_end("update").unwrap();

    session.pre_draw_begin().unwrap();
    session.pre_draw_end().unwrap();

    session.draw_begin().unwrap();
    if let Some(proxy) = &proxy {
        assert_eq!(*session.acquire(proxy).unwrap(), frame);
    }
    session.reserve_descriptors(16).unwrap();
    session.recorder().unwrap().barrier();
    session.draw_end().unwrap();

    session.end_frame(full_sync).unwrap()
}

#[test]
fn test_in_flight_never_exceeds_frame_count_timed() {
    let queue = SoftQueue::with_cost(
        QueueRole::Render,
        Completion::Timed,
        std::time::Duration::from_micros(500),
    );
    let swapchain = SoftSwapchain::new(queue.clone(), 3, 2);
    let mut pipeline =
        FramePipeline::new(queue.clone(), swapchain, 3, &UploadSettings::default()).unwrap();

    for _ in 0..40 {
        pipeline.frame_start(CLEAR).unwrap();
        pipeline.frame_present(false).unwrap();
        assert!(pipeline.unfinished_frames().unwrap() <= 3);
    }
    pipeline.wait_for_all_frames().unwrap();
    assert!(queue.stats().max_in_flight <= 3);
    assert_eq!(queue.stats().submissions, 40);
}

#[test]
fn test_sessions_run_in_every_mode() {
    for (mode, dedicated_device) in [
        (OrchestrationMode::Unified, false),
        (OrchestrationMode::InterQueue, false),
        (OrchestrationMode::MultiGpu, true),
    ] {
        let config = config(mode, dedicated_device);
        let device = SoftDevice::new(&config.soft_gpu, Completion::Timed);
        let mut session = Session::new(&device, device.swapchain(3), &config).unwrap();
        assert_eq!(session.mode(), mode);

        for frame in 0..30 {
            run_frame(&mut session, frame, false);
        }
        session.shutdown().unwrap();

        assert_eq!(session.pipeline().frame_id(), 30);
        assert!(session.orchestrator().stats().steps > 0);
        assert!(!session.profiler().report().is_empty());
    }
}

#[test]
fn test_mode_switch_at_scene_transition() {
    let config = config(OrchestrationMode::InterQueue, true);
    let device = SoftDevice::new(&config.soft_gpu, Completion::Timed);
    let mut session = Session::new(&device, device.swapchain(3), &config).unwrap();

    let modes = [
        OrchestrationMode::MultiGpu,
        OrchestrationMode::Unified,
        OrchestrationMode::InterQueue,
    ];
    let mut frame = 0;
    for mode in modes {
        for _ in 0..9 {
            run_frame(&mut session, frame, false);
            frame += 1;
        }
        run_frame(&mut session, frame, true);
        frame += 1;
        assert_eq!(session.pipeline_mut().unfinished_frames().unwrap(), 0);

        assert_eq!(session.reconfigure(&device, mode).unwrap(), mode);
        assert_eq!(session.mode(), mode);
    }
    session.shutdown().unwrap();
    assert_eq!(session.orchestrator().generation(), 4);
}

#[test]
fn test_simulation_skips_while_render_continues() {
    // OnWait grid work never retires on its own, so the grid queue stays at
    // its cap until something waits on it.
    let config = config(OrchestrationMode::InterQueue, false);
    let device = SoftDevice::new(&config.soft_gpu, Completion::OnWait);
    let mut session = Session::new(&device, device.swapchain(3), &config).unwrap();

    for frame in 0..10 {
        session.begin_frame(CLEAR).unwrap();
        if session.update_begin(0.01).unwrap() {
            session.publish(frame);
        }
        session.update_end().unwrap();
        session.end_frame(false).unwrap();
    }

    let stats = session.orchestrator().stats();
    assert_eq!(stats.steps, config.queues.max_aux_in_flight);
    assert_eq!(stats.skipped_steps, 10 - config.queues.max_aux_in_flight);
    assert_eq!(session.pipeline().frame_id(), 10);

    session.shutdown().unwrap();
    assert!(session.update_begin(0.01).unwrap());
    session.update_end().unwrap();
}

#[test]
fn test_proxy_visible_after_producer_retires() {
    let config = config(OrchestrationMode::InterQueue, false);
    let device = SoftDevice::new(&config.soft_gpu, Completion::OnWait);
    let mut session = Session::new(&device, device.swapchain(3), &config).unwrap();

    session.begin_frame(CLEAR).unwrap();
    assert!(session.update_begin(0.01).unwrap());
    let proxy = session.publish(vec![1u8, 2, 3]);
    session.update_end().unwrap();
    assert_eq!(session.try_get(&proxy).unwrap(), None);

    session.draw_begin().unwrap();
    session.acquire(&proxy).unwrap();
    session.draw_end().unwrap();
    session.end_frame(true).unwrap();

    assert_eq!(
        session.try_get(&proxy).unwrap().map(Vec::as_slice),
        Some(&[1u8, 2, 3][..])
    );
    let grid = device
        .queue(QueueRole::Grid, DevicePlacement::Primary)
        .unwrap();
    assert_eq!(grid.completed_value().unwrap(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_at_most_n_frames_submitted(
        frame_count in 1usize..=4,
        syncs in prop::collection::vec(prop::bool::weighted(0.1), 1..48),
    ) {
        let (queue, mut pipeline) = pipeline(frame_count, Completion::OnWait);
        for full_sync in syncs {
            pipeline.frame_start(CLEAR).unwrap();
            pipeline.frame_present(full_sync).unwrap();
            prop_assert!(pipeline.unfinished_frames().unwrap() <= frame_count);
        }
        prop_assert!(queue.stats().max_in_flight <= frame_count as u64);
    }

    #[test]
    fn prop_wait_for_frames_respects_bound(
        max_in_flight in 2usize..=6,
        frames in 1usize..32,
    ) {
        let (_, mut pipeline) = pipeline(6, Completion::OnWait);
        for _ in 0..frames {
            pipeline.wait_for_frames(max_in_flight).unwrap();
            prop_assert!(pipeline.unfinished_frames().unwrap() < max_in_flight);
            pipeline.frame_start(CLEAR).unwrap();
            pipeline.frame_present(false).unwrap();
        }
    }
}
