//! Renderer frame lifecycle tests
//!
//! Drives a full [`Renderer`] with the built-in pipeline over the dummy
//! backend: presentation order, skipped frames, swapchain recreation,
//! deferred destruction and teardown.

mod common;

use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3};
use rstest::rstest;

use redlilium_render::backend::{
    AcquireOutcome, DummyBackend, GpuCommand, ObjectKind, PresentOutcome, Vertex,
};
use redlilium_render::scene::{Camera, SceneRawData};
use redlilium_render::{FrameOutcome, LoadError, Renderer};

fn renderer() -> (Arc<DummyBackend>, Renderer) {
    common::init_logging();
    let backend = Arc::new(DummyBackend::new(3));
    let mut renderer = Renderer::new(backend.clone(), common::config()).unwrap();
    renderer
        .build_default_pipeline(common::default_shaders())
        .unwrap();
    (backend, renderer)
}

fn scene_with_meshes(count: usize) -> SceneRawData {
    let vertices: Vec<Vertex> = [Vec3::ZERO, Vec3::X, Vec3::Y]
        .into_iter()
        .map(|p| Vertex::new(p, Vec3::Z, Vec2::ZERO))
        .collect();
    let mut scene = SceneRawData::new();
    for _ in 0..count {
        scene.add_mesh(&vertices, &[0, 1, 2], Mat4::IDENTITY, Default::default());
    }
    scene
}

/// Commands of the most recent frame submission.
fn last_frame_commands(backend: &DummyBackend) -> Vec<GpuCommand> {
    let submissions = backend.submissions();
    let last = submissions.last().expect("nothing submitted");
    last.command_buffers
        .iter()
        .flat_map(|cmd| backend.commands(*cmd))
        .collect()
}

#[rstest]
#[case::empty(0, 0)]
#[case::one_mesh(1, 2)]
#[case::three_meshes(3, 6)]
fn test_frames_present_in_ring(#[case] meshes: usize, #[case] indexed_draws: usize) {
    let (backend, mut renderer) = renderer();
    let camera = Camera::default();
    let scene = scene_with_meshes(meshes);

    for _ in 0..5 {
        assert_eq!(
            renderer.render_frame(&camera, &scene).unwrap(),
            FrameOutcome::Presented
        );
    }
    assert_eq!(backend.presented_images(), vec![0, 1, 2, 0, 1]);
    assert_eq!(renderer.frame_index(), 2);

    let commands = last_frame_commands(&backend);
    let draws = commands
        .iter()
        .filter(|c| matches!(c, GpuCommand::DrawIndexed { .. }))
        .count();
    let passes = commands
        .iter()
        .filter(|c| matches!(c, GpuCommand::BeginRenderPass { .. }))
        .count();
    // prepass and forward draw every mesh; composite is one triangle
    assert_eq!(draws, indexed_draws);
    assert_eq!(passes, 3);
}

#[test]
fn test_hung_fence_skips_frame() {
    let (backend, mut renderer) = renderer();
    let camera = Camera::default();
    let scene = SceneRawData::new();
    renderer.render_frame(&camera, &scene).unwrap();

    backend.set_fences_hang(true);
    assert_eq!(
        renderer.render_frame(&camera, &scene).unwrap(),
        FrameOutcome::Skipped
    );
    assert_eq!(backend.presented_images().len(), 1);
    assert_eq!(renderer.frame_index(), 1);

    backend.set_fences_hang(false);
    assert_eq!(
        renderer.render_frame(&camera, &scene).unwrap(),
        FrameOutcome::Presented
    );
    assert_eq!(backend.presented_images().len(), 2);
}

#[rstest]
#[case::acquire_out_of_date(Some(AcquireOutcome::OutOfDate), None)]
#[case::present_suboptimal(None, Some(PresentOutcome::Suboptimal))]
#[case::present_out_of_date(None, Some(PresentOutcome::OutOfDate))]
fn test_stale_swapchain_is_recreated(
    #[case] acquire: Option<AcquireOutcome>,
    #[case] present: Option<PresentOutcome>,
) {
    let (backend, mut renderer) = renderer();
    let camera = Camera::default();
    let scene = SceneRawData::new();
    renderer.render_frame(&camera, &scene).unwrap();
    let color = renderer.frame_output_texture().unwrap();

    if let Some(outcome) = acquire {
        backend.push_acquire_outcome(outcome);
    }
    if let Some(outcome) = present {
        backend.push_present_outcome(outcome);
    }
    assert_eq!(
        renderer.render_frame(&camera, &scene).unwrap(),
        FrameOutcome::Resized {
            width: 800,
            height: 600
        }
    );
    assert_eq!(backend.swapchain_recreations(), 1);
    assert_eq!(renderer.frame_output_texture(), Some(color));

    assert_eq!(
        renderer.render_frame(&camera, &scene).unwrap(),
        FrameOutcome::Presented
    );
}

#[test]
fn test_resized_images_are_destroyed_after_the_ring_moves_on() {
    let (backend, mut renderer) = renderer();
    let camera = Camera::default();
    let scene = SceneRawData::new();
    renderer.render_frame(&camera, &scene).unwrap();
    let color = renderer.frame_output_texture().unwrap();
    let old_image = renderer.device().texture(color).image;

    renderer.resize(1024, 768).unwrap();
    assert!(backend.is_live(old_image));
    assert_eq!(
        renderer.render_frame(&camera, &scene).unwrap(),
        FrameOutcome::Resized {
            width: 1024,
            height: 768
        }
    );

    for _ in 0..3 {
        assert_eq!(
            renderer.render_frame(&camera, &scene).unwrap(),
            FrameOutcome::Presented
        );
    }
    renderer.device().collector().collect();
    assert!(!backend.is_live(old_image));
    assert_eq!(backend.destroy_count(old_image), 1);
    assert_eq!(renderer.device().texture(color).extent(), (1024, 768));
}

#[test]
fn test_loaded_texture_is_sampled_by_the_graph() {
    let (backend, mut renderer) = renderer();
    let loader = renderer.loader().expect("loader is running");
    let handle = loader.upload(vec![255; 4 * 4 * 4], 4, 4).wait().unwrap();
    assert_eq!(
        loader.upload(vec![0; 5], 4, 4).wait(),
        Err(LoadError::SizeMismatch {
            expected: 64,
            actual: 5
        })
    );

    assert!(renderer.graph_mut().import_texture("logo", handle));
    renderer
        .render_frame(&Camera::default(), &SceneRawData::new())
        .unwrap();
    assert!(backend.is_live(renderer.device().texture(handle).image));

    renderer.shutdown();
    assert!(renderer.loader().is_none());
    assert_eq!(backend.live_count(ObjectKind::Image), 0);
}

#[test]
fn test_shutdown_leaves_nothing_behind() {
    let (backend, mut renderer) = renderer();
    let camera = Camera::default();
    let scene = scene_with_meshes(2);
    for _ in 0..4 {
        renderer.render_frame(&camera, &scene).unwrap();
    }
    renderer.resize(640, 480).unwrap();
    renderer.render_frame(&camera, &scene).unwrap();

    renderer.shutdown();
    for kind in [
        ObjectKind::Buffer,
        ObjectKind::Image,
        ObjectKind::Framebuffer,
        ObjectKind::RenderPass,
        ObjectKind::Pipeline,
        ObjectKind::PipelineLayout,
    ] {
        assert_eq!(backend.live_count(kind), 0, "{:?} leaked", kind);
    }
    assert_eq!(backend.double_destroys(), 0);
    assert!(backend.wait_idle_calls() > 0);

    // idempotent, and dropping afterwards must not destroy anything twice
    renderer.shutdown();
    drop(renderer);
    assert_eq!(backend.double_destroys(), 0);
}
