//! Render graph integration tests
//!
//! Graphs are built from declarative test passes, compiled against a device
//! on the dummy backend and executed inside real frames.

mod common;

use std::time::Duration;

use common::{
    barriers, color_spec, count_render_passes, sampled_views, TestContext, TestPass, HEIGHT, WIDTH,
};
use rstest::rstest;

use redlilium_render::backend::{
    GpuCommand, ImageLayout, TextureDescriptor, TextureFormat, TextureUsage,
};
use redlilium_render::graph::{RenderGraph, ResolvedInput, TextureSpec};
use redlilium_render::{GraphError, GraphicsError, ResourceLoader};

fn execute(ctx: &mut TestContext, graph: &mut RenderGraph) -> Vec<GpuCommand> {
    ctx.frame(|device, cmd, frame_index, image_index, inputs| {
        graph
            .execute(device, cmd, frame_index, image_index, inputs)
            .expect("execute");
    })
}

#[rstest]
#[case::declared_in_order(false)]
#[case::declared_reversed(true)]
fn test_attachment_consumers_run_after_producers(#[case] reversed: bool) {
    let ctx = TestContext::new();
    let mut graph = RenderGraph::new();
    let producer = TestPass::new("gbuffer").writes("albedo", color_spec());
    let consumer = TestPass::new("decals").continues("albedo");
    if reversed {
        graph.add_pass(consumer).unwrap();
        graph.add_pass(producer).unwrap();
    } else {
        graph.add_pass(producer).unwrap();
        graph.add_pass(consumer).unwrap();
    }

    graph.compile(&ctx.device).unwrap();
    assert_eq!(graph.sorted_passes(), vec!["gbuffer", "decals"]);
    assert_eq!(graph.dependents("gbuffer"), vec!["decals"]);
    assert_eq!(
        graph.resolved_input("decals", "albedo"),
        graph.texture("albedo").map(ResolvedInput::Texture)
    );
}

#[rstest]
#[case::abc(["a", "b", "c"])]
#[case::cba(["c", "b", "a"])]
#[case::bca(["b", "c", "a"])]
#[case::acb(["a", "c", "b"])]
fn test_chain_order_ignores_declaration_order(#[case] order: [&str; 3]) {
    let ctx = TestContext::new();
    let mut graph = RenderGraph::new();
    for name in order {
        let pass = match name {
            "a" => TestPass::new("a").writes("x", color_spec()),
            "b" => TestPass::new("b").continues("x").writes("y", color_spec()),
            _ => TestPass::new("c").continues("y"),
        };
        graph.add_pass(pass).unwrap();
    }

    graph.compile(&ctx.device).unwrap();
    assert_eq!(graph.sorted_passes(), vec!["a", "b", "c"]);
}

#[test]
fn test_depth_handoff_between_passes() {
    let ctx = TestContext::new();
    let mut graph = RenderGraph::new();
    graph
        .add_pass(TestPass::new("prepass").writes(
            "depth",
            TextureSpec::depth(800, 600, TextureFormat::Depth32Float),
        ))
        .unwrap();
    graph.add_pass(TestPass::new("shade").continues("depth")).unwrap();
    graph.compile(&ctx.device).unwrap();

    assert_eq!(graph.sorted_passes(), vec!["prepass", "shade"]);
    let depth = graph.texture("depth").unwrap();
    assert_eq!(
        graph.resolved_input("shade", "depth"),
        Some(ResolvedInput::Texture(depth))
    );
    assert_eq!(ctx.device.texture(depth).extent(), (800, 600));
}

#[test]
fn test_repeated_resize_is_idempotent() {
    let ctx = TestContext::new();
    let mut graph = RenderGraph::new();
    graph.add_pass(TestPass::new("scene").writes("color", color_spec())).unwrap();
    graph
        .add_pass(TestPass::new("post").continues("color").writes("final", color_spec()))
        .unwrap();
    graph.compile(&ctx.device).unwrap();
    let order: Vec<String> = graph.sorted_passes().iter().map(|s| s.to_string()).collect();

    graph.resize(&ctx.device, 1024, 768).unwrap();
    let image = ctx.device.texture(graph.texture("color").unwrap()).image;
    graph.resize(&ctx.device, 1024, 768).unwrap();

    for name in ["color", "final"] {
        let handle = graph.texture(name).unwrap();
        assert_eq!(ctx.device.texture(handle).extent(), (1024, 768));
    }
    // the second resize had nothing to do
    assert_eq!(ctx.device.texture(graph.texture("color").unwrap()).image, image);
    assert_eq!(graph.sorted_passes(), order);
}

#[test]
fn test_cycle_is_rejected() {
    let ctx = TestContext::new();
    let mut graph = RenderGraph::new();
    graph
        .add_pass(TestPass::new("a").writes("a_out", color_spec()).continues("b_out"))
        .unwrap();
    graph
        .add_pass(TestPass::new("b").writes("b_out", color_spec()).continues("a_out"))
        .unwrap();

    let err = graph.compile(&ctx.device).unwrap_err();
    assert!(
        matches!(err, GraphicsError::Graph(GraphError::Cycle(_))),
        "unexpected error: {}",
        err
    );
    assert!(graph.is_dirty());
}

#[test]
fn test_duplicate_pass_name_is_rejected() {
    let mut graph = RenderGraph::new();
    graph.add_pass(TestPass::new("main").writes("color", color_spec())).unwrap();
    let err = graph
        .add_pass(TestPass::new("main").writes("other", color_spec()))
        .unwrap_err();
    assert_eq!(err, GraphicsError::Graph(GraphError::DuplicatePass("main".into())));
    assert_eq!(graph.pass_count(), 1);
}

#[test]
fn test_pass_without_targets_is_rejected() {
    let ctx = TestContext::new();
    let mut graph = RenderGraph::new();
    graph.add_pass(TestPass::new("orphan").samples("color")).unwrap();

    let err = graph.compile(&ctx.device).unwrap_err();
    assert_eq!(err, GraphicsError::Graph(GraphError::NoRenderTargets("orphan".into())));
}

#[test]
fn test_unknown_resources_become_placeholders() {
    let ctx = TestContext::new();
    let mut graph = RenderGraph::new();
    assert!(graph.resource("missing").is_placeholder());
    assert!(graph.find_resource("missing").is_some());
    assert_eq!(graph.texture("missing"), None);

    graph
        .add_pass(TestPass::new("main").writes("color", color_spec()).samples("shadow_map"))
        .unwrap();
    graph.compile(&ctx.device).unwrap();
    assert_eq!(
        graph.resolved_input("main", "shadow_map"),
        Some(ResolvedInput::Texture(ctx.device.fallback_texture()))
    );
    assert!(graph.find_resource("shadow_map").unwrap().is_placeholder());
    assert!(graph.pass("main").unwrap().verify().is_empty());
}

#[test]
fn test_imported_texture_is_sampled_directly() {
    let ctx = TestContext::new();
    let imported = ctx
        .device
        .create_texture(&TextureDescriptor::new(
            4,
            4,
            TextureFormat::Rgba8Unorm,
            TextureUsage::TEXTURE_BINDING,
        ))
        .unwrap();
    let mut graph = RenderGraph::new();
    assert!(graph.import_texture("noise", imported));
    assert!(!graph.import_texture("noise", imported));

    graph
        .add_pass(TestPass::new("main").writes("color", color_spec()).samples("noise"))
        .unwrap();
    graph.compile(&ctx.device).unwrap();
    assert_eq!(
        graph.resolved_input("main", "noise"),
        Some(ResolvedInput::Texture(imported))
    );
}

#[rstest]
#[case::color(TextureSpec::color(WIDTH, HEIGHT, TextureFormat::Rgba16Float))]
#[case::depth(TextureSpec::depth(WIDTH, HEIGHT, TextureFormat::Depth32Float))]
fn test_resize_keeps_texture_handles(#[case] spec: TextureSpec) {
    let ctx = TestContext::new();
    let mut graph = RenderGraph::new();
    graph.add_pass(TestPass::new("main").writes("target", spec)).unwrap();
    graph.compile(&ctx.device).unwrap();

    let handle = graph.texture("target").unwrap();
    let before = ctx.device.texture(handle).image;
    assert_eq!(ctx.device.texture(handle).extent(), (WIDTH, HEIGHT));

    graph.resize(&ctx.device, 640, 480).unwrap();
    assert_eq!(graph.texture("target"), Some(handle));
    assert_ne!(ctx.device.texture(handle).image, before);
    assert_eq!(ctx.device.texture(handle).extent(), (640, 480));
    assert_eq!(ctx.device.texture(handle).format(), spec.format);
    // retired, not destroyed: a frame in flight may still read it
    assert!(ctx.backend.is_live(before));

    // zero-sized resizes are ignored
    graph.resize(&ctx.device, 0, 480).unwrap();
    assert_eq!(ctx.device.texture(handle).extent(), (640, 480));
    assert!(!graph.is_dirty());
}

#[test]
fn test_resize_rebinds_sampled_outputs() {
    let ctx = TestContext::new();
    let mut graph = RenderGraph::new();
    // declared before its producer; sampling adds no ordering edge
    graph
        .add_pass(TestPass::new("blur").writes("blurred", color_spec()).samples("color"))
        .unwrap();
    graph.add_pass(TestPass::new("scene").writes("color", color_spec())).unwrap();
    graph.compile(&ctx.device).unwrap();

    let color = graph.texture("color").unwrap();
    assert_eq!(
        graph.resolved_input("blur", "color"),
        Some(ResolvedInput::Texture(color))
    );
    let old_view = ctx.device.texture(color).view;
    assert_eq!(sampled_views(&ctx.backend).last(), Some(&old_view));

    graph.resize(&ctx.device, 640, 480).unwrap();
    let new_view = ctx.device.texture(color).view;
    assert_ne!(new_view, old_view);
    let views = sampled_views(&ctx.backend);
    // once per frame in flight
    assert_eq!(views.iter().filter(|v| **v == new_view).count(), 3);
    assert_eq!(views.last(), Some(&new_view));
}

#[test]
fn test_updated_texture_is_rebound_before_retirement() {
    let mut ctx = TestContext::new();
    let loader = ResourceLoader::new(&ctx.device, Duration::from_millis(50)).unwrap();
    let albedo = loader.upload(vec![0; 16], 2, 2).wait().unwrap();
    let mut graph = RenderGraph::new();
    graph.import_texture("albedo", albedo);
    graph
        .add_pass(TestPass::new("main").writes("color", color_spec()).samples("albedo"))
        .unwrap();
    graph.compile(&ctx.device).unwrap();
    execute(&mut ctx, &mut graph);
    let old_view = ctx.device.texture(albedo).view;

    assert_eq!(loader.update(albedo, vec![9; 16]).wait(), Ok(albedo));
    let new_view = ctx.device.texture(albedo).view;
    assert_ne!(new_view, old_view);
    for _ in 0..3 {
        execute(&mut ctx, &mut graph);
    }
    ctx.device.collector().collect();

    assert!(!ctx.backend.is_live(old_view));
    assert_eq!(sampled_views(&ctx.backend).last(), Some(&new_view));
}

#[test]
fn test_resize_before_compile_changes_specs() {
    let ctx = TestContext::new();
    let mut graph = RenderGraph::new();
    graph.add_pass(TestPass::new("main").writes("color", color_spec())).unwrap();
    graph.resize(&ctx.device, 100, 50).unwrap();
    graph.compile(&ctx.device).unwrap();

    let handle = graph.texture("color").unwrap();
    assert_eq!(ctx.device.texture(handle).extent(), (100, 50));
}

#[test]
fn test_layout_transitions_follow_usage_across_frames() {
    let mut ctx = TestContext::new();
    let mut graph = RenderGraph::new();
    graph.add_pass(TestPass::new("scene").writes("color", color_spec())).unwrap();
    graph
        .add_pass(TestPass::new("post").writes("final", color_spec()).samples("color"))
        .unwrap();
    graph.compile(&ctx.device).unwrap();
    let color = ctx.device.texture(graph.texture("color").unwrap()).image;

    let first = barriers(&execute(&mut ctx, &mut graph));
    let color_first: Vec<_> = first
        .iter()
        .filter(|b| b.image == color)
        .map(|b| (b.old_layout, b.new_layout))
        .collect();
    assert_eq!(
        color_first,
        vec![
            (ImageLayout::Undefined, ImageLayout::ColorAttachment),
            (ImageLayout::ColorAttachment, ImageLayout::ShaderReadOnly),
        ]
    );

    // the tracker remembers the sampled layout from the previous frame
    let second = barriers(&execute(&mut ctx, &mut graph));
    let color_second: Vec<_> = second
        .iter()
        .filter(|b| b.image == color)
        .map(|b| (b.old_layout, b.new_layout))
        .collect();
    assert_eq!(
        color_second,
        vec![
            (ImageLayout::ShaderReadOnly, ImageLayout::ColorAttachment),
            (ImageLayout::ColorAttachment, ImageLayout::ShaderReadOnly),
        ]
    );
    assert!(second.iter().all(|b| b.old_layout != b.new_layout));
}

#[test]
fn test_disabled_pass_is_skipped() {
    let mut ctx = TestContext::new();
    let mut graph = RenderGraph::new();
    graph.add_pass(TestPass::new("main").writes("color", color_spec())).unwrap();
    graph.add_pass(TestPass::new("debug").writes("overlay", color_spec())).unwrap();
    graph.compile(&ctx.device).unwrap();

    assert!(graph.set_enabled("debug", false));
    assert!(!graph.set_enabled("nonexistent", false));
    assert!(!graph.is_enabled("debug"));
    assert!(!graph.is_dirty());

    let commands = execute(&mut ctx, &mut graph);
    assert_eq!(count_render_passes(&commands), 1);
    assert_eq!(graph.sorted_passes(), vec!["main", "debug"]);

    graph.set_enabled("debug", true);
    let commands = execute(&mut ctx, &mut graph);
    assert_eq!(count_render_passes(&commands), 2);
}

#[test]
fn test_swapchain_pass_draws_into_acquired_image() {
    let mut ctx = TestContext::new();
    let mut graph = RenderGraph::new();
    graph.add_pass(TestPass::new("scene").writes("color", color_spec())).unwrap();
    graph
        .add_pass(TestPass::new("composite").samples("color").presents())
        .unwrap();
    graph.compile(&ctx.device).unwrap();

    let commands = execute(&mut ctx, &mut graph);
    let framebuffers: Vec<_> = commands
        .iter()
        .filter_map(|c| match c {
            GpuCommand::BeginRenderPass { framebuffer, .. } => {
                Some(*framebuffer)
            }
            _ => None,
        })
        .collect();
    assert_eq!(framebuffers.len(), 2);
    assert!(!ctx.backend.is_swapchain_framebuffer(framebuffers[0]));
    assert!(ctx.backend.is_swapchain_framebuffer(framebuffers[1]));
}

#[test]
fn test_external_output_outlives_the_graph() {
    let ctx = TestContext::new();
    let external = ctx
        .device
        .create_texture(&TextureDescriptor::new(
            WIDTH,
            HEIGHT,
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        ))
        .unwrap();

    struct ExternalPass(redlilium_render::resources::TextureHandle);

    impl redlilium_render::graph::GraphPass for ExternalPass {
        fn name(&self) -> &str {
            "external"
        }

        fn setup(&mut self, builder: &mut redlilium_render::graph::PassBuilder) {
            builder.output_external("viewport", self.0);
        }

        fn compile(
            &mut self,
            ctx: &mut redlilium_render::graph::CompileContext,
        ) -> redlilium_render::GraphicsResult<()> {
            ctx.bake(redlilium_render::backend::PipelineDescriptor::new(
                "external",
                common::shader(),
            ))?;
            Ok(())
        }

        fn render(&mut self, ctx: &mut redlilium_render::graph::RenderContext) {
            ctx.cmd.draw(3, 1);
        }
    }

    let mut graph = RenderGraph::new();
    graph.add_pass(ExternalPass(external)).unwrap();
    graph.add_pass(TestPass::new("main").writes("color", color_spec())).unwrap();
    graph.compile(&ctx.device).unwrap();
    assert_eq!(graph.texture("viewport"), Some(external));
    assert!(graph.find_resource("viewport").unwrap().is_external());

    let owned = graph.texture("color").unwrap();
    graph.release(&ctx.device);
    assert!(ctx.device.textures().is_valid(external));
    assert!(!ctx.device.textures().is_valid(owned));
    assert!(graph.is_dirty());
}

#[test]
fn test_recompile_reuses_matching_textures() {
    let ctx = TestContext::new();
    let mut graph = RenderGraph::new();
    graph.add_pass(TestPass::new("main").writes("color", color_spec())).unwrap();
    graph.compile(&ctx.device).unwrap();
    let handle = graph.texture("color").unwrap();
    let image = ctx.device.texture(handle).image;

    graph.add_pass(TestPass::new("late").samples("color").presents()).unwrap();
    assert!(graph.is_dirty());
    graph.compile(&ctx.device).unwrap();
    assert_eq!(graph.texture("color"), Some(handle));
    assert_eq!(ctx.device.texture(handle).image, image);
    assert_eq!(graph.sorted_passes(), vec!["main", "late"]);
}
