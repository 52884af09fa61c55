//! Render pass and graphics pipeline creation.

use std::ffi::CString;

use ash::vk;

use super::conversion::*;
use crate::backend::traits::{ObjectKind, RawPipeline};
use crate::backend::types::*;
use crate::error::GraphicsError;

/// Create a single-subpass render pass with the attachments of `layout`.
pub fn create_render_pass(
    device: &ash::Device,
    layout: &RenderPassLayout,
) -> Result<vk::RenderPass, GraphicsError> {
    let describe = |attachment: &AttachmentDescription| {
        vk::AttachmentDescription::default()
            .format(convert_texture_format(attachment.format))
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(convert_load_op(attachment.load))
            .store_op(convert_store_op(attachment.store))
            .stencil_load_op(if attachment.format.has_stencil() {
                convert_load_op(attachment.load)
            } else {
                vk::AttachmentLoadOp::DONT_CARE
            })
            .stencil_store_op(if attachment.format.has_stencil() {
                convert_store_op(attachment.store)
            } else {
                vk::AttachmentStoreOp::DONT_CARE
            })
            .initial_layout(convert_image_layout(attachment.initial_layout))
            .final_layout(convert_image_layout(attachment.final_layout))
    };

    let mut attachments: Vec<vk::AttachmentDescription> =
        layout.colors.iter().map(describe).collect();
    let color_refs: Vec<vk::AttachmentReference> = (0..layout.colors.len() as u32)
        .map(|index| {
            vk::AttachmentReference::default()
                .attachment(index)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        })
        .collect();
    let depth_ref = layout.depth.as_ref().map(|depth| {
        attachments.push(describe(depth));
        vk::AttachmentReference::default()
            .attachment(layout.colors.len() as u32)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
    });

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if let Some(depth_ref) = depth_ref.as_ref() {
        subpass = subpass.depth_stencil_attachment(depth_ref);
    }
    let subpasses = [subpass];

    // Layout transitions happen in explicit barriers before the pass; the
    // dependency only orders attachment access against earlier work.
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    let dependencies = [vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stages)
        .dst_stage_mask(stages)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )];

    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    unsafe { device.create_render_pass(&info, None) }
        .map_err(creation_error(ObjectKind::RenderPass))
}

/// Descriptor set layout for every set index `desc` references, dense from 0.
fn create_set_layouts(
    device: &ash::Device,
    desc: &PipelineDescriptor,
) -> Result<Vec<vk::DescriptorSetLayout>, GraphicsError> {
    let mut layouts = Vec::with_capacity(desc.set_count() as usize);
    for set in 0..desc.set_count() {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
            .bindings
            .iter()
            .filter(|b| b.set == set)
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(convert_descriptor_type(b.ty))
                    .descriptor_count(b.count)
                    .stage_flags(convert_shader_stages(b.stages))
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        match unsafe { device.create_descriptor_set_layout(&info, None) } {
            Ok(layout) => layouts.push(layout),
            Err(e) => {
                destroy_set_layouts(device, &layouts);
                return Err(creation_error(ObjectKind::DescriptorSetLayout)(e));
            }
        }
    }
    Ok(layouts)
}

fn destroy_set_layouts(device: &ash::Device, layouts: &[vk::DescriptorSetLayout]) {
    for &layout in layouts {
        unsafe { device.destroy_descriptor_set_layout(layout, None) };
    }
}

fn create_shader_module(
    device: &ash::Device,
    source: &ShaderSource,
) -> Result<vk::ShaderModule, GraphicsError> {
    let info = vk::ShaderModuleCreateInfo::default().code(&source.spirv);
    unsafe { device.create_shader_module(&info, None) }.map_err(|e| {
        GraphicsError::ResourceCreationFailed {
            kind: ObjectKind::Pipeline,
            reason: format!("shader module: {e:?}"),
        }
    })
}

/// Stage flags used by every push constant range and push.
pub const PUSH_CONSTANT_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw(),
);

/// Bake a graphics pipeline for subpass 0 of `render_pass`, which has
/// `color_count` color attachments.
pub fn create_graphics_pipeline(
    device: &ash::Device,
    desc: &PipelineDescriptor,
    render_pass: vk::RenderPass,
    color_count: usize,
) -> Result<RawPipeline, GraphicsError> {
    let set_layouts = create_set_layouts(device, desc)?;

    let push_ranges: Vec<vk::PushConstantRange> = if desc.push_constant_size > 0 {
        vec![vk::PushConstantRange::default()
            .stage_flags(PUSH_CONSTANT_STAGES)
            .offset(0)
            .size(desc.push_constant_size)]
    } else {
        Vec::new()
    };
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&push_ranges);
    let pipeline_layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
        Ok(layout) => layout,
        Err(e) => {
            destroy_set_layouts(device, &set_layouts);
            return Err(creation_error(ObjectKind::PipelineLayout)(e));
        }
    };

    let result = bake(device, desc, render_pass, color_count, pipeline_layout);
    match result {
        Ok(pipeline) => Ok(RawPipeline {
            pipeline: native(pipeline),
            layout: native(pipeline_layout),
            set_layouts: set_layouts.into_iter().map(native).collect(),
        }),
        Err(e) => {
            unsafe { device.destroy_pipeline_layout(pipeline_layout, None) };
            destroy_set_layouts(device, &set_layouts);
            Err(e)
        }
    }
}

fn bake(
    device: &ash::Device,
    desc: &PipelineDescriptor,
    render_pass: vk::RenderPass,
    color_count: usize,
    pipeline_layout: vk::PipelineLayout,
) -> Result<vk::Pipeline, GraphicsError> {
    let vertex_module = create_shader_module(device, &desc.vertex)?;
    let fragment_module = match desc.fragment.as_ref().map(|f| create_shader_module(device, f)) {
        Some(Ok(module)) => Some(module),
        Some(Err(e)) => {
            unsafe { device.destroy_shader_module(vertex_module, None) };
            return Err(e);
        }
        None => None,
    };

    let result = bake_with_modules(
        device,
        desc,
        render_pass,
        color_count,
        pipeline_layout,
        vertex_module,
        fragment_module,
    );

    // Modules are only needed while the pipeline is created
    unsafe {
        device.destroy_shader_module(vertex_module, None);
        if let Some(module) = fragment_module {
            device.destroy_shader_module(module, None);
        }
    }
    result
}

fn bake_with_modules(
    device: &ash::Device,
    desc: &PipelineDescriptor,
    render_pass: vk::RenderPass,
    color_count: usize,
    pipeline_layout: vk::PipelineLayout,
    vertex_module: vk::ShaderModule,
    fragment_module: Option<vk::ShaderModule>,
) -> Result<vk::Pipeline, GraphicsError> {
    let entry_point = |name: &str| {
        CString::new(name).map_err(|e| GraphicsError::ResourceCreationFailed {
            kind: ObjectKind::Pipeline,
            reason: format!("invalid entry point: {e}"),
        })
    };
    let vertex_entry = entry_point(&desc.vertex.entry_point)?;
    let fragment_entry = match &desc.fragment {
        Some(fragment) => entry_point(&fragment.entry_point)?,
        None => CString::default(),
    };

    let mut stages = vec![vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vertex_module)
        .name(&vertex_entry)];
    if let Some(module) = fragment_module {
        stages.push(
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(module)
                .name(&fragment_entry),
        );
    }

    let (bindings, attributes) = match &desc.vertex_layout {
        Some(layout) => (
            vec![vk::VertexInputBindingDescription::default()
                .binding(0)
                .stride(layout.array_stride as u32)
                .input_rate(vk::VertexInputRate::VERTEX)],
            layout
                .attributes
                .iter()
                .map(|attr| {
                    vk::VertexInputAttributeDescription::default()
                        .location(attr.location)
                        .binding(0)
                        .format(convert_vertex_format(attr.format))
                        .offset(attr.offset as u32)
                })
                .collect(),
        ),
        None => (Vec::new(), Vec::new()),
    };
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(convert_topology(desc.topology))
        .primitive_restart_enable(false);

    // Viewport and scissor are dynamic
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(convert_cull_mode(desc.cull_mode))
        .front_face(convert_front_face(desc.front_face))
        .depth_bias_enable(false);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.depth_test.is_some())
        .depth_write_enable(desc.depth_write)
        .depth_compare_op(
            desc.depth_test
                .map(convert_compare_function)
                .unwrap_or(vk::CompareOp::ALWAYS),
        )
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let blend_attachments = vec![convert_blend_state(desc.blend); color_count];
    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(pipeline_layout)
        .render_pass(render_pass)
        .subpass(0);

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, e)| creation_error(ObjectKind::Pipeline)(e))?;

    pipelines.into_iter().next().ok_or_else(|| GraphicsError::ResourceCreationFailed {
        kind: ObjectKind::Pipeline,
        reason: format!("driver returned no pipeline for '{}'", desc.label),
    })
}
