//! Translation of recorded [`GpuCommand`]s into Vulkan command buffer calls.

use ash::vk;

use super::conversion::*;
use super::pipeline::PUSH_CONSTANT_STAGES;
use crate::backend::traits::{GpuCommand, ImageBarrier};

fn image_barrier(barrier: &ImageBarrier) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .src_access_mask(layout_access_mask(barrier.old_layout))
        .dst_access_mask(layout_access_mask(barrier.new_layout))
        .old_layout(convert_image_layout(barrier.old_layout))
        .new_layout(convert_image_layout(barrier.new_layout))
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(raw(barrier.image))
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect_mask(barrier.format))
                .level_count(vk::REMAINING_MIP_LEVELS)
                .layer_count(vk::REMAINING_ARRAY_LAYERS),
        )
}

fn set_viewport(device: &ash::Device, cmd: vk::CommandBuffer, width: u32, height: u32) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: width as f32,
        height: height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D { width, height },
    };
    unsafe {
        device.cmd_set_viewport(cmd, 0, &[viewport]);
        device.cmd_set_scissor(cmd, 0, &[scissor]);
    }
}

/// Record one command into `cmd`, which must be in the recording state.
pub fn record_command(device: &ash::Device, cmd: vk::CommandBuffer, command: &GpuCommand) {
    match command {
        GpuCommand::PipelineBarrier(barriers) => {
            if barriers.is_empty() {
                return;
            }
            let src_stage = barriers
                .iter()
                .fold(vk::PipelineStageFlags::empty(), |acc, b| {
                    acc | layout_src_stage(b.old_layout)
                });
            let dst_stage = barriers
                .iter()
                .fold(vk::PipelineStageFlags::empty(), |acc, b| {
                    acc | layout_dst_stage(b.new_layout)
                });
            let image_barriers: Vec<vk::ImageMemoryBarrier> =
                barriers.iter().map(image_barrier).collect();
            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    src_stage,
                    dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &image_barriers,
                )
            };
        }
        GpuCommand::CopyBuffer {
            src,
            dst,
            src_offset,
            dst_offset,
            size,
        } => {
            let region = vk::BufferCopy {
                src_offset: *src_offset,
                dst_offset: *dst_offset,
                size: *size,
            };
            unsafe { device.cmd_copy_buffer(cmd, raw(*src), raw(*dst), &[region]) };
        }
        GpuCommand::CopyBufferToImage {
            buffer,
            image,
            width,
            height,
        } => {
            let region = vk::BufferImageCopy::default()
                .buffer_offset(0)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1),
                )
                .image_extent(vk::Extent3D {
                    width: *width,
                    height: *height,
                    depth: 1,
                });
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    raw(*buffer),
                    raw(*image),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                )
            };
        }
        GpuCommand::BeginRenderPass {
            render_pass,
            framebuffer,
            width,
            height,
            clear_values,
        } => {
            let clear_values: Vec<vk::ClearValue> =
                clear_values.iter().copied().map(convert_clear_value).collect();
            let info = vk::RenderPassBeginInfo::default()
                .render_pass(raw(*render_pass))
                .framebuffer(raw(*framebuffer))
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: *width,
                        height: *height,
                    },
                })
                .clear_values(&clear_values);
            unsafe { device.cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE) };
            set_viewport(device, cmd, *width, *height);
        }
        GpuCommand::EndRenderPass => unsafe { device.cmd_end_render_pass(cmd) },
        GpuCommand::BindPipeline(pipeline) => unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, raw(*pipeline))
        },
        GpuCommand::BindDescriptorSets {
            layout,
            first_set,
            sets,
        } => {
            let sets: Vec<vk::DescriptorSet> = sets.iter().map(|s| raw(*s)).collect();
            unsafe {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    raw(*layout),
                    *first_set,
                    &sets,
                    &[],
                )
            };
        }
        GpuCommand::BindVertexBuffer { buffer, offset } => unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[raw(*buffer)], &[*offset])
        },
        GpuCommand::BindIndexBuffer {
            buffer,
            offset,
            format,
        } => unsafe {
            device.cmd_bind_index_buffer(cmd, raw(*buffer), *offset, convert_index_format(*format))
        },
        GpuCommand::PushConstants {
            layout,
            offset,
            data,
        } => unsafe {
            device.cmd_push_constants(cmd, raw(*layout), PUSH_CONSTANT_STAGES, *offset, data)
        },
        GpuCommand::SetViewport { width, height } => set_viewport(device, cmd, *width, *height),
        GpuCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        } => unsafe {
            device.cmd_draw(cmd, *vertex_count, *instance_count, *first_vertex, *first_instance)
        },
        GpuCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        } => unsafe {
            device.cmd_draw_indexed(
                cmd,
                *index_count,
                *instance_count,
                *first_index,
                *vertex_offset,
                *first_instance,
            )
        },
    }
}
