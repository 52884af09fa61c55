//! Baked graphics pipelines.

use crate::backend::{
    GpuBackend, NativeHandle, ObjectKind, PipelineDescriptor, RawPipeline, ShaderBinding,
};
use crate::deferred::DirtyCollector;
use crate::error::GraphicsResult;

/// An immutable pipeline plus the binding table its shaders declare.
#[derive(Debug)]
pub struct Pipeline {
    raw: RawPipeline,
    descriptor: PipelineDescriptor,
}

impl Pipeline {
    pub fn bake(
        backend: &dyn GpuBackend,
        descriptor: PipelineDescriptor,
        render_pass: NativeHandle,
    ) -> GraphicsResult<Self> {
        let raw = backend.create_pipeline(&descriptor, render_pass)?;
        log::debug!(
            "Baked pipeline '{}' ({} bindings in {} sets)",
            descriptor.label,
            descriptor.bindings.len(),
            raw.set_layouts.len()
        );
        Ok(Self { raw, descriptor })
    }

    pub fn label(&self) -> &str {
        &self.descriptor.label
    }

    pub fn raw(&self) -> NativeHandle {
        self.raw.pipeline
    }

    pub fn layout(&self) -> NativeHandle {
        self.raw.layout
    }

    pub fn set_layouts(&self) -> &[NativeHandle] {
        &self.raw.set_layouts
    }

    pub fn bindings(&self) -> &[ShaderBinding] {
        &self.descriptor.bindings
    }

    pub fn binding(&self, name: &str) -> Option<&ShaderBinding> {
        self.descriptor.bindings.iter().find(|b| b.name == name)
    }

    pub fn push_constant_size(&self) -> u32 {
        self.descriptor.push_constant_size
    }

    pub fn release(&self, collector: &DirtyCollector) {
        collector.enqueue(ObjectKind::Pipeline, self.raw.pipeline);
        collector.enqueue(ObjectKind::PipelineLayout, self.raw.layout);
        for layout in &self.raw.set_layouts {
            collector.enqueue(ObjectKind::DescriptorSetLayout, *layout);
        }
    }
}
