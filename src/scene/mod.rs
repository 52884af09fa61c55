//! Scene payload handed to the render graph each frame.
//!
//! The scene is plain data owned by the caller. [`SceneGeometry`] keeps the
//! GPU copy of its vertices and indices, and [`FrameInputs`] bundles what
//! pass callbacks read while a frame is recorded.

mod camera;
mod geometry;
mod light;

pub use camera::*;
pub use geometry::*;
pub use light::*;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::backend::Vertex;

/// Upper bound of materials uploaded per frame.
pub const MAX_MATERIALS: usize = 256;

/// One indexed draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawItem {
    pub first_index: u32,
    pub index_count: u32,
    pub vertex_offset: i32,
    /// Index into [`SceneRawData::transforms`].
    pub transform: u32,
    /// Index into [`SceneRawData::materials`].
    pub material: u32,
}

/// Surface parameters of a draw
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub base_color: Vec4,
    pub metallic: f32,
    pub roughness: f32,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            base_color: Vec4::ONE,
            metallic: 0.0,
            roughness: 0.5,
        }
    }
}

impl Material {
    pub fn to_gpu_data(&self) -> GpuMaterialData {
        GpuMaterialData {
            base_color: self.base_color,
            params: Vec4::new(self.metallic, self.roughness, 0.0, 0.0),
        }
    }
}

/// Material data for GPU
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuMaterialData {
    pub base_color: Vec4,
    /// x = metallic, y = roughness
    pub params: Vec4,
}

/// Per-draw push constant block
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DrawConstants {
    pub model: Mat4,
    pub material: u32,
    pub _padding: [u32; 3],
}

/// Everything drawn in a frame.
#[derive(Debug, Clone, Default)]
pub struct SceneRawData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub draws: Vec<DrawItem>,
    pub transforms: Vec<Mat4>,
    pub materials: Vec<Material>,
    pub lights: Vec<Light>,
    /// Bumped whenever `vertices` or `indices` change.
    pub geometry_revision: u64,
}

impl SceneRawData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mesh and return the draw that renders it once.
    ///
    /// The draw uses `transform` and `material` as given; both must index
    /// into the scene's tables by the time it is rendered.
    pub fn add_mesh(
        &mut self,
        vertices: &[Vertex],
        indices: &[u32],
        transform: Mat4,
        material: Material,
    ) -> DrawItem {
        let draw = DrawItem {
            first_index: self.indices.len() as u32,
            index_count: indices.len() as u32,
            vertex_offset: self.vertices.len() as i32,
            transform: self.transforms.len() as u32,
            material: self.materials.len() as u32,
        };
        self.vertices.extend_from_slice(vertices);
        self.indices.extend_from_slice(indices);
        self.transforms.push(transform);
        self.materials.push(material);
        self.draws.push(draw);
        self.geometry_revision += 1;
        draw
    }

    pub fn add_light(&mut self, light: Light) {
        self.lights.push(light);
    }

    /// Drop all geometry and draws, keeping lights.
    pub fn clear_geometry(&mut self) {
        self.vertices.clear();
        self.indices.clear();
        self.draws.clear();
        self.transforms.clear();
        self.materials.clear();
        self.geometry_revision += 1;
    }

    /// GPU light table, truncated to [`MAX_LIGHTS`].
    pub fn gpu_lights(&self) -> Vec<GpuLightData> {
        self.lights.iter().take(MAX_LIGHTS).map(Light::to_gpu_data).collect()
    }

    /// GPU material table, truncated to [`MAX_MATERIALS`].
    pub fn gpu_materials(&self) -> Vec<GpuMaterialData> {
        self.materials
            .iter()
            .take(MAX_MATERIALS)
            .map(Material::to_gpu_data)
            .collect()
    }

    pub fn draw_constants(&self, draw: &DrawItem) -> DrawConstants {
        DrawConstants {
            model: self
                .transforms
                .get(draw.transform as usize)
                .copied()
                .unwrap_or(Mat4::IDENTITY),
            material: draw.material,
            _padding: [0; 3],
        }
    }
}

/// What pass callbacks see of the frame being recorded.
#[derive(Clone, Copy)]
pub struct FrameInputs<'a> {
    pub scene: &'a SceneRawData,
    pub camera: &'a Camera,
    pub geometry: &'a SceneGeometry,
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Vec2, Vec3};

    fn quad() -> (Vec<Vertex>, Vec<u32>) {
        let v = |x: f32, y: f32| Vertex::new(Vec3::new(x, y, 0.0), Vec3::Z, Vec2::new(x, y));
        (
            vec![v(0.0, 0.0), v(1.0, 0.0), v(1.0, 1.0), v(0.0, 1.0)],
            vec![0, 1, 2, 2, 3, 0],
        )
    }

    #[test]
    fn test_add_mesh_offsets() {
        let mut scene = SceneRawData::new();
        let (vertices, indices) = quad();
        let first = scene.add_mesh(&vertices, &indices, Mat4::IDENTITY, Material::default());
        let second = scene.add_mesh(&vertices, &indices, Mat4::IDENTITY, Material::default());

        assert_eq!(first.first_index, 0);
        assert_eq!(second.first_index, 6);
        assert_eq!(second.vertex_offset, 4);
        assert_eq!(second.transform, 1);
        assert_eq!(scene.geometry_revision, 2);
    }

    #[test]
    fn test_gpu_lights_are_capped() {
        let mut scene = SceneRawData::new();
        for i in 0..MAX_LIGHTS + 5 {
            scene.add_light(Light::point(Vec3::splat(i as f32), Vec3::ONE, 1.0, 5.0));
        }
        assert_eq!(scene.gpu_lights().len(), MAX_LIGHTS);
    }

    #[test]
    fn test_draw_constants_fall_back_to_identity() {
        let scene = SceneRawData::new();
        let draw = DrawItem {
            first_index: 0,
            index_count: 3,
            vertex_offset: 0,
            transform: 7,
            material: 0,
        };
        assert_eq!(scene.draw_constants(&draw).model, Mat4::IDENTITY);
        assert_eq!(std::mem::size_of::<DrawConstants>(), 80);
    }
}
