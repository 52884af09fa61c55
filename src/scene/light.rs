//! Light types for the scene

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

/// A light source
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Light {
    Point {
        position: Vec3,
        color: Vec3,
        intensity: f32,
        radius: f32,
    },
    Spot {
        position: Vec3,
        direction: Vec3,
        color: Vec3,
        intensity: f32,
        radius: f32,
        /// radians
        inner_angle: f32,
        /// radians
        outer_angle: f32,
    },
    /// Like the sun
    Directional {
        direction: Vec3,
        color: Vec3,
        intensity: f32,
    },
}

impl Light {
    pub fn point(position: Vec3, color: Vec3, intensity: f32, radius: f32) -> Self {
        Light::Point {
            position,
            color,
            intensity,
            radius,
        }
    }

    pub fn directional(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Light::Directional {
            direction: direction.normalize(),
            color,
            intensity,
        }
    }

    /// Convert to GPU data format
    pub fn to_gpu_data(&self) -> GpuLightData {
        match *self {
            Light::Point {
                position,
                color,
                intensity,
                radius,
            } => GpuLightData {
                position: position.extend(radius),
                color_intensity: color.extend(intensity),
                direction_type: Vec4::ZERO, // type 0 = point
                spot_params: Vec4::ZERO,
            },
            Light::Spot {
                position,
                direction,
                color,
                intensity,
                radius,
                inner_angle,
                outer_angle,
            } => GpuLightData {
                position: position.extend(radius),
                color_intensity: color.extend(intensity),
                direction_type: direction.extend(1.0), // type 1 = spot
                spot_params: Vec4::new(inner_angle.cos(), outer_angle.cos(), 0.0, 0.0),
            },
            Light::Directional {
                direction,
                color,
                intensity,
            } => GpuLightData {
                position: Vec4::new(0.0, 0.0, 0.0, f32::INFINITY),
                color_intensity: color.extend(intensity),
                direction_type: direction.extend(2.0), // type 2 = directional
                spot_params: Vec4::ZERO,
            },
        }
    }
}

/// GPU-friendly light data structure
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuLightData {
    /// xyz = position, w = radius
    pub position: Vec4,
    /// xyz = color, w = intensity
    pub color_intensity: Vec4,
    /// xyz = direction, w = light type (0=point, 1=spot, 2=directional)
    pub direction_type: Vec4,
    /// x = cos(inner_angle), y = cos(outer_angle)
    pub spot_params: Vec4,
}

/// Upper bound of lights uploaded per frame.
pub const MAX_LIGHTS: usize = 64;
