//! Vertex data structures and input descriptions.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Position-only vertex for the hard-coded triangle.
///
/// The fragment shader supplies a constant color, so position is the only
/// attribute. `#[repr(C)]` pins the layout for the vertex input binding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct TriangleVertex {
    /// Position in clip space.
    pub position: Vec3,
}

impl TriangleVertex {
    /// Creates a new triangle vertex.
    #[inline]
    pub const fn new(position: Vec3) -> Self {
        Self { position }
    }

    /// Get the vertex input binding description.
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Get the vertex attribute descriptions.
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 1] {
        [vk::VertexInputAttributeDescription {
            binding: 0,
            location: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: 0,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_stride_matches_layout() {
        let binding = TriangleVertex::binding_description();
        assert_eq!(binding.stride as usize, std::mem::size_of::<TriangleVertex>());
        assert_eq!(binding.stride, 12);
    }

    #[test]
    fn test_position_attribute() {
        let attributes = TriangleVertex::attribute_descriptions();
        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes[0].location, 0);
        assert_eq!(attributes[0].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(attributes[0].offset, 0);
    }

    #[test]
    fn test_vertex_is_pod() {
        let v = TriangleVertex::new(Vec3::new(0.0, 0.5, 0.5));
        let bytes: &[u8] = bytemuck::bytes_of(&v);
        assert_eq!(bytes.len(), 12);
    }
}
