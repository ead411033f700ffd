//! Mapping between the logical frame and a pre-rotated swapchain image.

use {super::commands::Vertex, ash::vk};

/// The quarter turns the surface transform applies.
pub fn quarter_turns(transform: vk::SurfaceTransformFlagsKHR) -> u32 {
    if transform.intersects(
        vk::SurfaceTransformFlagsKHR::ROTATE_90
            | vk::SurfaceTransformFlagsKHR::HORIZONTAL_MIRROR_ROTATE_90,
    ) {
        1
    } else if transform.intersects(
        vk::SurfaceTransformFlagsKHR::ROTATE_180
            | vk::SurfaceTransformFlagsKHR::HORIZONTAL_MIRROR_ROTATE_180,
    ) {
        2
    } else if transform.intersects(
        vk::SurfaceTransformFlagsKHR::ROTATE_270
            | vk::SurfaceTransformFlagsKHR::HORIZONTAL_MIRROR_ROTATE_270,
    ) {
        3
    } else {
        0
    }
}

/// Map a scissor rectangle given in the logical frame of size `extent` into
/// the rotated image.
///
/// Quarter turns swap the extents and offsets, a half turn flips both
/// offsets.
pub fn remap_scissor(
    rect: vk::Rect2D,
    transform: vk::SurfaceTransformFlagsKHR,
    extent: vk::Extent2D,
) -> vk::Rect2D {
    let (x, y) = (rect.offset.x, rect.offset.y);
    let (w, h) = (rect.extent.width, rect.extent.height);
    let width = extent.width as i32;
    let height = extent.height as i32;
    let (offset, extent) = match quarter_turns(transform) {
        1 => ((height - (y + h as i32), x), (h, w)),
        2 => ((width - (x + w as i32), height - (y + h as i32)), (w, h)),
        3 => ((y, width - (x + w as i32)), (h, w)),
        _ => ((x, y), (w, h)),
    };
    vk::Rect2D {
        offset: vk::Offset2D {
            x: offset.0.max(0),
            y: offset.1.max(0),
        },
        extent: vk::Extent2D {
            width: extent.0,
            height: extent.1,
        },
    }
}

/// The full-frame scissor in image space.
pub fn full_scissor(
    transform: vk::SurfaceTransformFlagsKHR,
    extent: vk::Extent2D,
) -> vk::Rect2D {
    remap_scissor(
        vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        },
        transform,
        extent,
    )
}

/// A quad covering the whole frame with texture coordinates rotated to
/// match the surface transform. Indices are `[0, 1, 2, 2, 1, 3]`.
pub fn fullscreen_quad(transform: vk::SurfaceTransformFlagsKHR) -> [Vertex; 4] {
    let corners = [[-1.0, -1.0], [1.0, -1.0], [-1.0, 1.0], [1.0, 1.0]];
    let uvs = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
    let turns = quarter_turns(transform);
    let mut quad = [Vertex::default(); 4];
    for (index, vertex) in quad.iter_mut().enumerate() {
        let mut uv: [f32; 2] = uvs[index];
        for _ in 0..turns {
            uv = [uv[1], 1.0 - uv[0]];
        }
        *vertex = Vertex::new(corners[index], [1.0; 4], uv);
    }
    quad
}

pub const QUAD_INDICES: [u32; 6] = [0, 1, 2, 2, 1, 3];
