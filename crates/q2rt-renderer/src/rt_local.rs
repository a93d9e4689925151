// rt_local.rs — in-memory map types and collaborator interfaces shared by
// the loader, the geometry assembler and the acceleration-structure builder

use bytemuck::{Pod, Zeroable};
use q2rt_common::q_shared::{SurfFlags, Vec3};

// =============================================================
//  Decoded (in-memory) map records
//
//  Disk records (qfiles.rs D* structs) are endian-corrected and
//  widened into these during lump decoding. Cross references are
//  kept as indices, never pointers.
// =============================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct MVertex {
    pub position: Vec3,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MEdge {
    pub v: [u16; 2],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MPlane {
    pub normal: Vec3,
    pub dist: f32,
    pub plane_type: u8,
    pub signbits: u8,
}

#[derive(Debug, Clone, Default)]
pub struct MTexInfo {
    pub vecs: [[f32; 4]; 2],
    pub flags: SurfFlags,
    pub value: i32,
    /// Full texture path, "textures/<name>.wal".
    pub name: String,
    /// Pixel dimensions of the resolved texture, if it could be loaded.
    pub image: Option<ImageDims>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MSurface {
    pub planenum: u16,
    pub side: i16,
    pub firstedge: i32,
    pub numedges: i32,
    pub texinfo: i32,
    pub styles: [u8; 4],
    pub lightofs: i32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MLeaf {
    pub contents: i32,
    pub cluster: i32,
    pub area: i32,
    pub mins: [i16; 3],
    pub maxs: [i16; 3],
    pub firstleafface: u16,
    pub numleaffaces: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MNode {
    pub planenum: i32,
    /// Negative child encodes a leaf: leaf index = -1 - child.
    pub children: [i32; 2],
    pub mins: [i16; 3],
    pub maxs: [i16; 3],
    pub firstface: u16,
    pub numfaces: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MModel {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub origin: Vec3,
    pub radius: f32,
    pub headnode: i32,
    pub firstface: i32,
    pub numfaces: i32,
}

/// Compressed visibility data with an owned per-cluster offset table
/// indexed `[cluster][DVIS_PVS | DVIS_PHS]`.
#[derive(Debug, Clone, Default)]
pub struct VisData {
    pub numclusters: usize,
    pub bitofs: Vec<[i32; 2]>,
    /// Raw visibility lump bytes; bitofs entries index into this.
    pub data: Vec<u8>,
}

// =============================================================
//  Computed leaf geometry
// =============================================================

/// Output vertex format for leaf meshes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct Vertex3D {
    /// Position in renderer space.
    pub position: [f32; 3],
    /// Diffuse texture coordinates.
    pub uv0: [f32; 2],
    /// Lightmap-density coordinates.
    pub uv1: [f32; 2],
    pub normal: [f32; 3],
    pub tangent: [f32; 3],
}

impl Vertex3D {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// One independent triangle mesh per BSP leaf.
#[derive(Debug, Clone, Default)]
pub struct LeafGeometry {
    pub leaf: usize,
    pub cluster: i32,
    pub area: i32,
    pub vertices: Vec<Vertex3D>,
    pub indices: Vec<u32>,
}

// =============================================================
//  Collaborator interfaces
//
//  The loader reaches engine services only through these traits,
//  so the pipeline is testable with fakes.
// =============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    Wall,
    Sky,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDims {
    pub width: u32,
    pub height: u32,
}

/// Texture size used for UV normalization when a texture cannot be loaded.
pub const DEFAULT_IMAGE_DIMS: ImageDims = ImageDims { width: 256, height: 256 };

/// Diagnostic output, the injected stand-in for the engine's vid_printf.
pub trait RefImport: Sync {
    fn con_printf(&self, print_level: i32, msg: &str);
}

/// Texture resolution by name and usage kind; reports pixel dimensions.
pub trait TextureLoader {
    fn find_image(&mut self, name: &str, kind: ImageType) -> Option<ImageDims>;
}

/// RefImport that writes to stdout, skipping developer-level chatter
/// unless enabled.
pub struct ConsoleRefImport {
    pub developer: bool,
}

impl RefImport for ConsoleRefImport {
    fn con_printf(&self, print_level: i32, msg: &str) {
        if print_level == q2rt_common::q_shared::PRINT_DEVELOPER && !self.developer {
            return;
        }
        print!("{}", msg);
    }
}

// =============================================================
//  Test fakes
// =============================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex3d_is_tightly_packed() {
        // 13 f32 fields, no padding — required for direct GPU upload
        assert_eq!(Vertex3D::SIZE, 13 * 4);
    }

    #[test]
    fn default_image_dims() {
        assert_eq!(DEFAULT_IMAGE_DIMS.width, 256);
        assert_eq!(DEFAULT_IMAGE_DIMS.height, 256);
    }
}
