// rt_accel.rs — per-leaf acceleration-structure building
//
// Consumes finished leaf meshes and drives the GPU collaborators: one
// vertex buffer, one index buffer and one bottom-level acceleration
// structure per renderable leaf. Individual failures degrade that leaf
// only; the map stays loadable.

use crate::rt_local::{LeafGeometry, RefImport, Vertex3D};
use q2rt_common::q_shared::{PRINT_ALL, PRINT_DEVELOPER};

// =============================================================
//  Collaborator interfaces
// =============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBufferHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexBufferHandle(pub usize);

/// Handle to a bottom-level acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlasHandle(pub usize);

/// GPU resource creation for leaf meshes.
pub trait RtResourceFactory {
    fn create_vertex_buffer(&mut self, vertices: &[Vertex3D]) -> Result<VertexBufferHandle, String>;
    fn create_index_buffer(&mut self, indices: &[u32]) -> Result<IndexBufferHandle, String>;
}

/// Bottom-level acceleration-structure builds against the GPU backend.
pub trait RtAccelBackend {
    fn build_blas(
        &mut self,
        vertices: VertexBufferHandle,
        vertex_count: u32,
        indices: IndexBufferHandle,
        index_count: u32,
    ) -> Result<BlasHandle, String>;
}

// =============================================================
//  World acceleration structures
// =============================================================

/// GPU-side handles for one renderable leaf.
#[derive(Debug, Clone, Copy)]
pub struct LeafAccel {
    pub leaf: usize,
    pub vertex_buffer: VertexBufferHandle,
    pub index_buffer: IndexBufferHandle,
    pub blas: BlasHandle,
    pub primitive_count: u32,
}

/// Per-leaf acceleration structures plus build statistics.
#[derive(Debug, Default)]
pub struct WorldAccel {
    /// Indexed by leaf number; None for skipped or failed leaves.
    pub leaves: Vec<Option<LeafAccel>>,
    pub built: usize,
    pub failed: usize,
    pub total: usize,
}

/// A leaf reaches the GPU only if it is renderable: a real visibility
/// cluster, a real area, and non-trivial geometry.
fn leaf_is_renderable(geo: &LeafGeometry) -> bool {
    geo.cluster >= 0 && geo.area > 0 && !geo.vertices.is_empty() && !geo.indices.is_empty()
}

fn build_leaf_accel(
    geo: &LeafGeometry,
    factory: &mut dyn RtResourceFactory,
    backend: &mut dyn RtAccelBackend,
) -> Result<LeafAccel, String> {
    let vertex_buffer = factory.create_vertex_buffer(&geo.vertices)?;
    let index_buffer = factory.create_index_buffer(&geo.indices)?;
    let blas = backend.build_blas(
        vertex_buffer,
        geo.vertices.len() as u32,
        index_buffer,
        geo.indices.len() as u32,
    )?;
    Ok(LeafAccel {
        leaf: geo.leaf,
        vertex_buffer,
        index_buffer,
        blas,
        primitive_count: geo.indices.len() as u32 / 3,
    })
}

/// Build acceleration structures for every renderable leaf. Buffer or
/// build failures drop that leaf from the renderable set with a warning.
pub fn build_world_accel(
    geometries: &[LeafGeometry],
    factory: &mut dyn RtResourceFactory,
    backend: &mut dyn RtAccelBackend,
    ri: &dyn RefImport,
) -> WorldAccel {
    let mut world = WorldAccel {
        leaves: Vec::with_capacity(geometries.len()),
        built: 0,
        failed: 0,
        total: geometries.len(),
    };

    for geo in geometries {
        if !leaf_is_renderable(geo) {
            world.leaves.push(None);
            continue;
        }
        match build_leaf_accel(geo, factory, backend) {
            Ok(accel) => {
                world.built += 1;
                world.leaves.push(Some(accel));
            }
            Err(e) => {
                world.failed += 1;
                world.leaves.push(None);
                ri.con_printf(
                    PRINT_ALL,
                    &format!("Couldn't build acceleration structure for leaf {}: {}\n", geo.leaf, e),
                );
            }
        }
    }

    ri.con_printf(
        PRINT_DEVELOPER,
        &format!("rt_accel: {}/{} leafs have acceleration structures\n", world.built, world.total),
    );
    world
}

// =============================================================
//  Tests
// =============================================================
