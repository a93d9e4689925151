// rt_surf.rs — per-leaf triangle mesh assembly
//
// For every leaf, walks its faces, recovers each face's vertex loop from
// the surfedge indirection table, deduplicates vertices per (vertex,
// texinfo) pair, fan-triangulates, and accumulates smooth normals and
// tangents across shared vertices. Leaves are independent, so assembly is
// data-parallel above a small threshold.

use crate::rt_local::*;
use crate::rt_model::MapRender;
use q2rt_common::q_shared::{
    cross_product, dot_product, vector_normalize, vector_subtract, PRINT_ALL,
};
use rayon::prelude::*;
use std::collections::HashMap;

/// Below this leaf count, sequential assembly is faster than rayon.
const PARALLEL_LEAF_THRESHOLD: usize = 64;

/// UV-gradient determinants below this are treated as degenerate; the
/// triangle then contributes no tangent.
const UV_DEGENERATE_EPSILON: f32 = 1e-6;

/// Lightmap luxel density: one sample per 16 world units.
const LIGHTMAP_SCALE: f32 = 16.0;

/// Dedup key: the same raw vertex under a different texinfo is a distinct
/// output vertex, because its UVs differ.
type DedupKey = (u16, i32);

/// Assemble one mesh per leaf. Leaf N's output is independent of leaf
/// N+1's, so the leaves are processed in parallel.
pub fn build_leaf_geometries(map: &MapRender, ri: &dyn RefImport) -> Vec<LeafGeometry> {
    let count = map.leafs.len();
    if count >= PARALLEL_LEAF_THRESHOLD {
        (0..count)
            .into_par_iter()
            .map(|i| build_leaf_geometry(map, i, ri))
            .collect()
    } else {
        (0..count).map(|i| build_leaf_geometry(map, i, ri)).collect()
    }
}

/// Assemble the mesh for a single leaf.
pub fn build_leaf_geometry(map: &MapRender, leafnum: usize, ri: &dyn RefImport) -> LeafGeometry {
    let leaf = &map.leafs[leafnum];
    let mut geo = LeafGeometry {
        leaf: leafnum,
        cluster: leaf.cluster,
        area: leaf.area,
        vertices: Vec::new(),
        indices: Vec::new(),
    };
    let mut dedup: HashMap<DedupKey, u32> = HashMap::new();

    for i in 0..leaf.numleaffaces as usize {
        let lf = leaf.firstleafface as usize + i;
        if lf >= map.leaffaces.len() {
            // Truncate this leaf only; the rest of the map is fine.
            ri.con_printf(
                PRINT_ALL,
                &format!("Mod_BuildLeafGeometry: bad leafface range in leaf {}\n", leafnum),
            );
            break;
        }
        let surf = &map.surfaces[map.leaffaces[lf] as usize];
        build_face_geometry(map, surf, &mut geo, &mut dedup);
    }

    for v in geo.vertices.iter_mut() {
        vector_normalize(&mut v.normal);
        vector_normalize(&mut v.tangent);
    }

    geo
}

/// Walk one face's surfedge chain, emitting deduplicated vertices and
/// fan triangles into the leaf's geometry.
fn build_face_geometry(
    map: &MapRender,
    surf: &MSurface,
    geo: &mut LeafGeometry,
    dedup: &mut HashMap<DedupKey, u32>,
) {
    let tex = &map.texinfo[surf.texinfo as usize];
    let mut loop_indices: Vec<u32> = Vec::with_capacity(surf.numedges as usize);

    for i in 0..surf.numedges {
        let s = map.surfedges[(surf.firstedge + i) as usize];
        // The sign selects traversal direction of the shared edge.
        let raw = if s >= 0 {
            map.edges[s as usize].v[0]
        } else {
            map.edges[-s as usize].v[1]
        };

        let out = match dedup.get(&(raw, surf.texinfo)) {
            Some(&idx) => idx,
            None => {
                let idx = geo.vertices.len() as u32;
                geo.vertices.push(emit_vertex(map, raw, tex));
                dedup.insert((raw, surf.texinfo), idx);
                idx
            }
        };
        loop_indices.push(out);
    }

    // A loop shorter than 3 cannot be triangulated; its vertices stay
    // registered so a later face under the same texinfo reuses them.
    if loop_indices.len() < 3 {
        return;
    }

    // Fan from vertex 0 — source polygons are convex.
    for j in 1..loop_indices.len() - 1 {
        let (i0, i1, i2) = (loop_indices[0], loop_indices[j], loop_indices[j + 1]);
        geo.indices.push(i0);
        geo.indices.push(i1);
        geo.indices.push(i2);
        accumulate_surface_vectors(&mut geo.vertices, i0, i1, i2);
    }
}

/// Build one output vertex: position mapped from disk space into renderer
/// space, UVs projected with the texinfo vectors.
fn emit_vertex(map: &MapRender, raw: u16, tex: &MTexInfo) -> Vertex3D {
    let pos = map.vertexes[raw as usize].position;

    // Texture projection happens in disk space.
    let s = dot_product(&pos, &[tex.vecs[0][0], tex.vecs[0][1], tex.vecs[0][2]]) + tex.vecs[0][3];
    let t = dot_product(&pos, &[tex.vecs[1][0], tex.vecs[1][1], tex.vecs[1][2]]) + tex.vecs[1][3];

    let dims = tex.image.unwrap_or(DEFAULT_IMAGE_DIMS);

    Vertex3D {
        position: [pos[0], pos[2], -pos[1]],
        uv0: [s / dims.width as f32, t / dims.height as f32],
        uv1: [s / LIGHTMAP_SCALE, t / LIGHTMAP_SCALE],
        normal: [0.0; 3],
        tangent: [0.0; 3],
    }
}

/// Accumulate the triangle's unnormalized face normal and UV-gradient
/// tangent into its three vertices. Shared vertices collect contributions
/// from every triangle that references them.
fn accumulate_surface_vectors(vertices: &mut [Vertex3D], i0: u32, i1: u32, i2: u32) {
    let v0 = vertices[i0 as usize];
    let v1 = vertices[i1 as usize];
    let v2 = vertices[i2 as usize];

    let edge1 = vector_subtract(&v1.position, &v0.position);
    let edge2 = vector_subtract(&v2.position, &v0.position);
    let normal = cross_product(&edge1, &edge2);

    let du1 = v1.uv0[0] - v0.uv0[0];
    let dv1 = v1.uv0[1] - v0.uv0[1];
    let du2 = v2.uv0[0] - v0.uv0[0];
    let dv2 = v2.uv0[1] - v0.uv0[1];

    let det = du1 * dv2 - du2 * dv1;
    let tangent = if det.abs() > UV_DEGENERATE_EPSILON {
        let f = 1.0 / det;
        [
            f * (dv2 * edge1[0] - dv1 * edge2[0]),
            f * (dv2 * edge1[1] - dv1 * edge2[1]),
            f * (dv2 * edge1[2] - dv1 * edge2[2]),
        ]
    } else {
        [0.0; 3]
    };

    for i in [i0, i1, i2] {
        let v = &mut vertices[i as usize];
        for k in 0..3 {
            v.normal[k] += normal[k];
            v.tangent[k] += tangent[k];
        }
    }
}

// =============================================================
//  Tests
// =============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt_local::test_support::{FakeTextures, TestPrintf};
    use crate::rt_model::test_bsp::single_triangle_map;
    use q2rt_common::q_shared::{vector_add, vector_length, Vec3};

    // ---------------------------------------------------------
    //  Hand-built map helpers
    // ---------------------------------------------------------

    fn axis_texinfo(image: Option<ImageDims>) -> MTexInfo {
        MTexInfo {
            vecs: [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]],
            name: "textures/e1u1/floor1_1.wal".to_string(),
            image,
            ..Default::default()
        }
    }

    fn map_base() -> MapRender {
        MapRender {
            name: "maps/handmade.bsp".to_string(),
            // edge 0 is a reserved dummy
            edges: vec![MEdge { v: [0, 0] }],
            texinfo: vec![axis_texinfo(None)],
            ..Default::default()
        }
    }

    fn push_verts(map: &mut MapRender, pts: &[Vec3]) {
        for &p in pts {
            map.vertexes.push(MVertex { position: p });
        }
    }

    fn expected_smooth_normal(contributions: &[Vec3]) -> Vec3 {
        let mut sum = [0.0; 3];
        for c in contributions {
            sum = vector_add(&sum, c);
        }
        vector_normalize(&mut sum);
        sum
    }

    fn assert_unit(v: &Vec3) {
        assert!((vector_length(v) - 1.0).abs() < 1e-5, "not unit length: {:?}", v);
    }

    // ---------------------------------------------------------
    //  Surfedge winding law
    // ---------------------------------------------------------

    #[test]
    fn positive_surfedge_takes_v0_negative_takes_v1() {
        let mut map = map_base();
        push_verts(&mut map, &[[0.0, 0.0, 0.0], [8.0, 0.0, 0.0], [8.0, 8.0, 0.0]]);
        map.edges.push(MEdge { v: [0, 1] }); // edge 1
        map.edges.push(MEdge { v: [2, 1] }); // edge 2, stored backwards
        map.edges.push(MEdge { v: [2, 0] }); // edge 3
        // loop 0 -> 1 -> 2 -> 0 needs edge 2 reversed
        map.surfedges = vec![1, -2, 3];
        map.surfaces = vec![MSurface { firstedge: 0, numedges: 3, texinfo: 0, ..Default::default() }];
        map.leaffaces = vec![0];
        map.leafs = vec![MLeaf { cluster: 0, area: 1, firstleafface: 0, numleaffaces: 1, ..Default::default() }];

        let ri = TestPrintf::new();
        let geo = build_leaf_geometry(&map, 0, &ri);

        // positions arrive in loop order: v0, v1, v2 (disk -> renderer mapping applied)
        assert_eq!(geo.vertices.len(), 3);
        assert_eq!(geo.vertices[0].position, [0.0, 0.0, 0.0]);
        assert_eq!(geo.vertices[1].position, [8.0, 0.0, 0.0]);
        assert_eq!(geo.vertices[2].position, [8.0, 0.0, -8.0]);
    }

    // ---------------------------------------------------------
    //  Triangulation
    // ---------------------------------------------------------

    #[test]
    fn quad_face_fans_into_two_triangles() {
        let mut map = map_base();
        push_verts(
            &mut map,
            &[[0.0, 0.0, 0.0], [16.0, 0.0, 0.0], [16.0, 16.0, 0.0], [0.0, 16.0, 0.0]],
        );
        map.edges.push(MEdge { v: [0, 1] });
        map.edges.push(MEdge { v: [1, 2] });
        map.edges.push(MEdge { v: [2, 3] });
        map.edges.push(MEdge { v: [3, 0] });
        map.surfedges = vec![1, 2, 3, 4];
        map.surfaces = vec![MSurface { firstedge: 0, numedges: 4, texinfo: 0, ..Default::default() }];
        map.leaffaces = vec![0];
        map.leafs = vec![MLeaf { cluster: 0, area: 1, firstleafface: 0, numleaffaces: 1, ..Default::default() }];

        let ri = TestPrintf::new();
        let geo = build_leaf_geometry(&map, 0, &ri);

        // N=4 edges -> N-2 = 2 triangles, fanned from vertex 0
        assert_eq!(geo.vertices.len(), 4);
        assert_eq!(geo.indices, vec![0, 1, 2, 0, 2, 3]);
        assert!(geo.indices.iter().all(|&i| (i as usize) < geo.vertices.len()));
    }

    // ---------------------------------------------------------
    //  Dedup
    // ---------------------------------------------------------

    #[test]
    fn same_vertex_under_different_texinfo_is_distinct() {
        let mut map = map_base();
        map.texinfo.push(axis_texinfo(Some(ImageDims { width: 64, height: 64 })));
        push_verts(&mut map, &[[0.0, 0.0, 0.0], [8.0, 0.0, 0.0], [0.0, 8.0, 0.0]]);
        map.edges.push(MEdge { v: [0, 1] });
        map.edges.push(MEdge { v: [1, 2] });
        map.edges.push(MEdge { v: [2, 0] });
        map.surfedges = vec![1, 2, 3];
        // the same loop under two texinfo contexts
        map.surfaces = vec![
            MSurface { firstedge: 0, numedges: 3, texinfo: 0, ..Default::default() },
            MSurface { firstedge: 0, numedges: 3, texinfo: 1, ..Default::default() },
        ];
        map.leaffaces = vec![0, 1];
        map.leafs = vec![MLeaf { cluster: 0, area: 1, firstleafface: 0, numleaffaces: 2, ..Default::default() }];

        let ri = TestPrintf::new();
        let geo = build_leaf_geometry(&map, 0, &ri);

        // distinct keys never alias: 3 vertices per texinfo context
        assert_eq!(geo.vertices.len(), 6);
        assert_eq!(geo.indices.len(), 6);
        // differing texture sizes produce differing uv0
        assert_ne!(geo.vertices[1].uv0, geo.vertices[4].uv0);
    }

    #[test]
    fn degenerate_face_registers_vertices_without_triangles() {
        let mut map = map_base();
        push_verts(&mut map, &[[0.0, 0.0, 0.0], [8.0, 0.0, 0.0], [0.0, 8.0, 0.0]]);
        map.edges.push(MEdge { v: [0, 1] });
        map.edges.push(MEdge { v: [1, 2] });
        map.edges.push(MEdge { v: [2, 0] });
        map.surfedges = vec![1, 2, 3];
        // face 0 is a two-edge degenerate; face 1 is the full loop
        map.surfaces = vec![
            MSurface { firstedge: 0, numedges: 2, texinfo: 0, ..Default::default() },
            MSurface { firstedge: 0, numedges: 3, texinfo: 0, ..Default::default() },
        ];
        map.leaffaces = vec![0, 1];
        map.leafs = vec![MLeaf { cluster: 0, area: 1, firstleafface: 0, numleaffaces: 2, ..Default::default() }];

        let ri = TestPrintf::new();
        let geo = build_leaf_geometry(&map, 0, &ri);

        // the degenerate face registered vertices 0 and 1; the valid face
        // reused them, so the leaf still has exactly 3 output vertices
        assert_eq!(geo.vertices.len(), 3);
        assert_eq!(geo.indices, vec![0, 1, 2]);
    }

    // ---------------------------------------------------------
    //  Leaf-face window truncation
    // ---------------------------------------------------------

    #[test]
    fn out_of_range_leafface_window_truncates_leaf_only() {
        let mut map = map_base();
        push_verts(&mut map, &[[0.0, 0.0, 0.0], [8.0, 0.0, 0.0], [0.0, 8.0, 0.0]]);
        map.edges.push(MEdge { v: [0, 1] });
        map.edges.push(MEdge { v: [1, 2] });
        map.edges.push(MEdge { v: [2, 0] });
        map.surfedges = vec![1, 2, 3];
        map.surfaces = vec![MSurface { firstedge: 0, numedges: 3, texinfo: 0, ..Default::default() }];
        map.leaffaces = vec![0];
        // the window claims 5 faces, only 1 exists
        map.leafs = vec![
            MLeaf { cluster: 0, area: 1, firstleafface: 0, numleaffaces: 5, ..Default::default() },
            MLeaf { cluster: 1, area: 1, firstleafface: 0, numleaffaces: 1, ..Default::default() },
        ];

        let ri = TestPrintf::new();
        let geos = build_leaf_geometries(&map, &ri);

        // the first face was still processed before the range ran out
        assert_eq!(geos[0].vertices.len(), 3);
        assert_eq!(geos[0].indices.len(), 3);
        assert!(ri.contains("bad leafface range in leaf 0"));
        // the other leaf is untouched
        assert_eq!(geos[1].vertices.len(), 3);
        assert!(!ri.contains("leaf 1"));
    }

    // ---------------------------------------------------------
    //  UVs
    // ---------------------------------------------------------

    #[test]
    fn uv_divides_by_texture_size_or_default() {
        let mut map = map_base();
        map.texinfo = vec![axis_texinfo(Some(ImageDims { width: 128, height: 64 }))];
        push_verts(&mut map, &[[128.0, 64.0, 0.0], [136.0, 64.0, 0.0], [128.0, 72.0, 0.0]]);
        map.edges.push(MEdge { v: [0, 1] });
        map.edges.push(MEdge { v: [1, 2] });
        map.edges.push(MEdge { v: [2, 0] });
        map.surfedges = vec![1, 2, 3];
        map.surfaces = vec![MSurface { firstedge: 0, numedges: 3, texinfo: 0, ..Default::default() }];
        map.leaffaces = vec![0];
        map.leafs = vec![MLeaf { cluster: 0, area: 1, firstleafface: 0, numleaffaces: 1, ..Default::default() }];

        let ri = TestPrintf::new();
        let geo = build_leaf_geometry(&map, 0, &ri);
        assert_eq!(geo.vertices[0].uv0, [1.0, 1.0]);

        // without a resolved texture the default 256x256 applies
        map.texinfo = vec![axis_texinfo(None)];
        let geo = build_leaf_geometry(&map, 0, &ri);
        assert_eq!(geo.vertices[0].uv0, [0.5, 0.25]);
        // uv1 is lightmap-density scaled, independent of the texture
        assert_eq!(geo.vertices[0].uv1, [8.0, 4.0]);
    }

    // ---------------------------------------------------------
    //  Normals and tangents (end-to-end through the loader)
    // ---------------------------------------------------------

    #[test]
    fn single_triangle_has_identical_unit_normals() {
        let data = single_triangle_map().build();
        let mut textures = FakeTextures::empty();
        let ri = TestPrintf::new();
        let map = MapRender::load("maps/test.bsp", &data, &mut textures, &ri).unwrap();

        let geo = &map.leaf_geometry[0];
        assert_eq!(geo.vertices.len(), 3);
        assert_eq!(geo.indices.len(), 3);

        let n0 = geo.vertices[0].normal;
        for v in &geo.vertices {
            assert_unit(&v.normal);
            assert_unit(&v.tangent);
            assert_eq!(v.normal, n0); // one shared face
        }
    }

    #[test]
    fn adjacent_faces_average_normals_at_shared_vertices() {
        // Two triangles sharing edge (v1, v2): A = (v0, v1, v2) flat in
        // the disk z=0 plane, B = (v1, v3, v2) tilted through v3.
        let mut map = map_base();
        push_verts(
            &mut map,
            &[
                [0.0, 0.0, 0.0],   // v0
                [16.0, 0.0, 0.0],  // v1
                [0.0, 16.0, 0.0],  // v2
                [16.0, 16.0, 8.0], // v3
            ],
        );
        map.edges.push(MEdge { v: [0, 1] }); // 1
        map.edges.push(MEdge { v: [1, 2] }); // 2
        map.edges.push(MEdge { v: [2, 0] }); // 3
        map.edges.push(MEdge { v: [1, 3] }); // 4
        map.edges.push(MEdge { v: [3, 2] }); // 5
        map.surfedges = vec![1, 2, 3, 4, 5, -2];
        map.surfaces = vec![
            MSurface { firstedge: 0, numedges: 3, texinfo: 0, ..Default::default() },
            MSurface { firstedge: 3, numedges: 3, texinfo: 0, ..Default::default() },
        ];
        map.leaffaces = vec![0, 1];
        map.leafs = vec![MLeaf { cluster: 0, area: 1, firstleafface: 0, numleaffaces: 2, ..Default::default() }];

        let ri = TestPrintf::new();
        let geo = build_leaf_geometry(&map, 0, &ri);

        // shared vertices deduplicated: v0..v3 -> 4 outputs, 2 triangles
        assert_eq!(geo.vertices.len(), 4);
        assert_eq!(geo.indices.len(), 6);
        // face B reuses output indices 1 and 2 for the shared edge
        assert_eq!(geo.indices[0..3], [0, 1, 2]);
        assert_eq!(geo.indices[3..6], [1, 3, 2]);

        // recompute the two unnormalized face normals in renderer space
        let p = |i: usize| geo.vertices[i].position;
        let na = cross_product(
            &vector_subtract(&p(1), &p(0)),
            &vector_subtract(&p(2), &p(0)),
        );
        let nb = cross_product(
            &vector_subtract(&p(3), &p(1)),
            &vector_subtract(&p(2), &p(1)),
        );

        let expected = expected_smooth_normal(&[na, nb]);
        for shared in [1usize, 2] {
            let n = geo.vertices[shared].normal;
            assert_unit(&n);
            for k in 0..3 {
                assert!((n[k] - expected[k]).abs() < 1e-5, "vertex {}: {:?} != {:?}", shared, n, expected);
            }
            // the averaged direction matches neither raw face normal
            let mut na_unit = na;
            vector_normalize(&mut na_unit);
            assert!((0..3).any(|k| (n[k] - na_unit[k]).abs() > 1e-4));
        }

        // unshared vertices carry their single face's normal
        assert_unit(&geo.vertices[0].normal);
        assert_unit(&geo.vertices[3].normal);
    }

    #[test]
    fn empty_leaf_produces_empty_mesh() {
        let mut map = map_base();
        map.leafs = vec![MLeaf { cluster: -1, area: 0, firstleafface: 0, numleaffaces: 0, ..Default::default() }];
        let ri = TestPrintf::new();
        let geo = build_leaf_geometry(&map, 0, &ri);
        assert!(geo.vertices.is_empty());
        assert!(geo.indices.is_empty());
        assert!(ri.messages.lock().is_empty());
    }
}
