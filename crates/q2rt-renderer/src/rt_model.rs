// rt_model.rs — BSP map loading
//
// Validates the lump directory, decodes every lump the ray-tracing path
// consumes into typed records, then hands the decoded map to the leaf
// geometry assembler. All reads go through a bounds-validated byte slice;
// every cross reference is range-checked at decode time so later stages
// can index without failure paths.

use crate::rt_light::{self, MapLight};
use crate::rt_local::*;
use crate::rt_surf;
use q2rt_common::q_shared::{vector_length, SurfFlags, Vec3, PRINT_ALL, PRINT_DEVELOPER};
use q2rt_common::qfiles::*;
use rayon::prelude::*;

/// Below this record count, sequential decoding is faster than rayon.
const PARALLEL_LUMP_THRESHOLD: usize = 64;

// =============================================================
//  Byte helpers
// =============================================================

// from_le_bytes performs the LittleLong/LittleShort/LittleFloat
// correction: identity on little-endian hosts, byte-swap otherwise.

fn read_i32_le(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_i16_le(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_f32_le(data: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn lump_slice<'a>(data: &'a [u8], l: &Lump) -> &'a [u8] {
    let ofs = l.fileofs as usize;
    &data[ofs..ofs + l.filelen as usize]
}

// =============================================================
//  RadiusFromBounds
// =============================================================

pub fn radius_from_bounds(mins: &Vec3, maxs: &Vec3) -> f32 {
    let mut corner = [0.0f32; 3];
    for i in 0..3 {
        corner[i] = mins[i].abs().max(maxs[i].abs());
    }
    vector_length(&corner)
}

// =============================================================
//  Whole-file checksum (reload detection)
// =============================================================

pub fn block_checksum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i + 4 <= data.len() {
        sum = sum.wrapping_add(u32::from_le_bytes([
            data[i],
            data[i + 1],
            data[i + 2],
            data[i + 3],
        ]));
        i += 4;
    }
    sum
}

// =============================================================
//  Lump decoders
// =============================================================

fn load_vertexes(name: &str, data: &[u8], l: &Lump) -> Result<Vec<MVertex>, String> {
    let stride = std::mem::size_of::<DVertex>();
    let len = l.filelen as usize;
    if len % stride != 0 {
        return Err(format!("Mod_LoadVertexes: funny lump size in {}", name));
    }
    let count = len / stride;
    if count > MAX_MAP_VERTS {
        return Err(format!("Mod_LoadVertexes: too many vertexes in {}", name));
    }

    let lump = lump_slice(data, l);
    let decode = |i: usize| {
        let base = i * stride;
        MVertex {
            position: [
                read_f32_le(lump, base),
                read_f32_le(lump, base + 4),
                read_f32_le(lump, base + 8),
            ],
        }
    };

    if count >= PARALLEL_LUMP_THRESHOLD {
        Ok((0..count).into_par_iter().map(decode).collect())
    } else {
        Ok((0..count).map(decode).collect())
    }
}

fn load_edges(name: &str, data: &[u8], l: &Lump, numvertexes: usize) -> Result<Vec<MEdge>, String> {
    let stride = std::mem::size_of::<DEdge>();
    let len = l.filelen as usize;
    if len % stride != 0 {
        return Err(format!("Mod_LoadEdges: funny lump size in {}", name));
    }
    let count = len / stride;
    if count > MAX_MAP_EDGES {
        return Err(format!("Mod_LoadEdges: too many edges in {}", name));
    }

    let lump = lump_slice(data, l);
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let base = i * stride;
        let v = [read_u16_le(lump, base), read_u16_le(lump, base + 2)];
        if v[0] as usize >= numvertexes || v[1] as usize >= numvertexes {
            return Err(format!("Mod_LoadEdges: bad vertex number in {}", name));
        }
        out.push(MEdge { v });
    }
    Ok(out)
}

fn load_surfedges(name: &str, data: &[u8], l: &Lump, numedges: usize) -> Result<Vec<i32>, String> {
    let stride = std::mem::size_of::<i32>();
    let len = l.filelen as usize;
    if len % stride != 0 {
        return Err(format!("Mod_LoadSurfedges: funny lump size in {}", name));
    }
    let count = len / stride;
    if count < 1 || count >= MAX_MAP_SURFEDGES {
        return Err(format!(
            "Mod_LoadSurfedges: bad surfedges count in {}: {}",
            name, count
        ));
    }

    let lump = lump_slice(data, l);
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let s = read_i32_le(lump, i * stride);
        if s.unsigned_abs() as usize >= numedges {
            return Err(format!("Mod_LoadSurfedges: bad edge number in {}", name));
        }
        out.push(s);
    }
    Ok(out)
}

fn load_lighting(data: &[u8], l: &Lump) -> Vec<u8> {
    lump_slice(data, l).to_vec()
}

fn load_planes(name: &str, data: &[u8], l: &Lump) -> Result<Vec<MPlane>, String> {
    let stride = std::mem::size_of::<DPlane>();
    let len = l.filelen as usize;
    if len % stride != 0 {
        return Err(format!("Mod_LoadPlanes: funny lump size in {}", name));
    }
    let count = len / stride;
    if count > MAX_MAP_PLANES {
        return Err(format!("Mod_LoadPlanes: too many planes in {}", name));
    }

    let lump = lump_slice(data, l);
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let base = i * stride;
        let mut plane = MPlane::default();
        let mut bits: u8 = 0;
        for j in 0..3 {
            plane.normal[j] = read_f32_le(lump, base + j * 4);
            if plane.normal[j] < 0.0 {
                bits |= 1 << j;
            }
        }
        plane.dist = read_f32_le(lump, base + 12);
        plane.plane_type = read_i32_le(lump, base + 16) as u8;
        plane.signbits = bits;
        out.push(plane);
    }
    Ok(out)
}

fn load_texinfo(
    name: &str,
    data: &[u8],
    l: &Lump,
    textures: &mut dyn TextureLoader,
    ri: &dyn RefImport,
) -> Result<Vec<MTexInfo>, String> {
    let stride = std::mem::size_of::<TexInfo>();
    let len = l.filelen as usize;
    if len % stride != 0 {
        return Err(format!("Mod_LoadTexinfo: funny lump size in {}", name));
    }
    let count = len / stride;
    if count > MAX_MAP_TEXINFO {
        return Err(format!("Mod_LoadTexinfo: too many texinfo in {}", name));
    }

    let lump = lump_slice(data, l);
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let base = i * stride;
        let mut ti = MTexInfo::default();
        for j in 0..2 {
            for k in 0..4 {
                ti.vecs[j][k] = read_f32_le(lump, base + (j * 4 + k) * 4);
            }
        }
        ti.flags = SurfFlags::from_bits_retain(read_i32_le(lump, base + 32));
        ti.value = read_i32_le(lump, base + 36);

        let tex_bytes = &lump[base + 40..base + 72];
        let name_len = tex_bytes.iter().position(|&b| b == 0).unwrap_or(32);
        let texture = String::from_utf8_lossy(&tex_bytes[..name_len]).to_string();
        ti.name = format!("textures/{}.wal", texture);
        out.push(ti);
    }

    // Resolve texture dimensions through the external loader. A missing
    // texture is not fatal; UV normalization falls back to 256x256.
    for ti in out.iter_mut() {
        let kind = if ti.flags.contains(SurfFlags::SKY) {
            ImageType::Sky
        } else {
            ImageType::Wall
        };
        ti.image = textures.find_image(&ti.name, kind);
        if ti.image.is_none() {
            ri.con_printf(PRINT_ALL, &format!("Couldn't load {}\n", ti.name));
        }
    }

    Ok(out)
}

fn load_faces(
    name: &str,
    data: &[u8],
    l: &Lump,
    numtexinfo: usize,
    numsurfedges: usize,
) -> Result<Vec<MSurface>, String> {
    let stride = std::mem::size_of::<DFace>();
    let len = l.filelen as usize;
    if len % stride != 0 {
        return Err(format!("Mod_LoadFaces: funny lump size in {}", name));
    }
    let count = len / stride;
    if count > MAX_MAP_FACES {
        return Err(format!("Mod_LoadFaces: too many faces in {}", name));
    }

    let lump = lump_slice(data, l);
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let base = i * stride;
        let surf = MSurface {
            planenum: read_u16_le(lump, base),
            side: read_i16_le(lump, base + 2),
            firstedge: read_i32_le(lump, base + 4),
            numedges: read_i16_le(lump, base + 8) as i32,
            texinfo: read_i16_le(lump, base + 10) as i32,
            styles: [
                lump[base + 12],
                lump[base + 13],
                lump[base + 14],
                lump[base + 15],
            ],
            lightofs: read_i32_le(lump, base + 16),
        };

        if surf.texinfo < 0 || surf.texinfo as usize >= numtexinfo {
            return Err(format!("Mod_LoadFaces: bad texinfo number in {}", name));
        }
        if surf.firstedge < 0
            || surf.numedges < 0
            || surf.firstedge as usize + surf.numedges as usize > numsurfedges
        {
            return Err(format!("Mod_LoadFaces: bad surfedge range in {}", name));
        }
        out.push(surf);
    }
    Ok(out)
}

fn load_leaffaces(name: &str, data: &[u8], l: &Lump, numsurfaces: usize) -> Result<Vec<u16>, String> {
    let stride = std::mem::size_of::<u16>();
    let len = l.filelen as usize;
    if len % stride != 0 {
        return Err(format!("Mod_LoadLeaffaces: funny lump size in {}", name));
    }
    let count = len / stride;
    if count > MAX_MAP_LEAFFACES {
        return Err(format!("Mod_LoadLeaffaces: too many leaffaces in {}", name));
    }

    let lump = lump_slice(data, l);
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let j = read_u16_le(lump, i * stride);
        if j as usize >= numsurfaces {
            return Err(format!("Mod_LoadLeaffaces: bad surface number in {}", name));
        }
        out.push(j);
    }
    Ok(out)
}

fn load_leafs(name: &str, data: &[u8], l: &Lump) -> Result<Vec<MLeaf>, String> {
    let stride = std::mem::size_of::<DLeaf>();
    let len = l.filelen as usize;
    if len % stride != 0 {
        return Err(format!("Mod_LoadLeafs: funny lump size in {}", name));
    }
    let count = len / stride;
    if count > MAX_MAP_LEAFS {
        return Err(format!("Mod_LoadLeafs: too many leafs in {}", name));
    }

    let lump = lump_slice(data, l);
    let decode = |i: usize| {
        let base = i * stride;
        MLeaf {
            contents: read_i32_le(lump, base),
            cluster: read_i16_le(lump, base + 4) as i32,
            area: read_i16_le(lump, base + 6) as i32,
            mins: [
                read_i16_le(lump, base + 8),
                read_i16_le(lump, base + 10),
                read_i16_le(lump, base + 12),
            ],
            maxs: [
                read_i16_le(lump, base + 14),
                read_i16_le(lump, base + 16),
                read_i16_le(lump, base + 18),
            ],
            firstleafface: read_u16_le(lump, base + 20),
            numleaffaces: read_u16_le(lump, base + 22),
        }
    };

    if count >= PARALLEL_LUMP_THRESHOLD {
        Ok((0..count).into_par_iter().map(decode).collect())
    } else {
        Ok((0..count).map(decode).collect())
    }
}

fn load_nodes(name: &str, data: &[u8], l: &Lump) -> Result<Vec<MNode>, String> {
    let stride = std::mem::size_of::<DNode>();
    let len = l.filelen as usize;
    if len % stride != 0 {
        return Err(format!("Mod_LoadNodes: funny lump size in {}", name));
    }
    let count = len / stride;
    if count > MAX_MAP_NODES {
        return Err(format!("Mod_LoadNodes: too many nodes in {}", name));
    }

    let lump = lump_slice(data, l);
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let base = i * stride;
        out.push(MNode {
            planenum: read_i32_le(lump, base),
            children: [read_i32_le(lump, base + 4), read_i32_le(lump, base + 8)],
            mins: [
                read_i16_le(lump, base + 12),
                read_i16_le(lump, base + 14),
                read_i16_le(lump, base + 16),
            ],
            maxs: [
                read_i16_le(lump, base + 18),
                read_i16_le(lump, base + 20),
                read_i16_le(lump, base + 22),
            ],
            firstface: read_u16_le(lump, base + 24),
            numfaces: read_u16_le(lump, base + 26),
        });
    }
    Ok(out)
}

fn load_submodels(name: &str, data: &[u8], l: &Lump) -> Result<Vec<MModel>, String> {
    let stride = std::mem::size_of::<DModel>();
    let len = l.filelen as usize;
    if len % stride != 0 {
        return Err(format!("Mod_LoadSubmodels: funny lump size in {}", name));
    }
    let count = len / stride;
    if count > MAX_MAP_MODELS {
        return Err(format!("Mod_LoadSubmodels: too many submodels in {}", name));
    }

    let lump = lump_slice(data, l);
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let base = i * stride;
        let mut m = MModel::default();
        for j in 0..3 {
            // spread the bounds slightly, the disk values are exact
            m.mins[j] = read_f32_le(lump, base + j * 4) - 1.0;
            m.maxs[j] = read_f32_le(lump, base + 12 + j * 4) + 1.0;
            m.origin[j] = read_f32_le(lump, base + 24 + j * 4);
        }
        m.radius = radius_from_bounds(&m.mins, &m.maxs);
        m.headnode = read_i32_le(lump, base + 36);
        m.firstface = read_i32_le(lump, base + 40);
        m.numfaces = read_i32_le(lump, base + 44);
        out.push(m);
    }
    Ok(out)
}

fn load_visibility(name: &str, data: &[u8], l: &Lump) -> Result<VisData, String> {
    let len = l.filelen as usize;
    if len == 0 {
        return Ok(VisData::default());
    }
    if len > MAX_MAP_VISIBILITY {
        return Err(format!("Mod_LoadVisibility: too large visibility lump in {}", name));
    }

    let lump = lump_slice(data, l);
    let numclusters = read_i32_le(lump, 0);
    if numclusters < 0 || 4 + numclusters as usize * 8 > len {
        return Err(format!("Mod_LoadVisibility: bad visibility data in {}", name));
    }

    let mut bitofs = Vec::with_capacity(numclusters as usize);
    for i in 0..numclusters as usize {
        let base = 4 + i * 8;
        bitofs.push([read_i32_le(lump, base), read_i32_le(lump, base + 4)]);
    }

    Ok(VisData {
        numclusters: numclusters as usize,
        bitofs,
        data: lump.to_vec(),
    })
}

fn load_entity_string(name: &str, data: &[u8], l: &Lump) -> Result<String, String> {
    let len = l.filelen as usize;
    if len > MAX_MAP_ENTSTRING {
        return Err(format!("Mod_LoadEntityString: Map has too large entity lump in {}", name));
    }
    let lump = lump_slice(data, l);
    // the blob is nominally null-terminated text
    let end = lump.iter().position(|&b| b == 0).unwrap_or(len);
    Ok(String::from_utf8_lossy(&lump[..end]).to_string())
}

// =============================================================
//  MapRender
// =============================================================

/// A fully loaded map: decoded lumps, parsed lights, and per-leaf
/// geometry ready for acceleration-structure building.
#[derive(Debug, Default)]
pub struct MapRender {
    pub name: String,
    pub checksum: u32,

    // Decoded disk lumps. These may be released with clear_disk_data()
    // once leaf geometry and GPU structures exist.
    pub planes: Vec<MPlane>,
    pub vertexes: Vec<MVertex>,
    pub edges: Vec<MEdge>,
    pub surfedges: Vec<i32>,
    pub texinfo: Vec<MTexInfo>,
    pub surfaces: Vec<MSurface>,
    pub leaffaces: Vec<u16>,
    pub leafs: Vec<MLeaf>,
    pub nodes: Vec<MNode>,
    pub submodels: Vec<MModel>,
    pub vis: VisData,
    pub lightdata: Vec<u8>,
    pub entity_string: String,

    // Derived data owned for the lifetime of the map.
    pub lights: Vec<MapLight>,
    pub leaf_geometry: Vec<LeafGeometry>,
}

impl MapRender {
    /// Load a BSP map from raw file bytes.
    ///
    /// Format violations (wrong ident/version, short file, lump sizes that
    /// are not an exact record multiple, out-of-range cross references)
    /// are fatal and abort the load. Missing textures and per-leaf
    /// degradations are reported through `ri` and loading continues.
    pub fn load(
        name: &str,
        data: &[u8],
        textures: &mut dyn TextureLoader,
        ri: &dyn RefImport,
    ) -> Result<MapRender, String> {
        if data.len() < std::mem::size_of::<DHeader>() {
            return Err(format!("Mod_LoadBrushModel: {} file too small", name));
        }

        let ident = read_i32_le(data, 0);
        if ident != IDBSPHEADER {
            return Err(format!("Mod_LoadBrushModel: {} is not a BSP file", name));
        }
        let version = read_i32_le(data, 4);
        if version != BSPVERSION {
            return Err(format!(
                "Mod_LoadBrushModel: {} has wrong version number ({} should be {})",
                name, version, BSPVERSION
            ));
        }

        // Swap and validate the directory before touching any lump.
        let mut lumps = [Lump::default(); HEADER_LUMPS];
        for i in 0..HEADER_LUMPS {
            let base = 8 + i * 8;
            lumps[i].fileofs = read_i32_le(data, base);
            lumps[i].filelen = read_i32_le(data, base + 4);
            if lumps[i].fileofs < 0
                || lumps[i].filelen < 0
                || lumps[i].fileofs as usize + lumps[i].filelen as usize > data.len()
            {
                return Err(format!(
                    "Mod_LoadBrushModel: lump {} extends past end of file in {}",
                    i, name
                ));
            }
        }

        let mut map = MapRender {
            name: name.to_string(),
            checksum: block_checksum(data),
            ..Default::default()
        };

        map.vertexes = load_vertexes(name, data, &lumps[LUMP_VERTEXES])?;
        map.edges = load_edges(name, data, &lumps[LUMP_EDGES], map.vertexes.len())?;
        map.surfedges = load_surfedges(name, data, &lumps[LUMP_SURFEDGES], map.edges.len())?;
        map.lightdata = load_lighting(data, &lumps[LUMP_LIGHTING]);
        map.planes = load_planes(name, data, &lumps[LUMP_PLANES])?;
        map.texinfo = load_texinfo(name, data, &lumps[LUMP_TEXINFO], textures, ri)?;
        map.surfaces = load_faces(
            name,
            data,
            &lumps[LUMP_FACES],
            map.texinfo.len(),
            map.surfedges.len(),
        )?;
        map.leaffaces = load_leaffaces(name, data, &lumps[LUMP_LEAFFACES], map.surfaces.len())?;
        map.vis = load_visibility(name, data, &lumps[LUMP_VISIBILITY])?;
        map.leafs = load_leafs(name, data, &lumps[LUMP_LEAFS])?;
        map.nodes = load_nodes(name, data, &lumps[LUMP_NODES])?;
        map.submodels = load_submodels(name, data, &lumps[LUMP_MODELS])?;
        map.entity_string = load_entity_string(name, data, &lumps[LUMP_ENTITIES])?;

        map.lights = rt_light::parse_map_lights(&map.entity_string, ri)?;
        let leaf_geometry = rt_surf::build_leaf_geometries(&map, ri);
        map.leaf_geometry = leaf_geometry;

        ri.con_printf(
            PRINT_DEVELOPER,
            &format!(
                "{}: {} leafs, {} faces, {} lights\n",
                name,
                map.leafs.len(),
                map.surfaces.len(),
                map.lights.len()
            ),
        );

        Ok(map)
    }

    /// Decompressed PVS row for a cluster. Cluster -1 (or a map without
    /// visibility data) sees everything.
    pub fn cluster_pvs(&self, cluster: i32) -> Vec<u8> {
        let row = (self.vis.numclusters + 7) >> 3;
        if cluster < 0 || cluster as usize >= self.vis.numclusters || row == 0 {
            return vec![0xFF; row.max(1)];
        }

        let mut out = Vec::with_capacity(row);
        let mut i = self.vis.bitofs[cluster as usize][DVIS_PVS] as usize;
        while out.len() < row {
            if i >= self.vis.data.len() {
                break; // truncated vis data
            }
            let b = self.vis.data[i];
            i += 1;
            if b != 0 {
                out.push(b);
                continue;
            }
            // run of zero bytes
            if i >= self.vis.data.len() {
                break;
            }
            let c = self.vis.data[i] as usize;
            i += 1;
            if c == 0 {
                break;
            }
            for _ in 0..c {
                if out.len() < row {
                    out.push(0);
                }
            }
        }
        out.resize(row, 0);
        out
    }

    /// Release decoded disk lumps to bound peak memory. Leaf geometry,
    /// lights, the BSP tree and visibility stay with the map.
    pub fn clear_disk_data(&mut self) {
        self.vertexes = Vec::new();
        self.edges = Vec::new();
        self.surfedges = Vec::new();
        self.texinfo = Vec::new();
        self.surfaces = Vec::new();
        self.leaffaces = Vec::new();
        self.lightdata = Vec::new();
        self.entity_string = String::new();
    }
}

// =============================================================
//  Synthetic BSP builder for tests
// =============================================================


// =============================================================
//  Tests
// =============================================================
