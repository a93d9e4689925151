// rt_image.rs — texture dimension lookup
//
// The pipeline never decodes pixel data; it only needs pixel width and
// height to normalize UVs. WAL files carry both in their header.

use crate::rt_local::{ImageDims, ImageType, TextureLoader};
use parking_lot::Mutex;
use q2rt_common::qfiles::MIPTEX_HEADER_SIZE;
use std::collections::HashMap;
use std::path::PathBuf;

/// Parse width/height out of a WAL header.
pub fn miptex_dims(raw: &[u8]) -> Option<ImageDims> {
    if raw.len() < MIPTEX_HEADER_SIZE {
        return None;
    }
    let width = u32::from_le_bytes([raw[32], raw[33], raw[34], raw[35]]);
    let height = u32::from_le_bytes([raw[36], raw[37], raw[38], raw[39]]);
    if width == 0 || height == 0 || width > 4096 || height > 4096 {
        return None;
    }
    Some(ImageDims { width, height })
}

/// TextureLoader that reads WAL headers from a game data directory.
/// Lookups are cached (including misses) behind one lock so concurrent
/// stages share a single synchronization point.
pub struct WalTextureLoader {
    base_dir: PathBuf,
    cache: Mutex<HashMap<String, Option<ImageDims>>>,
}

impl WalTextureLoader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl TextureLoader for WalTextureLoader {
    fn find_image(&mut self, name: &str, _kind: ImageType) -> Option<ImageDims> {
        let mut cache = self.cache.lock();
        if let Some(&dims) = cache.get(name) {
            return dims;
        }
        let dims = std::fs::read(self.base_dir.join(name))
            .ok()
            .and_then(|raw| miptex_dims(&raw));
        cache.insert(name.to_string(), dims);
        dims
    }
}

/// TextureLoader for headless runs: every lookup misses, so geometry
/// assembly falls back to the default UV normalization size.
pub struct NoTextures;

impl TextureLoader for NoTextures {
    fn find_image(&mut self, _name: &str, _kind: ImageType) -> Option<ImageDims> {
        None
    }
}

// =============================================================
//  Tests
// =============================================================
