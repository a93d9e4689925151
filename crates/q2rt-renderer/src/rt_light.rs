// rt_light.rs — static light extraction from the entities lump
//
// The entities lump is a text blob of { "key" "value" ... } blocks. Only
// light entities are retained; everything else (worldspawn, items,
// monsters) belongs to the game, not the renderer.

use crate::rt_local::RefImport;
use q2rt_common::q_shared::{com_parse, Vec3, PRINT_DEVELOPER};

/// Entity classnames that produce a static light.
pub const LIGHT_CLASSNAMES: [&str; 3] = ["light", "light_mine1", "light_mine2"];

/// Default light intensity when the "light" key is absent.
pub const DEFAULT_LIGHT_INTENSITY: f32 = 300.0;

#[derive(Debug, Clone)]
pub struct MapLight {
    pub origin: Vec3,
    pub color: Vec3,
    /// Attenuation coefficients: base intensity and distance falloff.
    pub intensity: f32,
    pub falloff: f32,
    /// Spotlight cone angle in degrees, 0 for omni lights.
    pub cone: f32,
    pub style: i32,
    pub spawnflags: i32,
}

impl Default for MapLight {
    fn default() -> Self {
        Self {
            origin: [0.0, 0.0, 0.0],
            color: [1.0, 1.0, 1.0],
            intensity: DEFAULT_LIGHT_INTENSITY,
            falloff: 0.0,
            cone: 0.0,
            style: 0,
            spawnflags: 0,
        }
    }
}

fn parse_vec3(value: &str, ri: &dyn RefImport) -> Option<Vec3> {
    let mut out = [0.0f32; 3];
    let mut n = 0;
    for part in value.split_whitespace() {
        if n == 3 {
            n += 1;
            break;
        }
        match part.parse::<f32>() {
            Ok(v) => out[n] = v,
            Err(_) => {
                n = usize::MAX;
                break;
            }
        }
        n += 1;
    }
    if n != 3 {
        ri.con_printf(PRINT_DEVELOPER, &format!("bad vector value: {}\n", value));
        return None;
    }
    Some(out)
}

fn apply_light_field(light: &mut MapLight, key: &str, value: &str, ri: &dyn RefImport) {
    match key {
        "origin" => {
            if let Some(v) = parse_vec3(value, ri) {
                light.origin = v;
            }
        }
        "_color" => {
            if let Some(v) = parse_vec3(value, ri) {
                light.color = v;
            }
        }
        "light" => light.intensity = value.parse().unwrap_or(DEFAULT_LIGHT_INTENSITY),
        "_falloff" => light.falloff = value.parse().unwrap_or(0.0),
        "_cone" => light.cone = value.parse().unwrap_or(0.0),
        "style" => light.style = value.parse().unwrap_or(0),
        "spawnflags" => light.spawnflags = value.parse().unwrap_or(0),
        _ => {} // editor-only keys and game fields
    }
}

/// Parse one `{ ... }` block into its key/value pairs. Returns the pairs
/// and the remaining text after the closing brace.
fn parse_entity_block<'a>(data: &'a str) -> Result<(Vec<(String, String)>, Option<&'a str>), String> {
    let mut pairs = Vec::new();
    let mut remaining = data;

    loop {
        let (token, rest) = com_parse(remaining);
        if token == "}" {
            return Ok((pairs, rest));
        }
        let rest = match rest {
            Some(r) => r,
            None => return Err("ED_ParseEntity: EOF without closing brace".to_string()),
        };
        let keyname = token;

        let (token, rest) = com_parse(rest);
        if token == "}" {
            return Err("ED_ParseEntity: closing brace without data".to_string());
        }
        pairs.push((keyname, token));
        remaining = match rest {
            Some(r) => r,
            None => return Err("ED_ParseEntity: EOF without closing brace".to_string()),
        };
    }
}

/// Extract static lights from the entities text.
pub fn parse_map_lights(entity_string: &str, ri: &dyn RefImport) -> Result<Vec<MapLight>, String> {
    let mut lights = Vec::new();
    let mut remaining = entity_string;

    loop {
        let (token, rest) = com_parse(remaining);
        if token.is_empty() && rest.is_none() {
            break;
        }
        if token != "{" {
            return Err(format!(
                "Mod_ParseEntities: found {} when expecting {{",
                token
            ));
        }
        let rest = match rest {
            Some(r) => r,
            None => return Err("ED_ParseEntity: EOF without closing brace".to_string()),
        };

        let (pairs, after) = parse_entity_block(rest)?;

        let classname = pairs
            .iter()
            .find(|(k, _)| k == "classname")
            .map(|(_, v)| v.as_str())
            .unwrap_or("");
        if LIGHT_CLASSNAMES.contains(&classname) {
            let mut light = MapLight::default();
            for (k, v) in &pairs {
                apply_light_field(&mut light, k, v, ri);
            }
            lights.push(light);
        }

        remaining = match after {
            Some(r) => r,
            None => break,
        };
    }

    Ok(lights)
}

// =============================================================
//  Tests
// =============================================================
