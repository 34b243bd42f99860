//! Compact, filesystem-safe names for per-facility exposure artifacts.
//!
//! A name is `{geounit initial}{model code}{facid}[c{chunk id}{num chunks}]`:
//!
//! ```txt
//! hA20        house, aermod, facility 20
//! hU5f37c39   house, uniform kernel 5 km, facility 37, chunk 3 of 9
//! ```
//!
//! Kernel model codes end in a literal `f` so the bandwidth digits can be told
//! apart from the facility id. Chunk fields are written in base 62, one
//! character each for fewer than 62 chunks. Larger counts use two characters per
//! field with the chunk id zero-padded to the width of the count.
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{invalid, AirqError, Result};
use crate::model::{ExposureModel, FacId, Geounit};

pub const CHUNK_ID_BASE: u32 = 62;
/// Largest chunk count that fits in two base-62 characters.
pub const MAX_CHUNKS: u32 = CHUNK_ID_BASE * CHUNK_ID_BASE - 1;
/// Extension of every cached table.
pub const ARTIFACT_EXTENSION: &str = "parquet";

const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Position of one chunk within a facility's stack partition. `chunk_id` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkInfo {
    pub chunk_id: u32,
    pub num_chunks: u32,
}

impl ChunkInfo {
    pub fn new(chunk_id: u32, num_chunks: u32) -> Result<Self> {
        if chunk_id == 0 || chunk_id > num_chunks || num_chunks > MAX_CHUNKS {
            return Err(invalid(format!(
                "Chunk's id {chunk_id} is out of bounds for num of chunks {num_chunks}"
            )));
        }
        Ok(Self {
            chunk_id,
            num_chunks,
        })
    }

    /// Every chunk of a facility split `num_chunks` ways.
    pub fn all(num_chunks: u32) -> Result<Vec<Self>> {
        (1..=num_chunks).map(|id| Self::new(id, num_chunks)).collect()
    }
}

impl fmt::Display for ChunkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chunk_id, self.num_chunks)
    }
}

impl FromStr for ChunkInfo {
    type Err = AirqError;

    /// Parses the `id/n` form used on the command line.
    fn from_str(s: &str) -> Result<Self> {
        let (id, n) = s
            .split_once('/')
            .ok_or_else(|| invalid(format!("Chunk '{s}' is not of the form id/n")))?;
        let id = id.trim().parse().map_err(|_| invalid(format!("Bad chunk id in '{s}'")))?;
        let n = n.trim().parse().map_err(|_| invalid(format!("Bad chunk count in '{s}'")))?;
        Self::new(id, n)
    }
}

pub fn int_to_base62(mut n: u32) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % CHUNK_ID_BASE) as usize]);
        n /= CHUNK_ID_BASE;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

pub fn base62_to_int(s: &str) -> Option<u32> {
    if s.is_empty() {
        return None;
    }
    s.bytes().try_fold(0u32, |acc, b| {
        let digit = DIGITS.iter().position(|&d| d == b)? as u32;
        acc.checked_mul(CHUNK_ID_BASE)?.checked_add(digit)
    })
}

/// Name prefix shared by every artifact of one `(geounit, model)` pair.
pub fn model_prefix(geounit: Geounit, model: ExposureModel) -> String {
    let code = match model {
        ExposureModel::Dispersion => "A".to_string(),
        ExposureModel::Kernel { kind, bandwidth_km } => {
            format!("{}{}f", kind.letter(), bandwidth_km)
        }
    };
    format!("{}{}", geounit.initial(), code)
}

pub fn encode(
    geounit: Geounit,
    model: ExposureModel,
    facid: FacId,
    chunk: Option<ChunkInfo>,
) -> Result<String> {
    if facid < 0 {
        return Err(invalid(format!("Facility id {facid} must be non-negative")));
    }
    let mut name = format!("{}{}", model_prefix(geounit, model), facid);
    if let Some(chunk) = chunk {
        let num_chunks = int_to_base62(chunk.num_chunks);
        let chunk_id = format!(
            "{:0>width$}",
            int_to_base62(chunk.chunk_id),
            width = num_chunks.len()
        );
        name.push('c');
        name.push_str(&chunk_id);
        name.push_str(&num_chunks);
    }
    Ok(name)
}

/// Artifact file name, `encode` plus the extension.
pub fn file_name(
    geounit: Geounit,
    model: ExposureModel,
    facid: FacId,
    chunk: Option<ChunkInfo>,
) -> Result<String> {
    Ok(format!(
        "{}.{ARTIFACT_EXTENSION}",
        encode(geounit, model, facid, chunk)?
    ))
}

/// Recover the facility id and chunk from a chunked artifact's file name (or path).
pub fn decode(name: &str) -> Result<(FacId, ChunkInfo)> {
    let err = || AirqError::ParseError(name.to_string());

    let file = Path::new(name)
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(err)?;
    let stem = file
        .strip_suffix(ARTIFACT_EXTENSION)
        .and_then(|s| s.strip_suffix('.'))
        .ok_or_else(err)?;

    let mut chars = stem.chars();
    let initial = chars.next().ok_or_else(err)?;
    Geounit::from_initial(initial).ok_or_else(err)?;
    let rest = chars.as_str();

    let rest = match rest.strip_prefix('A') {
        Some(after_model) => after_model,
        None => {
            let mut chars = rest.chars();
            let letter = chars.next().ok_or_else(err)?;
            crate::model::KernelKind::from_letter(letter).ok_or_else(err)?;
            let (band, after_band) = split_digits(chars.as_str());
            if band.is_empty() {
                return Err(err());
            }
            after_band.strip_prefix('f').ok_or_else(err)?
        }
    };

    let (facid, after_facid) = split_digits(rest);
    if facid.is_empty() {
        return Err(err());
    }
    let facid: FacId = facid.parse().map_err(|_| err())?;

    let suffix = after_facid.strip_prefix('c').ok_or_else(err)?;
    if suffix.is_empty() || suffix.len() % 2 != 0 {
        return Err(err());
    }
    let (chunk_id, num_chunks) = suffix.split_at(suffix.len() / 2);
    let chunk_id = base62_to_int(chunk_id).ok_or_else(err)?;
    let num_chunks = base62_to_int(num_chunks).ok_or_else(err)?;
    let chunk = ChunkInfo::new(chunk_id, num_chunks).map_err(|_| err())?;

    Ok((facid, chunk))
}

fn split_digits(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}
