//! Persistent memoization of [`closest_on_routes`] searches.
//!
//! Results are kept in memory and appended to a file as length-prefixed records, each a
//! JSON list of `(key, packed_hit)` items. Opening a cache replays every record, later
//! entries overwriting earlier ones. A truncated or unreadable trailing record is read as
//! end of file and cut off, so records appended afterwards stay readable.
//!
//! Keys use the exact bit patterns of the query floats, so a cache only hits for
//! repeated queries, as happens when an event's fixes are re-analysed.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::closest::{ClosestPointPairHit, closest_on_routes};
use crate::error::CacheError;
use crate::route::PreparedRoute;
use crate::GeoPoint;

/// Unwritten items are appended once this many have accumulated.
pub const WRITE_AFTER_ITEMS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct CacheKey {
    lat: u64,
    lng: u64,
    min_complex_dist: u64,
    prev_route_index: Option<usize>,
    break_out_dist: u64,
    prev_dist: Option<u64>,
}

impl CacheKey {
    fn new(
        to_point: &GeoPoint,
        min_complex_dist: f64,
        prev_route_index: Option<usize>,
        break_out_dist: f64,
        prev_dist: Option<f64>,
    ) -> Self {
        Self {
            lat: to_point.lat.to_bits(),
            lng: to_point.lng.to_bits(),
            min_complex_dist: min_complex_dist.to_bits(),
            prev_route_index,
            break_out_dist: break_out_dist.to_bits(),
            prev_dist: prev_dist.map(f64::to_bits),
        }
    }
}

/// `(route_index, pair_a_index, dist, lat, lng)`
type PackedHit = (usize, usize, f64, f64, f64);

fn pack(hit: &ClosestPointPairHit<'_>) -> PackedHit {
    (hit.route_index, hit.point_pair.a.index, hit.dist, hit.point.lat, hit.point.lng)
}

/// Rebuild a hit against `routes`. The pair is looked up by its first point's index in
/// the detailed pairs, which is all route distance needs.
fn unpack<'a>(routes: &'a [PreparedRoute], packed: &PackedHit) -> Option<ClosestPointPairHit<'a>> {
    let &(route_index, pair_index, dist, lat, lng) = packed;
    let route = routes.get(route_index)?;
    let point_pair = route.point_pairs.get(pair_index)?;
    Some(ClosestPointPairHit {
        route_index,
        route,
        point_pair,
        dist,
        point: GeoPoint::new(lat, lng),
    })
}

type Record = Vec<(CacheKey, Option<PackedHit>)>;

/// Append-only, file backed cache of closest point-pair searches.
///
/// Owned by a single event; share it between riders behind a mutex.
#[derive(Debug)]
pub struct ClosestCache {
    path: PathBuf,
    entries: HashMap<CacheKey, Option<PackedHit>>,
    unwritten: Record,
}

impl ClosestCache {
    /// Open (creating if missing) the cache file at `path` and load its records.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut entries = HashMap::new();
        let mut records = 0;
        let mut rest = data.as_slice();
        while rest.len() >= 4 {
            let (len_bytes, tail) = rest.split_at(4);
            let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
            if tail.len() < len {
                warn!("Truncated record at end of {}", path.display());
                break;
            }
            let (payload, tail) = tail.split_at(len);
            match serde_json::from_slice::<Record>(payload) {
                Ok(items) => entries.extend(items),
                Err(e) => {
                    warn!("Unreadable record in {}, ignoring the rest: {e}", path.display());
                    break;
                }
            }
            records += 1;
            rest = tail;
        }
        if !rest.is_empty() && rest.len() < 4 {
            warn!("Truncated record at end of {}", path.display());
        }
        let valid_len = data.len() - rest.len();
        if valid_len < data.len() {
            warn!("Dropping {} bytes at end of {}", data.len() - valid_len, path.display());
            file.set_len(valid_len as u64)?;
        }
        debug!("Loaded {} cache entries from {} records in {}", entries.len(), records, path.display());

        Ok(Self { path, entries, unwritten: Vec::new() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of cached searches.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// [`closest_on_routes`], answered from the cache when the same query was seen before.
    pub fn closest_on_routes<'a>(
        &mut self,
        routes: &'a [PreparedRoute],
        to_point: &GeoPoint,
        min_complex_dist: f64,
        prev_route_index: Option<usize>,
        break_out_dist: f64,
        prev_dist: Option<f64>,
    ) -> Option<ClosestPointPairHit<'a>> {
        let key = CacheKey::new(to_point, min_complex_dist, prev_route_index, break_out_dist, prev_dist);
        match self.entries.get(&key) {
            Some(None) => return None,
            Some(Some(packed)) => match unpack(routes, packed) {
                Some(hit) => return Some(hit),
                None => warn!("Cached hit {packed:?} does not match the routes, searching again"),
            },
            None => {}
        }

        let hit = closest_on_routes(routes, to_point, min_complex_dist, prev_route_index, break_out_dist, prev_dist);
        let packed = hit.as_ref().map(pack);
        self.entries.insert(key, packed);
        self.unwritten.push((key, packed));
        if self.unwritten.len() >= WRITE_AFTER_ITEMS {
            if let Err(e) = self.flush() {
                error!("Error writing cache {}: {e}", self.path.display());
            }
        }
        hit
    }

    /// Append unwritten items to the file as one record.
    ///
    /// On failure the items stay in memory but are not retried.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        if self.unwritten.is_empty() {
            return Ok(());
        }
        let items = std::mem::take(&mut self.unwritten);
        let payload = serde_json::to_vec(&items)?;
        let len = u32::try_from(payload.len()).map_err(|_| CacheError::RecordTooLarge(payload.len()))?;

        let mut record = Vec::with_capacity(4 + payload.len());
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&payload);

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&record)?;
        file.flush()?;
        Ok(())
    }
}

impl Drop for ClosestCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("Error writing cache {}: {e}", self.path.display());
        }
    }
}
