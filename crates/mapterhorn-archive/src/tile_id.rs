//! Hilbert-curve tile ids.
//!
//! Tiles are numbered zoom by zoom: all tiles of zoom `z` come after the
//! `Σ_{i<z} 4^i` tiles of coarser zooms, and inside one zoom they follow a
//! Hilbert curve so that tiles close on the map are close in the archive.

use mapterhorn_dem::{TileCoord, MAX_ZOOM};

/// Number of tiles at all zooms coarser than `z`.
fn zoom_offset(z: u8) -> u64 {
    // (4^z - 1) / 3
    ((1u64 << (2 * z as u32)) - 1) / 3
}

/// Tile id of `(z, x, y)`.
pub fn tile_id(coord: TileCoord) -> u64 {
    if coord.z == 0 {
        return 0;
    }
    let n = 1u64 << coord.z;
    let (mut x, mut y) = (coord.x as u64, coord.y as u64);
    let mut d = 0u64;
    let mut s = n / 2;
    while s > 0 {
        let rx = u64::from(x & s > 0);
        let ry = u64::from(y & s > 0);
        d += s * s * ((3 * rx) ^ ry);
        rotate(n, &mut x, &mut y, rx, ry);
        s /= 2;
    }
    zoom_offset(coord.z) + d
}

/// Inverse of [`tile_id`]. Returns `None` for ids beyond the maximum zoom.
pub fn tile_coord(id: u64) -> Option<TileCoord> {
    let mut z = 0u8;
    while z <= MAX_ZOOM {
        let next = zoom_offset(z + 1);
        if id < next {
            break;
        }
        z += 1;
    }
    if z > MAX_ZOOM {
        return None;
    }

    let n = 1u64 << z;
    let mut t = id - zoom_offset(z);
    let (mut x, mut y) = (0u64, 0u64);
    let mut s = 1u64;
    while s < n {
        let rx = 1 & (t / 2);
        let ry = 1 & (t ^ rx);
        rotate(s, &mut x, &mut y, rx, ry);
        x += s * rx;
        y += s * ry;
        t /= 4;
        s *= 2;
    }
    Some(TileCoord {
        z,
        x: x as u32,
        y: y as u32,
    })
}

fn rotate(n: u64, x: &mut u64, y: &mut u64, rx: u64, ry: u64) {
    if ry == 0 {
        if rx == 1 {
            *x = n - 1 - *x;
            *y = n - 1 - *y;
        }
        std::mem::swap(x, y);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_ids() {
        assert_eq!(tile_id(TileCoord::new(0, 0, 0)), 0);
        assert_eq!(tile_id(TileCoord::new(1, 0, 0)), 1);
        assert_eq!(tile_id(TileCoord::new(1, 0, 1)), 2);
        assert_eq!(tile_id(TileCoord::new(1, 1, 1)), 3);
        assert_eq!(tile_id(TileCoord::new(1, 1, 0)), 4);
        assert_eq!(tile_id(TileCoord::new(2, 0, 0)), 5);
    }

    #[test]
    fn test_inverse_across_zooms() {
        for z in 0..=6u8 {
            let n = 1u32 << z;
            for x in 0..n {
                for y in 0..n {
                    let coord = TileCoord::new(z, x, y);
                    assert_eq!(tile_coord(tile_id(coord)), Some(coord));
                }
            }
        }
        let deep = TileCoord::new(20, 549_123, 366_000);
        assert_eq!(tile_coord(tile_id(deep)), Some(deep));
    }

    #[test]
    fn test_ids_contiguous_per_zoom() {
        // Every id in a zoom's range is used exactly once
        let z = 3u8;
        let mut ids: Vec<u64> = (0..8u32)
            .flat_map(|x| (0..8u32).map(move |y| tile_id(TileCoord::new(z, x, y))))
            .collect();
        ids.sort();
        let expected: Vec<u64> = (zoom_offset(3)..zoom_offset(4)).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_neighbours_on_curve_are_adjacent() {
        for id in zoom_offset(4)..zoom_offset(5) - 1 {
            let a = tile_coord(id).unwrap();
            let b = tile_coord(id + 1).unwrap();
            let dist = a.x.abs_diff(b.x) + a.y.abs_diff(b.y);
            assert_eq!(dist, 1);
        }
    }
}
