//! Square output tile rasters.

use crate::source_raster::{decode_elevation_data, encode_float32};
use crate::{DemError, MercatorBounds, Result};
use std::io::Cursor;
use tiff::decoder::Decoder;

/// A `size × size` grid of elevations for one output tile.
///
/// Missing values hold [`TileRaster::NODATA`].
#[derive(Debug, Clone, PartialEq)]
pub struct TileRaster {
    size: u32,
    data: Vec<f32>,
}

impl TileRaster {
    /// No-data sentinel written to output tiles.
    pub const NODATA: f32 = -9999.0;

    /// Create a raster filled with no-data.
    pub fn new_empty(size: u32) -> Self {
        Self {
            size,
            data: vec![Self::NODATA; size as usize * size as usize],
        }
    }

    /// Wrap row-major data. The length must be `size²`.
    pub fn from_data(size: u32, data: Vec<f32>) -> Result<Self> {
        if data.len() != size as usize * size as usize {
            return Err(DemError::TileSizeMismatch {
                expected: size,
                width: data.len() as u32,
                height: 1,
            });
        }
        Ok(Self { size, data })
    }

    /// Edge length in pixels.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Raw row-major samples, no-data included.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Value at `(col, row)`, or `None` for no-data.
    pub fn get(&self, col: u32, row: u32) -> Option<f32> {
        let v = self.data[self.index(col, row)];
        if is_nodata(v) {
            None
        } else {
            Some(v)
        }
    }

    /// Set `(col, row)`; `None` stores no-data.
    pub fn set(&mut self, col: u32, row: u32, value: Option<f32>) {
        let idx = self.index(col, row);
        self.data[idx] = value.unwrap_or(Self::NODATA);
    }

    /// Number of pixels holding data.
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !is_nodata(**v)).count()
    }

    /// True when every pixel is no-data.
    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|v| is_nodata(*v))
    }

    /// Encode as a single-band Float32 GeoTIFF georeferenced to `bounds`.
    ///
    /// The encoding is deterministic: identical rasters give identical bytes.
    pub fn encode(&self, bounds: &MercatorBounds) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        encode_float32(
            &mut cursor,
            &self.data,
            self.size,
            self.size,
            bounds,
            Some(Self::NODATA),
        )?;
        Ok(cursor.into_inner())
    }

    /// Decode a tile produced by [`TileRaster::encode`].
    ///
    /// Fails with [`DemError::TileSizeMismatch`] unless the image is `expected × expected`.
    pub fn decode(bytes: &[u8], expected: u32) -> Result<Self> {
        Self::decode_checked(bytes, Some(expected))
    }

    /// Decode a tile of whatever size it was encoded at. Fails unless square.
    pub fn decode_square(bytes: &[u8]) -> Result<Self> {
        Self::decode_checked(bytes, None)
    }

    fn decode_checked(bytes: &[u8], expected: Option<u32>) -> Result<Self> {
        let mut decoder = Decoder::new(Cursor::new(bytes))?;
        let (width, height) = decoder.dimensions()?;
        let expected = expected.unwrap_or(width);
        if width != expected || height != expected {
            return Err(DemError::TileSizeMismatch {
                expected,
                width,
                height,
            });
        }
        let mut data = decode_elevation_data(&mut decoder)?;
        // Normalise non-finite samples so `get` only has one sentinel to check
        for v in data.iter_mut() {
            if !v.is_finite() {
                *v = Self::NODATA;
            }
        }
        Ok(Self {
            size: expected,
            data,
        })
    }

    fn index(&self, col: u32, row: u32) -> usize {
        assert!(col < self.size && row < self.size, "pixel out of range");
        row as usize * self.size as usize + col as usize
    }
}

fn is_nodata(v: f32) -> bool {
    !v.is_finite() || v == TileRaster::NODATA
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TileCoord;

    #[test]
    fn test_new_empty_is_empty() {
        let raster = TileRaster::new_empty(8);
        assert!(raster.is_empty());
        assert_eq!(raster.valid_count(), 0);
        assert_eq!(raster.get(3, 3), None);
    }

    #[test]
    fn test_set_and_get() {
        let mut raster = TileRaster::new_empty(4);
        raster.set(1, 2, Some(123.5));
        assert_eq!(raster.get(1, 2), Some(123.5));
        assert_eq!(raster.valid_count(), 1);
        raster.set(1, 2, None);
        assert!(raster.is_empty());
    }

    #[test]
    fn test_from_data_rejects_wrong_length() {
        assert!(TileRaster::from_data(4, vec![0.0; 15]).is_err());
        assert!(TileRaster::from_data(4, vec![0.0; 16]).is_ok());
    }

    #[test]
    fn test_encode_decode_preserves_nodata() {
        let mut raster = TileRaster::new_empty(16);
        for i in 0..16 {
            raster.set(i, i, Some(i as f32 * 10.0));
        }
        let bounds = TileCoord::new(3, 4, 2).mercator_bounds();
        let bytes = raster.encode(&bounds).unwrap();
        let decoded = TileRaster::decode(&bytes, 16).unwrap();
        assert_eq!(decoded, raster);
        assert_eq!(decoded.get(0, 1), None);
        assert_eq!(decoded.get(5, 5), Some(50.0));
    }

    #[test]
    fn test_encode_is_deterministic() {
        let raster = TileRaster::from_data(8, (0..64).map(|v| v as f32).collect()).unwrap();
        let bounds = TileCoord::new(1, 0, 1).mercator_bounds();
        assert_eq!(raster.encode(&bounds).unwrap(), raster.encode(&bounds).unwrap());
    }

    #[test]
    fn test_decode_square_reads_own_size() {
        let mut raster = TileRaster::new_empty(4);
        raster.set(2, 1, Some(-12.25));
        let bytes = raster.encode(&TileCoord::root().mercator_bounds()).unwrap();
        assert_eq!(TileRaster::decode_square(&bytes).unwrap(), raster);
    }

    #[test]
    fn test_decode_size_mismatch() {
        let raster = TileRaster::new_empty(8);
        let bytes = raster.encode(&TileCoord::root().mercator_bounds()).unwrap();
        let err = TileRaster::decode(&bytes, 16).unwrap_err();
        assert!(matches!(err, DemError::TileSizeMismatch { expected: 16, .. }));
    }
}
