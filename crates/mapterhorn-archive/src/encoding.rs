//! Tile payload encodings.
//!
//! The tile store keeps Float32 GeoTIFFs. Archives default to Terrarium RGB
//! so web map renderers can read them directly: `elevation + 32768` is split
//! into red (256 m steps), green (1 m steps) and blue (1/256 m steps).
//! No-data pixels are written fully transparent.

use crate::header::{TILE_TYPE_PNG, TILE_TYPE_UNKNOWN, TILE_TYPE_WEBP};
use crate::Result;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{ImageFormat, Rgba, RgbaImage};
use mapterhorn_dem::TileRaster;
use serde::{Deserialize, Serialize};

/// Terrarium offset in metres.
const OFFSET: f64 = 32768.0;

/// Highest elevation Terrarium can represent, shifted by [`OFFSET`].
const MAX_SHIFTED: f64 = 65536.0 - 1.0 / 256.0;

/// How tile payloads are written into an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TileEncoding {
    /// Terrarium RGB in lossless WebP.
    #[default]
    TerrariumWebp,
    /// Terrarium RGB in PNG.
    TerrariumPng,
    /// Payloads copied exactly as the source returns them.
    Stored,
}

impl TileEncoding {
    /// Tile type recorded in the archive header.
    pub fn tile_type(self) -> u8 {
        match self {
            TileEncoding::TerrariumWebp => TILE_TYPE_WEBP,
            TileEncoding::TerrariumPng => TILE_TYPE_PNG,
            TileEncoding::Stored => TILE_TYPE_UNKNOWN,
        }
    }

    /// Value of the `encoding` metadata key.
    pub fn metadata_name(self) -> &'static str {
        match self {
            TileEncoding::TerrariumWebp | TileEncoding::TerrariumPng => "terrarium",
            TileEncoding::Stored => "float32-geotiff",
        }
    }

    /// Turn a stored tile (a Float32 GeoTIFF) into the archive payload.
    pub fn encode(self, stored: Vec<u8>) -> Result<Vec<u8>> {
        let format = match self {
            TileEncoding::Stored => return Ok(stored),
            TileEncoding::TerrariumWebp => ImageFormat::WebP,
            TileEncoding::TerrariumPng => ImageFormat::Png,
        };
        let raster = TileRaster::decode_square(&stored)?;
        encode_terrarium(&raster, format)
    }
}

/// Terrarium bytes of one elevation.
pub fn terrarium_pixel(elevation: f32) -> [u8; 3] {
    let shifted = (elevation as f64 + OFFSET).clamp(0.0, MAX_SHIFTED);
    let whole = shifted.floor();
    [
        (whole / 256.0).floor() as u8,
        (whole % 256.0) as u8,
        ((shifted - whole) * 256.0).floor() as u8,
    ]
}

/// Elevation of one Terrarium pixel.
pub fn terrarium_elevation([r, g, b]: [u8; 3]) -> f32 {
    (r as f64 * 256.0 + g as f64 + b as f64 / 256.0 - OFFSET) as f32
}

/// Terrarium image of a raster. No-data is `[128, 0, 0, 0]` (0 m, transparent).
pub fn terrarium_image(raster: &TileRaster) -> RgbaImage {
    let size = raster.size();
    RgbaImage::from_fn(size, size, |col, row| match raster.get(col, row) {
        Some(v) => {
            let [r, g, b] = terrarium_pixel(v);
            Rgba([r, g, b, 255])
        }
        None => Rgba([128, 0, 0, 0]),
    })
}

/// Encode a raster as a Terrarium WebP (lossless) or PNG.
pub fn encode_terrarium(raster: &TileRaster, format: ImageFormat) -> Result<Vec<u8>> {
    let image = terrarium_image(raster);
    let mut bytes = Vec::new();
    match format {
        ImageFormat::Png => image.write_with_encoder(PngEncoder::new(&mut bytes))?,
        _ => image.write_with_encoder(WebPEncoder::new_lossless(&mut bytes))?,
    }
    Ok(bytes)
}

/// Decode a Terrarium WebP or PNG tile. Transparent pixels are no-data.
pub fn decode_terrarium(bytes: &[u8]) -> Result<TileRaster> {
    let image = image::load_from_memory(bytes)?.into_rgba8();
    let size = image.width();
    let mut raster = TileRaster::new_empty(size);
    for (col, row, pixel) in image.enumerate_pixels() {
        if col >= size || row >= size {
            continue;
        }
        let Rgba([r, g, b, a]) = *pixel;
        if a > 0 {
            raster.set(col, row, Some(terrarium_elevation([r, g, b])));
        }
    }
    Ok(raster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapterhorn_dem::TileCoord;

    #[test]
    fn test_terrarium_known_values() {
        assert_eq!(terrarium_pixel(0.0), [128, 0, 0]);
        assert_eq!(terrarium_pixel(1234.5), [132, 210, 128]);
        assert_eq!(terrarium_pixel(-10.25), [127, 245, 192]);
        assert_eq!(terrarium_elevation([132, 210, 128]), 1234.5);
        assert_eq!(terrarium_elevation([127, 245, 192]), -10.25);
    }

    #[test]
    fn test_terrarium_precision_and_clamping() {
        for v in [-431.7f32, 0.003, 4807.81, 8848.86] {
            let back = terrarium_elevation(terrarium_pixel(v));
            assert!(back <= v && v - back < 1.0 / 256.0, "{} -> {}", v, back);
        }
        assert_eq!(terrarium_pixel(-40000.0), [0, 0, 0]);
        assert_eq!(terrarium_pixel(40000.0), [255, 255, 255]);
    }

    #[test]
    fn test_webp_and_png_keep_nodata() {
        let mut raster = TileRaster::new_empty(8);
        raster.set(1, 2, Some(812.75));
        raster.set(7, 7, Some(-3.5));
        for format in [ImageFormat::WebP, ImageFormat::Png] {
            let bytes = encode_terrarium(&raster, format).unwrap();
            assert_eq!(image::guess_format(&bytes).unwrap(), format);
            let decoded = decode_terrarium(&bytes).unwrap();
            assert_eq!(decoded, raster);
        }
    }

    #[test]
    fn test_encode_from_stored_geotiff() {
        let mut raster = TileRaster::new_empty(4);
        raster.set(0, 0, Some(100.0));
        let stored = raster.encode(&TileCoord::root().mercator_bounds()).unwrap();

        assert_eq!(TileEncoding::Stored.encode(stored.clone()).unwrap(), stored);
        let webp = TileEncoding::TerrariumWebp.encode(stored.clone()).unwrap();
        assert_eq!(&webp[..4], b"RIFF");
        assert_eq!(&webp[8..12], b"WEBP");
        let png = TileEncoding::TerrariumPng.encode(stored).unwrap();
        assert_eq!(&png[1..4], b"PNG");
        assert_eq!(decode_terrarium(&webp).unwrap(), raster);
    }
}
