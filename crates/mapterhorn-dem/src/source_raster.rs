//! Georeferenced source rasters loaded from GeoTIFF files.

use crate::{DemError, MercatorBounds, Result};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

/// A single-band elevation raster in EPSG:3857 loaded from a GeoTIFF file.
///
/// Pixels are area cells: pixel `(col, row)` covers
/// `[min_x + col·sx, min_x + (col+1)·sx] × [max_y − (row+1)·sy, max_y − row·sy]`.
#[derive(Debug)]
pub struct SourceRaster {
    /// Elevation data in row-major order (north to south, west to east).
    data: Vec<f32>,
    /// Width of the raster in pixels.
    width: u32,
    /// Height of the raster in pixels.
    height: u32,
    /// Extent in Web Mercator metres.
    bounds: MercatorBounds,
    /// No-data value (elevations equal to this are treated as missing).
    no_data_value: Option<f32>,
}

impl SourceRaster {
    /// Build a raster from in-memory data.
    pub fn from_parts(
        data: Vec<f32>,
        width: u32,
        height: u32,
        bounds: MercatorBounds,
        no_data_value: Option<f32>,
    ) -> Result<Self> {
        if data.len() != width as usize * height as usize || width == 0 || height == 0 {
            return Err(DemError::InvalidGeoTiff {
                path: "<memory>".to_string(),
                reason: format!("{} samples for a {}x{} raster", data.len(), width, height),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            bounds,
            no_data_value,
        })
    }

    /// Load a raster from a GeoTIFF file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut decoder = Decoder::new(file)?;

        // Source files can be large single-strip rasters
        let mut limits = Limits::default();
        limits.decoding_buffer_size = 1024 * 1024 * 1024; // 1 GB
        limits.intermediate_buffer_size = 1024 * 1024 * 1024; // 1 GB
        limits.ifd_value_size = 1024 * 1024 * 1024;
        decoder = decoder.with_limits(limits);

        let (width, height) = decoder.dimensions()?;
        let bounds = Self::read_geotransform(&mut decoder, path)?;
        let no_data_value = read_nodata_value(&mut decoder);
        let data = decode_elevation_data(&mut decoder)?;

        Ok(Self {
            data,
            width,
            height,
            bounds,
            no_data_value,
        })
    }

    /// Read only the georeferenced extent of a GeoTIFF, without decoding pixels.
    pub fn read_bounds<P: AsRef<Path>>(path: P) -> Result<MercatorBounds> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut decoder = Decoder::new(file)?;
        Self::read_geotransform(&mut decoder, path)
    }

    /// Read the geotransform from the ModelTiepoint and ModelPixelScale tags.
    fn read_geotransform<R: Read + Seek>(
        decoder: &mut Decoder<R>,
        path: &Path,
    ) -> Result<MercatorBounds> {
        let invalid = |reason: &str| DemError::InvalidGeoTiff {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };

        let tiepoint = decoder
            .get_tag_f64_vec(Tag::ModelTiepointTag)
            .map_err(|_| invalid("missing ModelTiepoint tag"))?;
        let scale = decoder
            .get_tag_f64_vec(Tag::ModelPixelScaleTag)
            .map_err(|_| invalid("missing ModelPixelScale tag"))?;

        if tiepoint.len() < 6 || scale.len() < 2 {
            return Err(invalid("malformed tiepoint or pixel scale"));
        }

        // Tiepoint format: [i, j, k, x, y, z] where (i,j) is pixel coords and (x,y) is map coords
        let (i, j) = (tiepoint[0], tiepoint[1]);
        let (scale_x, scale_y) = (scale[0], scale[1]);
        if scale_x <= 0.0 || scale_y <= 0.0 {
            return Err(invalid("non-positive pixel scale"));
        }
        let min_x = tiepoint[3] - i * scale_x;
        let max_y = tiepoint[4] + j * scale_y;

        let (width, height) = decoder.dimensions()?;
        let bounds = MercatorBounds::new(
            min_x,
            max_y - height as f64 * scale_y,
            min_x + width as f64 * scale_x,
            max_y,
        );
        if !bounds.is_valid() {
            return Err(invalid("degenerate extent"));
        }
        Ok(bounds)
    }

    /// Get the georeferenced extent.
    pub fn bounds(&self) -> MercatorBounds {
        self.bounds
    }

    /// Get the dimensions in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Get the no-data value, if the file declares one.
    pub fn no_data_value(&self) -> Option<f32> {
        self.no_data_value
    }

    /// Get the resolution in metres per pixel (x, y).
    pub fn resolution(&self) -> (f64, f64) {
        (
            self.bounds.width() / self.width as f64,
            self.bounds.height() / self.height as f64,
        )
    }

    /// Get the value of a pixel, or `None` for no-data.
    pub fn pixel(&self, col: u32, row: u32) -> Option<f32> {
        if col >= self.width || row >= self.height {
            return None;
        }
        let value = self.data[row as usize * self.width as usize + col as usize];
        if !value.is_finite() {
            return None;
        }
        if let Some(nodata) = self.no_data_value {
            if (value - nodata).abs() < 0.001 {
                return None;
            }
        }
        Some(value)
    }

    /// Sample the raster at a Web Mercator position.
    ///
    /// Uses bilinear interpolation when all four surrounding pixels are
    /// valid. Otherwise falls back to the nearest pixel, so no-data is never
    /// averaged with valid data. Returns `None` outside the raster or on
    /// no-data.
    pub fn sample_bilinear(&self, x: f64, y: f64) -> Option<f32> {
        let b = &self.bounds;
        if x < b.min_x || x > b.max_x || y < b.min_y || y > b.max_y {
            return None;
        }
        let (res_x, res_y) = self.resolution();

        // Continuous pixel coordinates with pixel centres on integers
        let fx = ((x - b.min_x) / res_x - 0.5).clamp(0.0, (self.width - 1) as f64);
        let fy = ((b.max_y - y) / res_y - 0.5).clamp(0.0, (self.height - 1) as f64);

        let x0 = fx.floor() as u32;
        let y0 = fy.floor() as u32;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let tx = fx - x0 as f64;
        let ty = fy - y0 as f64;

        let corners = (
            self.pixel(x0, y0),
            self.pixel(x1, y0),
            self.pixel(x0, y1),
            self.pixel(x1, y1),
        );
        if let (Some(v00), Some(v10), Some(v01), Some(v11)) = corners {
            let value = v00 as f64 * (1.0 - tx) * (1.0 - ty)
                + v10 as f64 * tx * (1.0 - ty)
                + v01 as f64 * (1.0 - tx) * ty
                + v11 as f64 * tx * ty;
            return Some(value as f32);
        }

        self.pixel(fx.round() as u32, fy.round() as u32)
    }
}

/// Decode elevation data from the TIFF decoder.
pub(crate) fn decode_elevation_data<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Vec<f32>> {
    let result = decoder.read_image()?;

    match result {
        DecodingResult::F32(data) => Ok(data),
        DecodingResult::F64(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        DecodingResult::I16(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        DecodingResult::I32(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        DecodingResult::U16(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        DecodingResult::U32(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        DecodingResult::U8(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        DecodingResult::I8(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        DecodingResult::U64(_) | DecodingResult::I64(_) => {
            Err(DemError::UnsupportedDataType("64-bit integer samples".to_string()))
        }
    }
}

/// Try to read the no-data value from the GDAL_NODATA tag (an ASCII string).
fn read_nodata_value<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f32> {
    decoder
        .get_tag_ascii_string(Tag::GdalNodata)
        .ok()
        .and_then(|s| s.trim_matches(char::from(0)).trim().parse().ok())
}

/// Write a single-band Float32 GeoTIFF in EPSG:3857.
///
/// Produces the tags [`SourceRaster::from_file`] reads back.
pub fn write_geotiff<P: AsRef<Path>>(
    path: P,
    data: &[f32],
    width: u32,
    height: u32,
    bounds: MercatorBounds,
    no_data_value: Option<f32>,
) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    encode_float32(&mut writer, data, width, height, &bounds, no_data_value)?;
    writer.flush()?;
    Ok(())
}

/// Encode a Float32 GeoTIFF with pixel scale, tiepoint and optional no-data tags.
pub(crate) fn encode_float32<W: Write + Seek>(
    writer: &mut W,
    data: &[f32],
    width: u32,
    height: u32,
    bounds: &MercatorBounds,
    no_data_value: Option<f32>,
) -> Result<()> {
    let mut encoder = TiffEncoder::new(writer)?;
    let mut image = encoder.new_image::<colortype::Gray32Float>(width, height)?;

    let scale = [
        bounds.width() / width as f64,
        bounds.height() / height as f64,
        0.0,
    ];
    let tiepoint = [0.0, 0.0, 0.0, bounds.min_x, bounds.max_y, 0.0];
    image
        .encoder()
        .write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
    image
        .encoder()
        .write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
    if let Some(nodata) = no_data_value {
        let nodata = nodata.to_string();
        image
            .encoder()
            .write_tag(Tag::GdalNodata, nodata.as_str())?;
    }
    image.write_data(data)?;
    Ok(())
}
