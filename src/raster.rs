//! Raster codec glue: GeoTIFF through `tiff`, JPEG/PNG through `image`, and the
//! 8-bit downcast the predictor expects.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::ops::Range;
use std::path::Path;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use image::DynamicImage;
use log::{debug, info, warn};
use ndarray::prelude::*;
use num_traits::ToPrimitive;
use rayon::prelude::*;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, DirectoryEncoder, TiffEncoder, TiffKindStandard};
use tiff::tags::{CompressionMethod, PhotometricInterpretation, PlanarConfiguration, SampleFormat, Tag};
use tiff::TiffError;

use crate::errors::{OrthoSegError, Result};
use crate::georef::{find_external_georef, Crs, GeoTransform, Sidecar};

const GT_MODEL_TYPE_KEY: u16 = 1024;
const GT_RASTER_TYPE_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_KEY: u16 = 3072;

/// Edge of the square blocks of a tiled GeoTIFF.
pub const BLOCK_SIZE: usize = 256;

/// Sample type of the file on disk, before the 8-bit downcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

/// The input orthomosaic, held in memory as `(row, col, band)` bytes.
#[derive(Debug, Clone)]
pub struct SourceRaster {
    pub data: Array3<u8>,
    pub pixel_type: PixelType,
    pub geotransform: GeoTransform,
    pub crs: Option<Crs>,
}

impl SourceRaster {
    pub fn new(data: Array3<u8>, geotransform: GeoTransform, crs: Option<Crs>) -> Self {
        Self {
            data,
            pixel_type: PixelType::U8,
            geotransform,
            crs,
        }
    }

    pub fn width(&self) -> usize {
        self.data.dim().1
    }

    pub fn height(&self) -> usize {
        self.data.dim().0
    }

    pub fn bands(&self) -> usize {
        self.data.dim().2
    }

    pub fn georef(&self) -> Sidecar {
        Sidecar::new(self.geotransform, self.crs.clone())
    }

    /// Opens a GeoTIFF, or a JPEG/PNG with a sidecar or world file.
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening raster: {}", path.display());
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        let mut raster = match extension.as_str() {
            "tif" | "tiff" => read_geotiff(path)?,
            _ => read_plain_image(path)?,
        };

        // A sidecar overrides embedded tags, which is also what GDAL does.
        if let Some(external) = find_external_georef(path)? {
            raster.geotransform = external.geotransform;
            if external.crs.is_some() {
                raster.crs = external.crs;
            }
        } else if raster.geotransform == GeoTransform::IDENTITY {
            warn!(
                "{} carries no georeferencing; working in pixel coordinates",
                path.display()
            );
        }

        let (height, width, bands) = raster.data.dim();
        if width == 0 || height == 0 {
            return Err(OrthoSegError::Validation {
                field: "raster dimensions".to_string(),
                reason: format!("{}x{} is empty", width, height),
            });
        }
        debug!(
            "Raster {}: {}x{} px, {} band(s), {:?}, geotransform [{}]",
            path.display(),
            width,
            height,
            bands,
            raster.pixel_type,
            raster.geotransform
        );
        Ok(raster)
    }
}

fn read_geotiff(path: &Path) -> Result<SourceRaster> {
    let file = File::open(path).map_err(|e| OrthoSegError::filesystem(path, "open GeoTIFF", e))?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .map_err(|e| OrthoSegError::raster(path.display(), "initialise TIFF decoder", e))?
        .with_limits(Limits::unlimited());

    let (width, height) = decoder
        .dimensions()
        .map_err(|e| OrthoSegError::raster(path.display(), "read dimensions", e))?;
    let bands = match decoder
        .colortype()
        .map_err(|e| OrthoSegError::raster(path.display(), "read colour type", e))?
    {
        tiff::ColorType::Gray(_) => 1,
        tiff::ColorType::GrayA(_) => 2,
        tiff::ColorType::RGB(_) => 3,
        tiff::ColorType::RGBA(_) | tiff::ColorType::CMYK(_) => 4,
        tiff::ColorType::Multiband { num_samples, .. } => num_samples as usize,
        other => {
            return Err(OrthoSegError::raster(
                path.display(),
                "read colour type",
                format!("unsupported colour type {other:?}"),
            ))
        }
    };

    let geotransform = geotransform_from_tags(&mut decoder).unwrap_or(GeoTransform::IDENTITY);
    let crs = crs_from_tags(&mut decoder);

    let (samples, pixel_type) = match decoder
        .read_image()
        .map_err(|e| OrthoSegError::raster(path.display(), "decode pixels", e))?
    {
        DecodingResult::U8(v) => (v, PixelType::U8),
        DecodingResult::U16(v) => (downcast(&v), PixelType::U16),
        DecodingResult::U32(v) => (downcast(&v), PixelType::U32),
        DecodingResult::U64(v) => (downcast(&v), PixelType::U64),
        DecodingResult::I8(v) => (downcast(&v), PixelType::I8),
        DecodingResult::I16(v) => (downcast(&v), PixelType::I16),
        DecodingResult::I32(v) => (downcast(&v), PixelType::I32),
        DecodingResult::I64(v) => (downcast(&v), PixelType::I64),
        DecodingResult::F32(v) => (downcast(&v), PixelType::F32),
        DecodingResult::F64(v) => (downcast(&v), PixelType::F64),
        #[allow(unreachable_patterns)]
        _ => {
            return Err(OrthoSegError::raster(
                path.display(),
                "decode pixels",
                "unsupported sample format",
            ))
        }
    };
    if pixel_type != PixelType::U8 {
        info!("Downcasting {:?} samples to 8-bit", pixel_type);
    }

    let data = Array3::from_shape_vec((height as usize, width as usize, bands), samples)?;
    let data = keep_supported_bands(data, path)?;

    Ok(SourceRaster {
        data,
        pixel_type,
        geotransform,
        crs,
    })
}

fn read_plain_image(path: &Path) -> Result<SourceRaster> {
    let img = image::open(path).map_err(|e| OrthoSegError::raster(path.display(), "decode image", e))?;
    let (data, bands) = match img {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageLuma16(_) => {
            let img = img.into_luma8();
            let (w, h) = img.dimensions();
            (Array3::from_shape_vec((h as usize, w as usize, 1), img.into_raw())?, 1)
        }
        DynamicImage::ImageRgba8(_) | DynamicImage::ImageRgba16(_) | DynamicImage::ImageLumaA8(_) => {
            let img = img.into_rgba8();
            let (w, h) = img.dimensions();
            (Array3::from_shape_vec((h as usize, w as usize, 4), img.into_raw())?, 4)
        }
        _ => {
            let img = img.into_rgb8();
            let (w, h) = img.dimensions();
            (Array3::from_shape_vec((h as usize, w as usize, 3), img.into_raw())?, 3)
        }
    };
    debug!("Decoded {} with {} band(s)", path.display(), bands);
    Ok(SourceRaster::new(data, GeoTransform::IDENTITY, None))
}

/// Gray+alpha is widened to RGBA; more than four bands is rejected since neither the
/// tile codecs nor the predictor handle them.
fn keep_supported_bands(data: Array3<u8>, path: &Path) -> Result<Array3<u8>> {
    match data.dim().2 {
        1 | 3 | 4 => Ok(data),
        2 => {
            let (h, w, _) = data.dim();
            Ok(Array3::from_shape_fn((h, w, 4), |(r, c, b)| {
                if b == 3 {
                    data[[r, c, 1]]
                } else {
                    data[[r, c, 0]]
                }
            }))
        }
        n => Err(OrthoSegError::raster(
            path.display(),
            "band layout",
            format!("{n} bands are not supported (expected 1, 3 or 4)"),
        )),
    }
}

/// Clamp-and-round cast to bytes, the same result as a Byte output type in GDAL.
pub fn downcast<T: ToPrimitive + Copy>(values: &[T]) -> Vec<u8> {
    values
        .iter()
        .map(|v| {
            v.to_f64()
                .filter(|f| f.is_finite())
                .map(|f| f.round().clamp(0.0, 255.0) as u8)
                .unwrap_or(0)
        })
        .collect()
}

fn geotransform_from_tags<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    if let Ok(Some(value)) = decoder.find_tag(Tag::ModelTransformationTag) {
        if let Ok(m) = value.into_f64_vec() {
            if m.len() >= 8 {
                return Some(GeoTransform([m[3], m[0], m[1], m[7], m[4], m[5]]));
            }
        }
    }

    let scale = decoder
        .find_tag(Tag::ModelPixelScaleTag)
        .ok()
        .flatten()
        .and_then(|v| v.into_f64_vec().ok())
        .filter(|s| s.len() >= 2);
    let tiepoint = decoder
        .find_tag(Tag::ModelTiepointTag)
        .ok()
        .flatten()
        .and_then(|v| v.into_f64_vec().ok())
        .filter(|t| t.len() >= 6);

    match (scale, tiepoint) {
        (Some(s), Some(t)) => Some(GeoTransform([
            t[3] - t[0] * s[0],
            s[0],
            0.0,
            t[4] + t[1] * s[1],
            0.0,
            -s[1],
        ])),
        (None, Some(_)) => {
            warn!("ModelTiepoint present without ModelPixelScale; ignoring georeferencing");
            None
        }
        _ => None,
    }
}

fn crs_from_tags<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<Crs> {
    let keys = decoder
        .find_tag(Tag::GeoKeyDirectoryTag)
        .ok()
        .flatten()
        .and_then(|v| v.into_u32_vec().ok())?;

    // Header is four shorts, then (key, location, count, value) quadruples.
    let mut projected = None;
    let mut geographic = None;
    for entry in keys.get(4..)?.chunks_exact(4) {
        let (key, location, value) = (entry[0], entry[1], entry[3]);
        if location != 0 || value == 0 || value >= 32767 {
            continue;
        }
        match key as u16 {
            PROJECTED_CS_TYPE_KEY => projected = Some(value as u16),
            GEOGRAPHIC_TYPE_KEY => geographic = Some(value as u16),
            _ => {}
        }
    }
    projected.or(geographic).map(Crs::Epsg)
}

fn geo_key_directory(crs: Option<&Crs>) -> Vec<u16> {
    let mut keys = vec![(GT_RASTER_TYPE_KEY, 1)];
    match crs.and_then(|c| c.epsg().map(|code| (c.is_geographic(), code))) {
        Some((true, code)) => {
            keys.push((GT_MODEL_TYPE_KEY, 2));
            keys.push((GEOGRAPHIC_TYPE_KEY, code));
        }
        Some((false, code)) => {
            keys.push((GT_MODEL_TYPE_KEY, 1));
            keys.push((PROJECTED_CS_TYPE_KEY, code));
        }
        None => {
            if crs.is_some() {
                warn!("CRS has no EPSG code; GeoTIFF will carry the geotransform only");
            }
        }
    }
    keys.sort_unstable();

    let mut directory = vec![1, 1, 0, keys.len() as u16];
    for (key, value) in keys {
        directory.extend_from_slice(&[key, 0, 1, value]);
    }
    directory
}

/// Writes `(row, col, band)` bytes as an LZW-compressed GeoTIFF.
pub fn write_geotiff(path: &Path, pixels: ArrayView3<u8>, georef: &Sidecar) -> Result<()> {
    let (height, width, bands) = pixels.dim();
    let pixels = pixels.as_standard_layout();
    let samples = pixels
        .as_slice()
        .ok_or_else(|| OrthoSegError::raster(path.display(), "flatten pixels", "non-contiguous"))?;

    let file =
        File::create(path).map_err(|e| OrthoSegError::filesystem(path, "create GeoTIFF", e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file))
        .map_err(|e| OrthoSegError::raster(path.display(), "initialise TIFF encoder", e))?
        .with_compression(tiff::encoder::Compression::Lzw);

    let result = match bands {
        1 => encode::<colortype::Gray8, _>(&mut encoder, width, height, samples, georef),
        3 => encode::<colortype::RGB8, _>(&mut encoder, width, height, samples, georef),
        4 => encode::<colortype::RGBA8, _>(&mut encoder, width, height, samples, georef),
        n => {
            return Err(OrthoSegError::raster(
                path.display(),
                "encode GeoTIFF",
                format!("{n} bands are not supported"),
            ))
        }
    };
    result.map_err(|e| OrthoSegError::raster(path.display(), "encode GeoTIFF", e))
}

fn encode<C, W>(
    encoder: &mut TiffEncoder<W>,
    width: usize,
    height: usize,
    samples: &[u8],
    georef: &Sidecar,
) -> tiff::TiffResult<()>
where
    C: colortype::ColorType<Inner = u8>,
    W: std::io::Write + Seek,
{
    let mut image =
        encoder.new_image::<C>(width as u32, height as u32)?;

    write_geotags(image.encoder(), georef)?;
    image.rows_per_strip(BLOCK_SIZE.min(height.max(1)) as u32)?;
    image.write_data(samples)
}

fn write_geotags<W: Write + Seek>(
    directory: &mut DirectoryEncoder<'_, W, TiffKindStandard>,
    georef: &Sidecar,
) -> tiff::TiffResult<()> {
    let [x0, pw, _, y0, _, ph] = georef.geotransform.0;
    if !georef.geotransform.is_north_up() {
        warn!("Rotated geotransform cannot be expressed with tie points; writing scale only");
    }
    let scale = [pw, -ph, 0.0];
    let tiepoint = [0.0, 0.0, 0.0, x0, y0, 0.0];
    directory.write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
    directory.write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
    let keys = geo_key_directory(georef.crs.as_ref());
    directory.write_tag(Tag::GeoKeyDirectoryTag, &keys[..])
}

/// Writes a single-band tiled GeoTIFF with Deflate-compressed `BLOCK_SIZE` blocks.
///
/// Rows are pulled from `rows_of` one block row at a time, so only that band is
/// held in memory; the blocks of a band are compressed in parallel.
pub fn write_tiled_geotiff<F>(
    path: &Path,
    width: usize,
    height: usize,
    georef: &Sidecar,
    mut rows_of: F,
) -> Result<()>
where
    F: FnMut(Range<usize>) -> Result<Array2<u8>>,
{
    if width == 0 || height == 0 {
        return Err(OrthoSegError::Validation {
            field: "raster dimensions".to_string(),
            reason: format!("{width}x{height} is empty"),
        });
    }
    let encode_err = |e: TiffError| OrthoSegError::raster(path.display(), "encode tiled GeoTIFF", e);

    let file =
        File::create(path).map_err(|e| OrthoSegError::filesystem(path, "create GeoTIFF", e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(encode_err)?;
    let mut directory = encoder.new_directory().map_err(encode_err)?;

    let blocks_across = width.div_ceil(BLOCK_SIZE);
    let mut offsets: Vec<u32> = Vec::with_capacity(blocks_across * height.div_ceil(BLOCK_SIZE));
    let mut byte_counts: Vec<u32> = Vec::with_capacity(offsets.capacity());

    for top in (0..height).step_by(BLOCK_SIZE) {
        let rows = top..(top + BLOCK_SIZE).min(height);
        let band = rows_of(rows.clone())?;
        if band.dim() != (rows.len(), width) {
            return Err(OrthoSegError::raster(
                path.display(),
                "encode tiled GeoTIFF",
                format!("rows {rows:?} came back as {:?}", band.dim()),
            ));
        }

        let blocks: Vec<Vec<u8>> = (0..blocks_across)
            .into_par_iter()
            .map(|bx| deflate_block(band.view(), bx * BLOCK_SIZE))
            .collect::<std::io::Result<_>>()
            .map_err(|e| OrthoSegError::filesystem(path, "compress GeoTIFF block", e))?;

        for block in &blocks {
            let offset = directory.write_data(&block[..]).map_err(encode_err)?;
            offsets.push(u32::try_from(offset).map_err(|_| encode_err(TiffError::LimitsExceeded))?);
            byte_counts.push(block.len() as u32);
        }
    }

    write_block_tags(&mut directory, (width as u32, height as u32), &offsets, &byte_counts, georef)
        .map_err(encode_err)?;
    directory.finish().map_err(encode_err)?;
    debug!(
        "Wrote {} as {} block(s) of {}x{}",
        path.display(),
        offsets.len(),
        BLOCK_SIZE,
        BLOCK_SIZE
    );
    Ok(())
}

fn write_block_tags<W: Write + Seek>(
    directory: &mut DirectoryEncoder<'_, W, TiffKindStandard>,
    (width, height): (u32, u32),
    offsets: &[u32],
    byte_counts: &[u32],
    georef: &Sidecar,
) -> tiff::TiffResult<()> {
    directory.write_tag(Tag::ImageWidth, width)?;
    directory.write_tag(Tag::ImageLength, height)?;
    directory.write_tag(Tag::BitsPerSample, 8u16)?;
    directory.write_tag(Tag::SamplesPerPixel, 1u16)?;
    directory.write_tag(Tag::SampleFormat, SampleFormat::Uint.to_u16())?;
    directory.write_tag(Tag::Compression, CompressionMethod::Deflate.to_u16())?;
    directory.write_tag(
        Tag::PhotometricInterpretation,
        PhotometricInterpretation::BlackIsZero.to_u16(),
    )?;
    directory.write_tag(Tag::PlanarConfiguration, PlanarConfiguration::Chunky.to_u16())?;
    directory.write_tag(Tag::TileWidth, BLOCK_SIZE as u32)?;
    directory.write_tag(Tag::TileLength, BLOCK_SIZE as u32)?;
    directory.write_tag(Tag::TileOffsets, offsets)?;
    directory.write_tag(Tag::TileByteCounts, byte_counts)?;
    write_geotags(directory, georef)
}

/// Compresses the block starting at column `left` of `band`, zero-padded to a full
/// `BLOCK_SIZE` square as TIFF requires.
fn deflate_block(band: ArrayView2<u8>, left: usize) -> std::io::Result<Vec<u8>> {
    let width = band.ncols();
    let right = (left + BLOCK_SIZE).min(width);
    let mut block = vec![0u8; BLOCK_SIZE * BLOCK_SIZE];
    for (r, row) in band.outer_iter().enumerate() {
        for (c, &value) in row.slice(s![left..right]).iter().enumerate() {
            block[r * BLOCK_SIZE + c] = value;
        }
    }

    let mut compressor = ZlibEncoder::new(Vec::new(), Compression::default());
    compressor.write_all(&block)?;
    compressor.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_downcast_clamps_and_rounds() {
        assert_eq!(downcast(&[-3.0f32, 0.4, 0.6, 254.5, 300.0, f32::NAN]), vec![0, 0, 1, 255, 255, 0]);
        assert_eq!(downcast(&[0u16, 255, 256, 65535]), vec![0, 255, 255, 255]);
    }

    #[test]
    fn test_geotiff_round_trip_keeps_georeferencing() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("ortho.tif");
        let data = Array3::from_shape_fn((20, 30, 3), |(r, c, b)| (r * 7 + c * 3 + b) as u8);
        let georef = Sidecar::new(
            GeoTransform([350_000.0, 0.25, 0.0, 4_100_000.0, 0.0, -0.25]),
            Some(Crs::Epsg(32618)),
        );
        write_geotiff(&path, data.view(), &georef)?;

        let raster = SourceRaster::open(&path)?;
        assert_eq!(raster.data, data);
        assert_eq!(raster.geotransform, georef.geotransform);
        assert_eq!(raster.crs, Some(Crs::Epsg(32618)));
        assert_eq!(raster.pixel_type, PixelType::U8);
        Ok(())
    }

    #[test]
    fn test_tiled_geotiff_is_blocked_and_compressed() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("mosaic.tif");
        let (height, width) = (300, 520);
        let data = Array2::from_shape_fn((height, width), |(r, c)| ((r / 7 + c / 11) % 6) as u8);
        let georef = Sidecar::new(
            GeoTransform([100.0, 0.5, 0.0, 50.0, 0.0, -0.5]),
            Some(Crs::Epsg(32610)),
        );

        let mut requested = Vec::new();
        write_tiled_geotiff(&path, width, height, &georef, |rows| {
            requested.push(rows.clone());
            Ok(data.slice(s![rows, ..]).to_owned())
        })?;
        assert_eq!(requested, vec![0..256, 256..300]);

        let mut decoder = Decoder::new(BufReader::new(File::open(&path)?))?;
        assert_eq!(decoder.get_tag_u32(Tag::TileWidth)?, BLOCK_SIZE as u32);
        assert_eq!(decoder.get_tag_u32(Tag::TileLength)?, BLOCK_SIZE as u32);
        assert_eq!(decoder.get_tag_u32(Tag::Compression)?, 8);
        assert_eq!(decoder.get_tag_u32_vec(Tag::TileOffsets)?.len(), 3 * 2);

        let raster = SourceRaster::open(&path)?;
        assert_eq!(raster.data.index_axis(Axis(2), 0), data);
        assert_eq!(raster.geotransform, georef.geotransform);
        assert_eq!(raster.crs, Some(Crs::Epsg(32610)));
        Ok(())
    }

    #[test]
    fn test_tiled_geotiff_rejects_short_band() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("mosaic.tif");
        let georef = Sidecar::new(GeoTransform::IDENTITY, None);
        let result = write_tiled_geotiff(&path, 10, 10, &georef, |_| Ok(Array2::zeros((3, 10))));
        assert!(matches!(result, Err(OrthoSegError::Raster { .. })));
        Ok(())
    }

    #[test]
    fn test_geo_key_directory_layout() {
        let dir = geo_key_directory(Some(&Crs::Epsg(4326)));
        assert_eq!(&dir[..4], &[1, 1, 0, 3]);
        assert!(dir.chunks(4).any(|k| k == [GEOGRAPHIC_TYPE_KEY, 0, 1, 4326]));
        let dir = geo_key_directory(None);
        assert_eq!(dir, vec![1, 1, 0, 1, GT_RASTER_TYPE_KEY, 0, 1, 1]);
    }

    #[test]
    fn test_jpeg_with_world_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("ortho.jpg");
        image::RgbImage::from_pixel(16, 8, image::Rgb([10, 20, 30])).save(&path)?;
        std::fs::write(dir.path().join("ortho.jgw"), "2\n0\n0\n-2\n101\n199\n")?;

        let raster = SourceRaster::open(&path)?;
        assert_eq!((raster.width(), raster.height(), raster.bands()), (16, 8, 3));
        assert_eq!(raster.geotransform, GeoTransform([100.0, 2.0, 0.0, 200.0, 0.0, -2.0]));
        Ok(())
    }
}
