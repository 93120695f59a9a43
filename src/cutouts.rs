//! Cutout stamp handling: gzipped FITS decoding, ML triplet assembly and
//! thumbnail rendering.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use image::imageops::FilterType;
use image::{GrayImage, ImageFormat, Luma};
use ndarray::{s, Array2, Array3};
use std::io::{Cursor, Read};

pub const STAMP_SIZE: usize = 63;
pub const THUMBNAIL_SIZE: u32 = 168;
const PAD_VALUE: f32 = 1e-9;
const FITS_BLOCK: usize = 2880;
const CARD_LEN: usize = 80;

/// Extract the value field of a FITS header card, stripping any trailing
/// comment (after `/`) and surrounding whitespace/quotes.
fn card_value(rest: &[u8]) -> &str {
    let text = std::str::from_utf8(rest).unwrap_or("");
    let value = match text.find('/') {
        Some(idx) => &text[..idx],
        None => text,
    };
    value.trim().trim_matches('\'').trim()
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .context("failed to gunzip cutout")?;
    Ok(out)
}

/// Decode the primary HDU of a FITS image into a (ny, nx) array.
pub fn read_fits_image(data: &[u8]) -> Result<Array2<f32>> {
    let mut bitpix: Option<i64> = None;
    let mut naxis: Option<i64> = None;
    let mut naxis1: Option<i64> = None;
    let mut naxis2: Option<i64> = None;
    let mut bscale = 1.0f64;
    let mut bzero = 0.0f64;

    let mut data_start = None;
    let mut block_start = 0usize;
    'blocks: while block_start + FITS_BLOCK <= data.len() {
        let block = &data[block_start..block_start + FITS_BLOCK];
        for card in block.chunks(CARD_LEN) {
            let key = std::str::from_utf8(&card[..8]).unwrap_or("").trim();
            if key == "END" {
                data_start = Some(block_start + FITS_BLOCK);
                break 'blocks;
            }
            if &card[8..10] != b"= " {
                continue;
            }
            let value = card_value(&card[10..]);
            match key {
                "BITPIX" => bitpix = value.parse::<i64>().ok(),
                "NAXIS" => naxis = value.parse::<i64>().ok(),
                "NAXIS1" => naxis1 = value.parse::<i64>().ok(),
                "NAXIS2" => naxis2 = value.parse::<i64>().ok(),
                "BSCALE" => bscale = value.parse::<f64>().unwrap_or(1.0),
                "BZERO" => bzero = value.parse::<f64>().unwrap_or(0.0),
                _ => {}
            }
        }
        block_start += FITS_BLOCK;
    }

    let data_start = data_start.context("FITS header has no END card")?;
    let bitpix = bitpix.context("FITS header has no BITPIX")?;
    if naxis != Some(2) {
        bail!("expected a 2D FITS image, got NAXIS={:?}", naxis);
    }
    let nx = naxis1.context("FITS header has no NAXIS1")? as usize;
    let ny = naxis2.context("FITS header has no NAXIS2")? as usize;
    if nx == 0 || ny == 0 {
        bail!("empty FITS image ({nx}x{ny})");
    }

    let bytes_per_pixel = (bitpix.unsigned_abs() / 8) as usize;
    let needed = nx * ny * bytes_per_pixel;
    let raw = data
        .get(data_start..data_start + needed)
        .context("FITS data unit is truncated")?;

    let mut pixels = Vec::with_capacity(nx * ny);
    match bitpix {
        8 => pixels.extend(raw.iter().map(|&b| b as f64)),
        16 => pixels.extend(
            raw.chunks_exact(2)
                .map(|c| i16::from_be_bytes([c[0], c[1]]) as f64),
        ),
        32 => pixels.extend(
            raw.chunks_exact(4)
                .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64),
        ),
        64 => pixels.extend(raw.chunks_exact(8).map(|c| {
            i64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f64
        })),
        -32 => pixels.extend(
            raw.chunks_exact(4)
                .map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64),
        ),
        -64 => pixels.extend(raw.chunks_exact(8).map(|c| {
            f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
        })),
        other => bail!("unsupported BITPIX {other}"),
    }

    let scaled: Vec<f32> = pixels
        .into_iter()
        .map(|v| (bzero + bscale * v) as f32)
        .collect();
    Array2::from_shape_vec((ny, nx), scaled).context("FITS shape mismatch")
}

pub fn decode_stamp(gzipped: &[u8]) -> Result<Array2<f32>> {
    read_fits_image(&gunzip(gzipped)?)
}

/// NaN-free, L2-normalized plane padded to STAMP_SIZE x STAMP_SIZE.
fn prepare_plane(mut stamp: Array2<f32>) -> Result<Array2<f32>> {
    let (ny, nx) = stamp.dim();
    if ny > STAMP_SIZE || nx > STAMP_SIZE {
        bail!("stamp is {ny}x{nx}, larger than {STAMP_SIZE}x{STAMP_SIZE}");
    }

    stamp.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v });
    let norm = stamp.iter().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt() as f32;
    if norm > 0.0 {
        stamp.mapv_inplace(|v| v / norm);
    }

    if (ny, nx) == (STAMP_SIZE, STAMP_SIZE) {
        return Ok(stamp);
    }
    let mut padded = Array2::from_elem((STAMP_SIZE, STAMP_SIZE), PAD_VALUE);
    padded.slice_mut(s![..ny, ..nx]).assign(&stamp);
    Ok(padded)
}

/// Assemble the 63x63x3 (science, template, difference) inference input.
pub fn make_triplet(science: &[u8], template: &[u8], difference: &[u8]) -> Result<Array3<f32>> {
    let mut triplet = Array3::<f32>::zeros((STAMP_SIZE, STAMP_SIZE, 3));
    for (channel, gzipped) in [science, template, difference].into_iter().enumerate() {
        let plane = prepare_plane(decode_stamp(gzipped)?)?;
        triplet.slice_mut(s![.., .., channel]).assign(&plane);
    }
    Ok(triplet)
}

fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f32> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Render a gzipped FITS cutout as a fixed-size grayscale PNG. Difference
/// images are scaled linearly, everything else logarithmically.
pub fn render_thumbnail(gzipped: &[u8], difference: bool) -> Result<Vec<u8>> {
    let stamp = decode_stamp(gzipped)?;
    let (ny, nx) = stamp.dim();

    let mut img = stamp.slice(s![..;-1, ..]).to_owned();
    img.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v });

    if !difference {
        let med = median(img.as_slice().unwrap_or(&[]));
        img.mapv_inplace(|v| if v <= 0.0 { med } else { v });
    }

    let vmin = img.iter().copied().fold(f32::INFINITY, f32::min);
    let vmax = img.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let shade = |v: f32| -> u8 {
        if vmax <= vmin {
            return 0;
        }
        let t = if difference {
            (v - vmin) / (vmax - vmin)
        } else if vmin > 0.0 {
            (v.ln() - vmin.ln()) / (vmax.ln() - vmin.ln())
        } else {
            // degenerate stamp, fall back to linear
            (v - vmin) / (vmax - vmin)
        };
        (t.clamp(0.0, 1.0) * 255.0).round() as u8
    };

    let gray = GrayImage::from_fn(nx as u32, ny as u32, |x, y| {
        Luma([shade(img[(y as usize, x as usize)])])
    });
    let resized = image::imageops::resize(&gray, THUMBNAIL_SIZE, THUMBNAIL_SIZE, FilterType::Triangle);

    let mut out = Cursor::new(Vec::new());
    resized
        .write_to(&mut out, ImageFormat::Png)
        .context("failed to encode thumbnail PNG")?;
    Ok(out.into_inner())
}

pub fn render_thumbnail_base64(gzipped: &[u8], difference: bool) -> Result<String> {
    Ok(BASE64.encode(render_thumbnail(gzipped, difference)?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn card(text: &str) -> [u8; CARD_LEN] {
        let mut out = [b' '; CARD_LEN];
        out[..text.len()].copy_from_slice(text.as_bytes());
        out
    }

    /// Minimal single-HDU float FITS image, values in row-major order.
    pub(crate) fn fits_image(nx: usize, ny: usize, values: &[f32]) -> Vec<u8> {
        assert_eq!(values.len(), nx * ny);
        let mut header = Vec::new();
        header.extend_from_slice(&card("SIMPLE  =                    T"));
        header.extend_from_slice(&card("BITPIX  =                  -32"));
        header.extend_from_slice(&card("NAXIS   =                    2"));
        header.extend_from_slice(&card(&format!("NAXIS1  = {:>20}", nx)));
        header.extend_from_slice(&card(&format!("NAXIS2  = {:>20}", ny)));
        header.extend_from_slice(&card("END"));
        header.resize(FITS_BLOCK, b' ');

        let mut data = Vec::new();
        for v in values {
            data.extend_from_slice(&v.to_be_bytes());
        }
        let padded_len = data.len().div_ceil(FITS_BLOCK) * FITS_BLOCK;
        data.resize(padded_len, 0);

        header.extend_from_slice(&data);
        header
    }

    pub(crate) fn gzipped_fits(nx: usize, ny: usize, values: &[f32]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&fits_image(nx, ny, values)).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn fits_round_trip_preserves_values() {
        let values = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let decoded = read_fits_image(&fits_image(3, 2, &values)).unwrap();
        assert_eq!(decoded.dim(), (2, 3));
        assert_eq!(decoded[(0, 0)], 1.0);
        assert_eq!(decoded[(1, 2)], 6.0);
    }

    #[test]
    fn decode_stamp_handles_gzip() {
        let decoded = decode_stamp(&gzipped_fits(2, 2, &[1.0, 2.0, 3.0, 4.0])).unwrap();
        assert_eq!(decoded.dim(), (2, 2));
        assert_eq!(decoded[(1, 1)], 4.0);
    }

    #[test]
    fn prepare_plane_normalizes_and_pads() {
        let stamp = Array2::from_shape_vec((2, 2), vec![3.0f32, 0.0, 4.0, 0.0]).unwrap();
        let plane = prepare_plane(stamp).unwrap();
        assert_eq!(plane.dim(), (STAMP_SIZE, STAMP_SIZE));
        // L2 norm of [3, 4] is 5
        assert!((plane[(0, 0)] - 0.6).abs() < 1e-6);
        assert!((plane[(1, 0)] - 0.8).abs() < 1e-6);
        assert_eq!(plane[(STAMP_SIZE - 1, STAMP_SIZE - 1)], PAD_VALUE);
    }

    #[test]
    fn prepare_plane_zeroes_nans() {
        let stamp = Array2::from_shape_vec((1, 2), vec![f32::NAN, 2.0]).unwrap();
        let plane = prepare_plane(stamp).unwrap();
        assert_eq!(plane[(0, 0)], 0.0);
        assert!((plane[(0, 1)] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn prepare_plane_rejects_oversized_stamps() {
        let stamp = Array2::<f32>::zeros((STAMP_SIZE + 1, STAMP_SIZE));
        assert!(prepare_plane(stamp).is_err());
    }

    #[test]
    fn make_triplet_stacks_three_channels() {
        let science = gzipped_fits(2, 2, &[1.0, 0.0, 0.0, 0.0]);
        let template = gzipped_fits(2, 2, &[0.0, 1.0, 0.0, 0.0]);
        let difference = gzipped_fits(2, 2, &[0.0, 0.0, 1.0, 0.0]);
        let triplet = make_triplet(&science, &template, &difference).unwrap();
        assert_eq!(triplet.dim(), (STAMP_SIZE, STAMP_SIZE, 3));
        assert!((triplet[(0, 0, 0)] - 1.0).abs() < 1e-6);
        assert!((triplet[(0, 1, 1)] - 1.0).abs() < 1e-6);
        assert!((triplet[(1, 0, 2)] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn render_thumbnail_produces_png() {
        let stamp = gzipped_fits(4, 4, &[1.0; 16]);
        let png = render_thumbnail(&stamp, false).unwrap();
        // PNG signature
        assert_eq!(&png[..8], &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n']);
    }

    #[test]
    fn render_thumbnail_accepts_negative_difference_pixels() {
        let stamp = gzipped_fits(2, 2, &[-1.0, 0.0, 1.0, 2.0]);
        assert!(render_thumbnail(&stamp, true).is_ok());
    }
}
