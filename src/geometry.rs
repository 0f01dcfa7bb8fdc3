//! Export geometry: from export settings and source size to a target size.
//!
//! [`fit_image`] is pure; [`resample_jpeg`] applies its result to JPEG bytes.

use std::io::Cursor;

use image::codecs::jpeg::{JpegEncoder, PixelDensity, PixelDensityUnit};
use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat};

use crate::error::Result;
use crate::settings::{DensityUnit, DimUnit, Fit, Resample};

/// An axis with no constraint.
pub const UNBOUNDED: u32 = u32::MAX;

/// Smallest constrained axis, in pixels.
pub const MIN_EDGE: u32 = 16;

const CM_PER_INCH: f64 = 2.54;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const UNBOUNDED: Self = Self {
        width: UNBOUNDED,
        height: UNBOUNDED,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn is_landscape(&self) -> bool {
        self.width > self.height
    }
}

/// Pixels per configured dimension unit.
fn pixels_per_unit(unit: DimUnit, density: u32, density_unit: DensityUnit) -> f64 {
    let density = f64::from(density);
    match (unit, density_unit) {
        (DimUnit::Px, _) => 1.0,
        (DimUnit::In, DensityUnit::Ppi) => density,
        (DimUnit::In, DensityUnit::Ppc) => density * CM_PER_INCH,
        (DimUnit::Cm, DensityUnit::Ppi) => density / CM_PER_INCH,
        (DimUnit::Cm, DensityUnit::Ppc) => density,
    }
}

/// Round to whole pixels; zero means unconstrained.
fn round_edge(x: f64) -> u32 {
    if x <= 0.0 || !x.is_finite() {
        return UNBOUNDED;
    }
    let px = (x + 0.5).min(f64::from(UNBOUNDED - 1)) as u32;
    px.max(MIN_EDGE)
}

/// Compute the box an exported image must fit in.
///
/// An [`UNBOUNDED`] axis is not constrained; both unbounded means no resize.
pub fn fit_image(resample: &Resample, source: Dimensions) -> Dimensions {
    if source.width == 0 || source.height == 0 {
        return Dimensions::UNBOUNDED;
    }

    match resample.fit {
        Fit::Mpix { megapixels } => {
            if megapixels <= 0.0 {
                return Dimensions::UNBOUNDED;
            }
            let area = f64::from(source.width) * f64::from(source.height);
            let mul = (1e6 * megapixels / area).sqrt();
            if source.is_landscape() {
                Dimensions::new(UNBOUNDED, round_edge(mul * f64::from(source.height)))
            } else {
                Dimensions::new(round_edge(mul * f64::from(source.width)), UNBOUNDED)
            }
        }
        Fit::Dims { long, short } => {
            let mul = pixels_per_unit(resample.unit, resample.density, resample.density_unit);
            let (long, short) = if 0.0 < long && long < short {
                (short, long)
            } else {
                (long, short)
            };
            if source.is_landscape() {
                Dimensions::new(round_edge(mul * long), round_edge(mul * short))
            } else {
                Dimensions::new(round_edge(mul * short), round_edge(mul * long))
            }
        }
        Fit::Size { width, height } => {
            let mul = pixels_per_unit(resample.unit, resample.density, resample.density_unit);
            Dimensions::new(round_edge(mul * width), round_edge(mul * height))
        }
    }
}

/// Downsize a JPEG to fit the export box and re-encode it.
///
/// Never upscales. The requested density is recorded in the JPEG header.
pub fn resample_jpeg(data: &[u8], resample: &Resample) -> Result<Vec<u8>> {
    let mut img = image::load_from_memory_with_format(data, ImageFormat::Jpeg)?;
    let (width, height) = img.dimensions();
    let fit = fit_image(resample, Dimensions::new(width, height));

    if fit.width < width || fit.height < height {
        log::debug!(
            "resampling {width}x{height} into {}x{}",
            fit.width.min(width),
            fit.height.min(height)
        );
        img = img.resize(fit.width.min(width), fit.height.min(height), FilterType::Lanczos3);
    }

    let density = u16::try_from(resample.density.max(1)).unwrap_or(u16::MAX);
    let unit = match resample.density_unit {
        DensityUnit::Ppi => PixelDensityUnit::Inches,
        DensityUnit::Ppc => PixelDensityUnit::Centimeters,
    };

    let mut out = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut out, resample.quality.clamp(1, 100));
    encoder.set_pixel_density(PixelDensity {
        density: (density, density),
        unit,
    });
    encoder.encode_image(&img.to_rgb8())?;
    Ok(out.into_inner())
}
