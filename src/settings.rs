//! Edit settings (image content) and export settings (artifact shape).
//!
//! The two are deliberately independent: edit settings end up in an XMP
//! sidecar and are rendered by the converter, export settings only decide
//! what container comes out and how it is sized.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// XMP process version stamped on every written sidecar.
const PROCESS_VERSION: &str = "11.0";

/// White balance mode as stored in `crs:WhiteBalance`.
///
/// [`WhiteBalance::CameraMatching`] is a request, not a stored value: it is
/// resolved from the camera's own white balance tag before anything is
/// written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhiteBalance {
    #[serde(rename = "As Shot")]
    AsShot,
    Auto,
    Daylight,
    Cloudy,
    Shade,
    Tungsten,
    Fluorescent,
    Flash,
    #[serde(rename = "Camera Matching…")]
    CameraMatching,
    #[serde(other)]
    Custom,
}

impl WhiteBalance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AsShot => "As Shot",
            Self::Auto => "Auto",
            Self::Daylight => "Daylight",
            Self::Cloudy => "Cloudy",
            Self::Shade => "Shade",
            Self::Tungsten => "Tungsten",
            Self::Fluorescent => "Fluorescent",
            Self::Flash => "Flash",
            Self::Custom => "Custom",
            Self::CameraMatching => "Camera Matching…",
        }
    }

    /// Map a camera white balance tag value (EXIF or maker notes) to a mode.
    pub fn from_camera_tag(value: &str) -> Option<Self> {
        match value.trim() {
            "Auto" => Some(Self::Auto),
            "Daylight" | "Sunny" => Some(Self::Daylight),
            "Cloudy" | "Overcast" => Some(Self::Cloudy),
            "Shade" => Some(Self::Shade),
            "Tungsten" | "Incandescent" => Some(Self::Tungsten),
            "Fluorescent" => Some(Self::Fluorescent),
            "Flash" => Some(Self::Flash),
            _ => None,
        }
    }
}

/// Crop rectangle in normalized coordinates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Crop {
    #[serde(
        rename = "HasCrop",
        deserialize_with = "lenient_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub enabled: Option<bool>,
    #[serde(rename = "CropTop", skip_serializing_if = "Option::is_none")]
    pub top: Option<f64>,
    #[serde(rename = "CropLeft", skip_serializing_if = "Option::is_none")]
    pub left: Option<f64>,
    #[serde(rename = "CropBottom", skip_serializing_if = "Option::is_none")]
    pub bottom: Option<f64>,
    #[serde(rename = "CropRight", skip_serializing_if = "Option::is_none")]
    pub right: Option<f64>,
    #[serde(rename = "CropAngle", skip_serializing_if = "Option::is_none")]
    pub angle: Option<f64>,
}

/// User-adjustable develop parameters for one photo.
///
/// Field names on the wire are the XMP (`crs:` / `tiff:`) tag names, which
/// is also what `exiftool -j` reports. Unset fields are left untouched when
/// the settings are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditSettings {
    #[serde(rename = "WhiteBalance", skip_serializing_if = "Option::is_none")]
    pub white_balance: Option<WhiteBalance>,
    #[serde(rename = "Temperature", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<i32>,
    #[serde(rename = "Tint", skip_serializing_if = "Option::is_none")]
    pub tint: Option<i32>,

    #[serde(rename = "Exposure2012", skip_serializing_if = "Option::is_none")]
    pub exposure: Option<f64>,
    #[serde(rename = "Contrast2012", skip_serializing_if = "Option::is_none")]
    pub contrast: Option<i32>,
    #[serde(rename = "Highlights2012", skip_serializing_if = "Option::is_none")]
    pub highlights: Option<i32>,
    #[serde(rename = "Shadows2012", skip_serializing_if = "Option::is_none")]
    pub shadows: Option<i32>,
    #[serde(rename = "Whites2012", skip_serializing_if = "Option::is_none")]
    pub whites: Option<i32>,
    #[serde(rename = "Blacks2012", skip_serializing_if = "Option::is_none")]
    pub blacks: Option<i32>,

    #[serde(rename = "Texture", skip_serializing_if = "Option::is_none")]
    pub texture: Option<i32>,
    #[serde(rename = "Clarity2012", skip_serializing_if = "Option::is_none")]
    pub clarity: Option<i32>,
    #[serde(rename = "Dehaze", skip_serializing_if = "Option::is_none")]
    pub dehaze: Option<i32>,
    #[serde(rename = "Vibrance", skip_serializing_if = "Option::is_none")]
    pub vibrance: Option<i32>,
    #[serde(rename = "Saturation", skip_serializing_if = "Option::is_none")]
    pub saturation: Option<i32>,

    #[serde(rename = "Sharpness", skip_serializing_if = "Option::is_none")]
    pub sharpness: Option<i32>,
    #[serde(rename = "LuminanceSmoothing", skip_serializing_if = "Option::is_none")]
    pub luminance_nr: Option<i32>,
    #[serde(rename = "ColorNoiseReduction", skip_serializing_if = "Option::is_none")]
    pub color_nr: Option<i32>,

    #[serde(
        rename = "LensProfileEnable",
        deserialize_with = "lenient_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub lens_profile: Option<bool>,
    #[serde(
        rename = "AutoLateralCA",
        deserialize_with = "lenient_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_lateral_ca: Option<bool>,

    #[serde(flatten)]
    pub crop: Crop,

    /// EXIF orientation (1–8).
    #[serde(rename = "Orientation", skip_serializing_if = "Option::is_none")]
    pub orientation: Option<u8>,
}

impl EditSettings {
    /// Whether the white balance still holds the camera-matching request.
    pub fn needs_camera_white_balance(&self) -> bool {
        self.white_balance == Some(WhiteBalance::CameraMatching)
    }

    /// exiftool assignments that write these settings into an XMP target.
    pub fn xmp_args(&self) -> Result<Vec<String>> {
        let mut args = vec![format!("-XMP-crs:ProcessVersion={PROCESS_VERSION}")];

        if let Some(wb) = self.white_balance {
            if wb == WhiteBalance::CameraMatching {
                return Err(Error::UnresolvedWhiteBalance);
            }
            args.push(format!("-XMP-crs:WhiteBalance={}", wb.as_str()));
        }

        let numbers: [(&str, Option<f64>); 17] = [
            ("Temperature", self.temperature.map(f64::from)),
            ("Tint", self.tint.map(f64::from)),
            ("Exposure2012", self.exposure),
            ("Contrast2012", self.contrast.map(f64::from)),
            ("Highlights2012", self.highlights.map(f64::from)),
            ("Shadows2012", self.shadows.map(f64::from)),
            ("Whites2012", self.whites.map(f64::from)),
            ("Blacks2012", self.blacks.map(f64::from)),
            ("Texture", self.texture.map(f64::from)),
            ("Clarity2012", self.clarity.map(f64::from)),
            ("Dehaze", self.dehaze.map(f64::from)),
            ("Vibrance", self.vibrance.map(f64::from)),
            ("Saturation", self.saturation.map(f64::from)),
            ("Sharpness", self.sharpness.map(f64::from)),
            ("LuminanceSmoothing", self.luminance_nr.map(f64::from)),
            ("ColorNoiseReduction", self.color_nr.map(f64::from)),
            ("CropAngle", self.crop.angle),
        ];
        for (tag, value) in numbers {
            if let Some(v) = value {
                args.push(format!("-XMP-crs:{tag}={v}"));
            }
        }

        let flags = [
            ("LensProfileEnable", self.lens_profile.map(|b| if b { "1" } else { "0" })),
            ("AutoLateralCA", self.auto_lateral_ca.map(|b| if b { "1" } else { "0" })),
            ("HasCrop", self.crop.enabled.map(|b| if b { "True" } else { "False" })),
        ];
        for (tag, value) in flags {
            if let Some(v) = value {
                args.push(format!("-XMP-crs:{tag}={v}"));
            }
        }

        let edges = [
            ("CropTop", self.crop.top),
            ("CropLeft", self.crop.left),
            ("CropBottom", self.crop.bottom),
            ("CropRight", self.crop.right),
        ];
        for (tag, value) in edges {
            if let Some(v) = value {
                args.push(format!("-XMP-crs:{tag}={v}"));
            }
        }

        if let Some(o) = self.orientation {
            args.push(format!("-XMP-tiff:Orientation#={o}"));
        }
        Ok(args)
    }
}

/// Accept `true`, `"True"`, `1` and friends for XMP booleans.
fn lenient_bool<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Int(i64),
        Str(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => None,
        Some(Raw::Bool(b)) => Some(b),
        Some(Raw::Int(i)) => Some(i != 0),
        Some(Raw::Str(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
    })
}

/// Preview embedded in an exported DNG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DngPreview {
    None,
    Medium,
    Full,
}

/// Physical unit of literal export dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimUnit {
    #[default]
    Px,
    In,
    Cm,
}

/// Unit of the export density.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DensityUnit {
    #[default]
    Ppi,
    Ppc,
}

/// How the exported image is fitted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Fit {
    /// Long and short edge, matched to the image's orientation.
    Dims { long: f64, short: f64 },
    /// Literal width and height.
    Size { width: f64, height: f64 },
    /// Target pixel count, in megapixels.
    Mpix { megapixels: f64 },
}

impl Default for Fit {
    fn default() -> Self {
        Self::Size {
            width: 0.0,
            height: 0.0,
        }
    }
}

/// JPEG resampling applied after extraction from the converted DNG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resample {
    pub fit: Fit,
    pub unit: DimUnit,
    pub density: u32,
    pub density_unit: DensityUnit,
    pub quality: u8,
}

impl Default for Resample {
    fn default() -> Self {
        Self {
            fit: Fit::default(),
            unit: DimUnit::Px,
            density: 300,
            density_unit: DensityUnit::Ppi,
            quality: 90,
        }
    }
}

/// Shape of the exported artifact.
///
/// The default exports a full resolution JPEG.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Export a DNG instead of a JPEG.
    pub dng: bool,
    pub preview: Option<DngPreview>,
    pub lossy: bool,
    /// Embed the original RAW inside the DNG.
    pub embed: bool,
    /// After a DNG, also export a JPEG of the same photo.
    pub both: bool,
    pub resample: Option<Resample>,
}

impl ExportSettings {
    /// File extension of the exported artifact.
    pub fn extension(&self) -> &'static str {
        if self.dng { "dng" } else { "jpg" }
    }
}
