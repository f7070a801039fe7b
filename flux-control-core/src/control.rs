//! Control conditioning: control types, image sources and assembly of the
//! ordered conditioning stack handed to the ControlNet.

use std::path::Path;

use base64::{prelude::BASE64_STANDARD, Engine};
use image::{imageops::FilterType, DynamicImage};
use serde::{Deserialize, Serialize};

use crate::PredictError;

/// Control types understood by the union ControlNet.
///
/// The declaration order is the mode code fed to the ControlNet mode embedder
/// and must never be renumbered.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ControlType {
    #[default]
    Canny,
    Tile,
    Depth,
    Blur,
    Pose,
    Gray,
    LowQuality,
    None,
}

serde_plain::derive_display_from_serialize!(ControlType);
serde_plain::derive_fromstr_from_deserialize!(ControlType);

impl ControlType {
    pub const ALL: [ControlType; 8] = [
        ControlType::Canny,
        ControlType::Tile,
        ControlType::Depth,
        ControlType::Blur,
        ControlType::Pose,
        ControlType::Gray,
        ControlType::LowQuality,
        ControlType::None,
    ];

    /// Conditioning mode code: the position of this type in [`ControlType::ALL`].
    pub fn mode(self) -> u32 {
        self as u32
    }
}

/// Where a control image comes from: a file on disk or an inline `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Path(String),
    DataUri(String),
}

impl ImageSource {
    /// Returns `None` for the empty string, which stands for "no image supplied".
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            None
        } else if raw.starts_with("data:") {
            Some(Self::DataUri(raw.to_string()))
        } else {
            Some(Self::Path(raw.to_string()))
        }
    }

    /// Short human readable form used in errors and logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Path(path) => path.clone(),
            Self::DataUri(uri) => {
                let header = uri.split(',').next().unwrap_or("data:");
                format!("{header},…")
            }
        }
    }

    pub fn load(&self) -> Result<DynamicImage, PredictError> {
        let failed = |error: String| PredictError::ControlImage {
            origin: self.describe(),
            error,
        };
        match self {
            Self::Path(path) => image::open(Path::new(path)).map_err(|e| failed(e.to_string())),
            Self::DataUri(uri) => {
                let (header, payload) = uri
                    .split_once(',')
                    .ok_or_else(|| failed("data URI without payload".to_string()))?;
                if !header.ends_with(";base64") {
                    return Err(failed("only base64 data URIs are supported".to_string()));
                }
                let bytes = BASE64_STANDARD
                    .decode(payload.as_bytes())
                    .map_err(|e| failed(e.to_string()))?;
                image::load_from_memory(&bytes).map_err(|e| failed(e.to_string()))
            }
        }
    }
}

/// One control image with its control type and strength.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditioningInput {
    pub image: ImageSource,
    pub control_type: ControlType,
    pub strength: f64,
}

/// Largest multiple of 8 not exceeding `dim`.
pub fn floor_to_multiple_of_8(dim: u32) -> u32 {
    dim / 8 * 8
}

/// Resizes to the largest multiple-of-8 dimensions that fit inside the image.
/// Returns `None` when either side is below 8 pixels.
pub fn resize_to_multiple_of_8(img: &DynamicImage) -> Option<DynamicImage> {
    let width = floor_to_multiple_of_8(img.width());
    let height = floor_to_multiple_of_8(img.height());
    if width == 0 || height == 0 {
        return None;
    }
    Some(resize_exact(img, width, height))
}

/// Extends `img` to `width`x`height` by repeating its last column and row.
///
/// The original pixels keep their coordinates, so cropping the generated image
/// back to the control size lines both up exactly.
pub fn pad_to_grid(img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    if img.width() == width && img.height() == height {
        return img.clone();
    }
    let src = img.to_rgb8();
    let (max_x, max_y) = (src.width() - 1, src.height() - 1);
    let padded = image::RgbImage::from_fn(width, height, |x, y| {
        *src.get_pixel(x.min(max_x), y.min(max_y))
    });
    DynamicImage::ImageRgb8(padded)
}

fn resize_exact(img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    if img.width() == width && img.height() == height {
        img.clone()
    } else {
        img.resize_exact(width, height, FilterType::Triangle)
    }
}

/// A decoded, resized control image ready for latent encoding.
#[derive(Debug, Clone)]
pub struct ControlCondition {
    pub image: DynamicImage,
    pub mode: u32,
    pub strength: f64,
}

/// Ordered conditioning stack; index 0 is always the first conditioning input.
#[derive(Debug, Clone)]
pub struct Conditioning {
    pub conditions: Vec<ControlCondition>,
    pub width: usize,
    pub height: usize,
}

impl Conditioning {
    /// Decodes and resizes the control images.
    ///
    /// The first image is floored to multiples of 8; the second is stretched to the
    /// first one's resized dimensions so both share one latent grid.
    pub fn assemble(
        first: &ConditioningInput,
        second: Option<&ConditioningInput>,
    ) -> Result<Self, PredictError> {
        let original = first.image.load()?;
        let image = resize_to_multiple_of_8(&original).ok_or_else(|| {
            PredictError::ControlImage {
                origin: first.image.describe(),
                error: format!(
                    "image of {}x{} is smaller than 8 pixels",
                    original.width(),
                    original.height()
                ),
            }
        })?;
        let (width, height) = (image.width(), image.height());
        let mut conditions = vec![ControlCondition {
            image,
            mode: first.control_type.mode(),
            strength: first.strength,
        }];

        if let Some(second) = second {
            let image = resize_exact(&second.image.load()?, width, height);
            conditions.push(ControlCondition {
                image,
                mode: second.control_type.mode(),
                strength: second.strength,
            });
        }

        Ok(Self {
            conditions,
            width: width as usize,
            height: height as usize,
        })
    }

    pub fn modes(&self) -> Vec<u32> {
        self.conditions.iter().map(|c| c.mode).collect()
    }

    pub fn strengths(&self) -> Vec<f64> {
        self.conditions.iter().map(|c| c.strength).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    pub(crate) fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 77])
        });
        img.save(&path).unwrap();
        path
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("flux-control-{}", uuid::Uuid::new_v4()))
    }

    fn input(path: &Path, control_type: ControlType, strength: f64) -> ConditioningInput {
        ConditioningInput {
            image: ImageSource::Path(path.display().to_string()),
            control_type,
            strength,
        }
    }

    #[test]
    fn mode_codes_follow_declaration_order() {
        let names = [
            "canny",
            "tile",
            "depth",
            "blur",
            "pose",
            "gray",
            "low-quality",
            "none",
        ];
        for (idx, name) in names.iter().enumerate() {
            let control_type: ControlType = name.parse().unwrap();
            assert_eq!(control_type.mode(), idx as u32);
            assert_eq!(control_type.to_string(), *name);
            assert_eq!(ControlType::ALL[idx], control_type);
        }
        assert_eq!(ControlType::Depth.mode(), 2);
        assert!("sketch".parse::<ControlType>().is_err());
    }

    #[test]
    fn floors_to_multiple_of_8() {
        assert_eq!(floor_to_multiple_of_8(101), 96);
        assert_eq!(floor_to_multiple_of_8(205), 200);
        assert_eq!(floor_to_multiple_of_8(512), 512);
        assert_eq!(floor_to_multiple_of_8(7), 0);

        let img = DynamicImage::new_rgb8(101, 205);
        let resized = resize_to_multiple_of_8(&img).unwrap();
        assert!(resize_to_multiple_of_8(&DynamicImage::new_rgb8(5, 64)).is_none());
        assert_eq!((resized.width(), resized.height()), (96, 200));
    }

    #[test]
    fn tiny_images_are_rejected() {
        let dir = scratch_dir();
        let tiny = write_png(&dir, "tiny.png", 5, 64);
        let err = Conditioning::assemble(&input(&tiny, ControlType::Canny, 0.2), None).unwrap_err();
        match &err {
            PredictError::ControlImage { origin, error } => {
                assert_eq!(origin, &tiny.display().to_string());
                assert!(error.contains("5x64"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_client_error());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn padding_keeps_control_pixels_in_place() {
        let src = image::RgbImage::from_fn(96, 200, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 77])
        });
        let img = DynamicImage::ImageRgb8(src.clone());
        let padded = pad_to_grid(&img, 96, 208).to_rgb8();
        assert_eq!(padded.dimensions(), (96, 208));
        for (x, y, pixel) in src.enumerate_pixels() {
            assert_eq!(padded.get_pixel(x, y), pixel);
        }
        // the extra rows repeat the last one
        for y in 200..208 {
            for x in 0..96 {
                assert_eq!(padded.get_pixel(x, y), src.get_pixel(x, 199));
            }
        }
        let cropped = DynamicImage::ImageRgb8(padded).crop_imm(0, 0, 96, 200).to_rgb8();
        assert_eq!(cropped, src);
    }

    #[test]
    fn second_image_takes_first_image_dimensions() {
        let dir = scratch_dir();
        let first = write_png(&dir, "first.png", 101, 205);
        let second = write_png(&dir, "second.png", 640, 64);

        let stack = Conditioning::assemble(
            &input(&first, ControlType::Canny, 0.4),
            Some(&input(&second, ControlType::Depth, 0.7)),
        )
        .unwrap();

        assert_eq!((stack.width, stack.height), (96, 200));
        for condition in &stack.conditions {
            assert_eq!((condition.image.width(), condition.image.height()), (96, 200));
        }
        assert_eq!(stack.modes(), vec![0, 2]);
        assert_eq!(stack.strengths(), vec![0.4, 0.7]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn single_input_stack() {
        let dir = scratch_dir();
        let first = write_png(&dir, "only.png", 512, 512);
        let stack =
            Conditioning::assemble(&input(&first, ControlType::Pose, 0.2), None).unwrap();
        assert_eq!(stack.conditions.len(), 1);
        assert_eq!(stack.modes(), vec![4]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn image_sources() {
        assert_eq!(ImageSource::parse(""), None);
        assert_eq!(ImageSource::parse("   "), None);
        assert_eq!(
            ImageSource::parse("/tmp/a.png"),
            Some(ImageSource::Path("/tmp/a.png".to_string()))
        );

        let mut png = Vec::new();
        DynamicImage::new_rgb8(16, 8)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let uri = format!("data:image/png;base64,{}", BASE64_STANDARD.encode(&png));
        let source = ImageSource::parse(&uri).unwrap();
        let img = source.load().unwrap();
        assert_eq!((img.width(), img.height()), (16, 8));
        assert_eq!(source.describe(), "data:image/png;base64,…");

        let missing = ImageSource::parse("/definitely/not/here.png").unwrap();
        assert!(matches!(
            missing.load(),
            Err(PredictError::ControlImage { .. })
        ));
    }
}
