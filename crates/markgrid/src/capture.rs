//! Captured sheet images and capture metadata.

use std::borrow::Cow;
use std::path::Path;

use image::GrayImage;

/// Sheet id for an image file: its stem, or the whole path without one.
pub(crate) fn sheet_id_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Clockwise rotation that brings a capture upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    Upright,
    Rotate90,
    Rotate180,
    Rotate270,
}

/// One ingested capture: grayscale pixels plus capture metadata.
///
/// Immutable after construction; a pipeline run only ever borrows it.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    id: String,
    gray: GrayImage,
    dpi: Option<f32>,
    orientation: Orientation,
}

impl CapturedImage {
    pub fn new(id: impl Into<String>, gray: GrayImage) -> Self {
        Self {
            id: id.into(),
            gray,
            dpi: None,
            orientation: Orientation::Upright,
        }
    }

    /// Decode an image file; the sheet id is the file stem.
    pub fn open(path: &Path) -> Result<Self, image::ImageError> {
        let gray = image::open(path)?.to_luma8();
        Ok(Self::new(sheet_id_of(path), gray))
    }

    pub fn with_dpi(mut self, dpi: f32) -> Self {
        self.dpi = Some(dpi);
        self
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn gray(&self) -> &GrayImage {
        &self.gray
    }

    pub fn dpi(&self) -> Option<f32> {
        self.dpi
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    /// Pixels with the orientation hint applied.
    pub fn upright(&self) -> Cow<'_, GrayImage> {
        match self.orientation {
            Orientation::Upright => Cow::Borrowed(&self.gray),
            Orientation::Rotate90 => Cow::Owned(image::imageops::rotate90(&self.gray)),
            Orientation::Rotate180 => Cow::Owned(image::imageops::rotate180(&self.gray)),
            Orientation::Rotate270 => Cow::Owned(image::imageops::rotate270(&self.gray)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn upright_rotates_by_hint() {
        let mut gray = GrayImage::new(3, 2);
        gray.put_pixel(0, 0, Luma([9]));
        let img = CapturedImage::new("s", gray).with_orientation(Orientation::Rotate90);
        let up = img.upright();
        assert_eq!(up.dimensions(), (2, 3));
        assert_eq!(up.get_pixel(1, 0)[0], 9);
    }

    #[test]
    fn upright_borrows_when_no_rotation_is_needed() {
        let img = CapturedImage::new("s", GrayImage::new(4, 4));
        assert!(matches!(img.upright(), Cow::Borrowed(_)));
    }
}
