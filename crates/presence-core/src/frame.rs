//! Camera frames handed to the pipeline, and the face crops cut from them.

use crate::types::BoundingBox;
use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CropError {
    #[error("rotation must be 0, 90, 180 or 270 degrees, got {0}")]
    InvalidRotation(u32),
    #[error("bounding box has non-finite coordinates")]
    NonFinite,
    #[error("bounding box ({x}, {y}, {width}x{height}) lies outside the {frame_width}x{frame_height} frame")]
    OutOfBounds {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        frame_width: u32,
        frame_height: u32,
    },
}

/// Clockwise rotation that brings the sensor image upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl TryFrom<u32> for Rotation {
    type Error = CropError;

    fn try_from(degrees: u32) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(CropError::InvalidRotation(other)),
        }
    }
}

impl From<Rotation> for u32 {
    fn from(r: Rotation) -> u32 {
        match r {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

impl Rotation {
    /// Rotate `image` clockwise by this amount.
    pub fn apply(self, image: &RgbImage) -> RgbImage {
        match self {
            Rotation::Deg0 => image.clone(),
            Rotation::Deg90 => imageops::rotate90(image),
            Rotation::Deg180 => imageops::rotate180(image),
            Rotation::Deg270 => imageops::rotate270(image),
        }
    }
}

/// An RGB camera frame plus its rotation metadata.
///
/// A frame may carry a release hook (returning the buffer to the camera's
/// pool); it runs exactly once, when the frame is dropped.
pub struct Frame {
    image: RgbImage,
    rotation: Rotation,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl Frame {
    pub fn new(image: RgbImage, rotation: Rotation) -> Self {
        Self {
            image,
            rotation,
            on_release: None,
        }
    }

    /// Attach a hook that runs when the frame is released.
    pub fn with_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Sensor resolution (width, height), before rotation.
    pub fn resolution(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// The frame rotated upright; detector coordinates refer to this image.
    pub fn upright(&self) -> RgbImage {
        self.rotation.apply(&self.image)
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("resolution", &self.resolution())
            .field("rotation", &self.rotation)
            .finish_non_exhaustive()
    }
}

/// A face sub-image cut from an upright frame.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub image: RgbImage,
    pub rotation: Rotation,
}

impl FaceCrop {
    /// Cut `face` out of an upright frame.
    ///
    /// Boxes that run past the frame edge are clamped; boxes with no overlap
    /// are rejected.
    pub fn cut(upright: &RgbImage, rotation: Rotation, face: &BoundingBox) -> Result<Self, CropError> {
        let (fw, fh) = upright.dimensions();
        if ![face.x, face.y, face.width, face.height].iter().all(|v| v.is_finite()) {
            return Err(CropError::NonFinite);
        }

        let x0 = face.x.floor().max(0.0);
        let y0 = face.y.floor().max(0.0);
        let x1 = (face.x + face.width).ceil().min(fw as f32);
        let y1 = (face.y + face.height).ceil().min(fh as f32);

        if x1 <= x0 || y1 <= y0 {
            return Err(CropError::OutOfBounds {
                x: face.x,
                y: face.y,
                width: face.width,
                height: face.height,
                frame_width: fw,
                frame_height: fh,
            });
        }

        let image = imageops::crop_imm(
            upright,
            x0 as u32,
            y0 as u32,
            (x1 - x0) as u32,
            (y1 - y0) as u32,
        )
        .to_image();

        Ok(Self { image, rotation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 1.0,
        }
    }

    #[test]
    fn test_rotation_from_degrees() {
        assert_eq!(Rotation::try_from(270).unwrap(), Rotation::Deg270);
        assert_eq!(Rotation::try_from(45), Err(CropError::InvalidRotation(45)));
    }

    #[test]
    fn test_rotate90_swaps_dimensions() {
        let img = RgbImage::new(4, 2);
        let rotated = Rotation::Deg90.apply(&img);
        assert_eq!(rotated.dimensions(), (2, 4));
    }

    #[test]
    fn test_rotate90_moves_top_left_to_top_right() {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        let rotated = Rotation::Deg90.apply(&img);
        // Clockwise: top-left lands at top-right.
        assert_eq!(rotated.get_pixel(1, 0), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_release_runs_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let frame = Frame::new(RgbImage::new(2, 2), Rotation::Deg0).with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(frame);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cut_inside_frame() {
        let mut img = RgbImage::new(10, 10);
        img.put_pixel(3, 4, Rgb([9, 9, 9]));
        let crop = FaceCrop::cut(&img, Rotation::Deg0, &bbox(3.0, 4.0, 5.0, 2.0)).unwrap();
        assert_eq!(crop.image.dimensions(), (5, 2));
        assert_eq!(crop.image.get_pixel(0, 0), &Rgb([9, 9, 9]));
    }

    #[test]
    fn test_cut_clamps_to_frame() {
        let img = RgbImage::new(10, 10);
        let crop = FaceCrop::cut(&img, Rotation::Deg0, &bbox(-3.0, 8.0, 6.0, 6.0)).unwrap();
        assert_eq!(crop.image.dimensions(), (3, 2));
    }

    #[test]
    fn test_cut_rejects_disjoint_box() {
        let img = RgbImage::new(10, 10);
        let err = FaceCrop::cut(&img, Rotation::Deg0, &bbox(20.0, 20.0, 5.0, 5.0)).unwrap_err();
        assert!(matches!(err, CropError::OutOfBounds { .. }));
    }

    #[test]
    fn test_cut_rejects_nan() {
        let img = RgbImage::new(10, 10);
        let err = FaceCrop::cut(&img, Rotation::Deg0, &bbox(f32::NAN, 0.0, 5.0, 5.0)).unwrap_err();
        assert_eq!(err, CropError::NonFinite);
    }
}
