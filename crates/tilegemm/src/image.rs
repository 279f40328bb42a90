//! 2-D image formats and image ownership.
//!
//! Operands staged for the compute kernels live in `image2d` objects. Two
//! layouts are used:
//!
//! | Read mode | Format            | Texel                          |
//! |-----------|-------------------|--------------------------------|
//! | block     | `CL_RGBA + UINT8` | one 32-bit float bit pattern   |
//! | scalar    | `CL_R + FLOAT`    | one float                      |
//!
//! Block images are read with sub-group block reads, which require a
//! 32-bit texel; the RGBA×UINT8 format gives that width without any
//! channel conversion.

use std::fmt;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::device::ComputeDevice;

// ---------------------------------------------------------------------------
// Image channel / type enums
// ---------------------------------------------------------------------------

/// OpenCL image channel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageChannelOrder {
    /// Single channel (`CL_R`).
    R,
    /// Four channels (`CL_RGBA`).
    Rgba,
}

impl fmt::Display for ImageChannelOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::R => write!(f, "CL_R"),
            Self::Rgba => write!(f, "CL_RGBA"),
        }
    }
}

/// OpenCL image channel data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageChannelType {
    /// `CL_FLOAT`.
    Float,
    /// `CL_HALF_FLOAT`.
    Half,
    /// `CL_UNSIGNED_INT8`.
    UnsignedInt8,
}

impl fmt::Display for ImageChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float => write!(f, "CL_FLOAT"),
            Self::Half => write!(f, "CL_HALF_FLOAT"),
            Self::UnsignedInt8 => write!(f, "CL_UNSIGNED_INT8"),
        }
    }
}

/// A concrete image format combining channel order and data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageFormat {
    pub channel_order: ImageChannelOrder,
    pub channel_type: ImageChannelType,
}

impl ImageFormat {
    /// Layout for sub-group block reads.
    pub const BLOCK_READ: Self = Self::new(ImageChannelOrder::Rgba, ImageChannelType::UnsignedInt8);
    /// Layout for scalar reads of transposed operands.
    pub const SCALAR_READ: Self = Self::new(ImageChannelOrder::R, ImageChannelType::Float);
    pub const SCALAR_READ_HALF: Self = Self::new(ImageChannelOrder::R, ImageChannelType::Half);

    pub const fn new(channel_order: ImageChannelOrder, channel_type: ImageChannelType) -> Self {
        Self {
            channel_order,
            channel_type,
        }
    }

    pub const fn num_channels(&self) -> usize {
        match self.channel_order {
            ImageChannelOrder::R => 1,
            ImageChannelOrder::Rgba => 4,
        }
    }

    pub const fn bytes_per_pixel(&self) -> usize {
        let type_size = match self.channel_type {
            ImageChannelType::Float => 4,
            ImageChannelType::Half => 2,
            ImageChannelType::UnsignedInt8 => 1,
        };
        self.num_channels() * type_size
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} × {}", self.channel_order, self.channel_type)
    }
}

/// The two staged-image layouts of one element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StagingFormats {
    /// Images read with sub-group block reads.
    pub block: ImageFormat,
    /// Transposed B, read texel by texel.
    pub scalar: ImageFormat,
}

// ---------------------------------------------------------------------------
// Descriptors and handles
// ---------------------------------------------------------------------------

/// Shape and format of a 2-D image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    pub width: usize,
    pub height: usize,
    pub format: ImageFormat,
}

impl ImageDesc {
    pub const fn new(width: usize, height: usize, format: ImageFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub const fn texels(&self) -> usize {
        self.width * self.height
    }

    pub const fn size_bytes(&self) -> usize {
        self.texels() * self.format.bytes_per_pixel()
    }

    /// True if an image of `self` can hold a `width × height` region of
    /// the same format.
    pub fn holds(&self, width: usize, height: usize, format: ImageFormat) -> bool {
        self.format == format && self.width >= width && self.height >= height
    }
}

pub type ImageId = u64;

/// Handle to an image living on a device. Does not own the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceImage {
    pub id: ImageId,
    pub desc: ImageDesc,
}

impl DeviceImage {
    pub fn width(&self) -> usize {
        self.desc.width
    }

    pub fn height(&self) -> usize {
        self.desc.height
    }
}

/// An engine-created image, released on drop.
pub struct TransientImage {
    image: DeviceImage,
    device: Arc<dyn ComputeDevice>,
}

impl TransientImage {
    pub fn create(device: Arc<dyn ComputeDevice>, desc: &ImageDesc) -> crate::Result<Self> {
        let image = device.create_image(desc)?;
        trace!(id = image.id, width = desc.width, height = desc.height, "transient image created");
        Ok(Self { image, device })
    }

    pub fn image(&self) -> &DeviceImage {
        &self.image
    }
}

impl Drop for TransientImage {
    fn drop(&mut self) {
        if let Err(e) = self.device.release_image(&self.image) {
            warn!(id = self.image.id, "failed to release transient image: {e}");
        }
    }
}

impl fmt::Debug for TransientImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransientImage").field(&self.image).finish()
    }
}

/// The image an operand is read from during one tile.
#[derive(Debug)]
pub enum OperandImage<'a> {
    /// Caller-owned, never released by the engine.
    Borrowed(&'a DeviceImage),
    /// Engine-owned, released once dropped.
    Transient(TransientImage),
}

impl OperandImage<'_> {
    pub fn image(&self) -> &DeviceImage {
        match self {
            Self::Borrowed(image) => image,
            Self::Transient(t) => t.image(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Hand over ownership of an engine-created image.
    pub fn into_transient(self) -> Option<TransientImage> {
        match self {
            Self::Borrowed(_) => None,
            Self::Transient(t) => Some(t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::reference::ReferenceDevice;

    #[test]
    fn texel_sizes() {
        assert_eq!(ImageFormat::BLOCK_READ.bytes_per_pixel(), 4);
        assert_eq!(ImageFormat::SCALAR_READ.bytes_per_pixel(), 4);
        assert_eq!(ImageFormat::SCALAR_READ_HALF.bytes_per_pixel(), 2);
        assert_eq!(
            ImageDesc::new(16, 8, ImageFormat::BLOCK_READ).size_bytes(),
            16 * 8 * 4
        );
    }

    #[test]
    fn holds_checks_format_and_extent() {
        let desc = ImageDesc::new(32, 16, ImageFormat::BLOCK_READ);
        assert!(desc.holds(32, 16, ImageFormat::BLOCK_READ));
        assert!(desc.holds(8, 8, ImageFormat::BLOCK_READ));
        assert!(!desc.holds(33, 16, ImageFormat::BLOCK_READ));
        assert!(!desc.holds(8, 8, ImageFormat::SCALAR_READ));
    }

    #[test]
    fn transient_image_released_on_drop() {
        let device = Arc::new(ReferenceDevice::new());
        let desc = ImageDesc::new(8, 8, ImageFormat::SCALAR_READ);
        let image = TransientImage::create(device.clone(), &desc).unwrap();
        assert_eq!(device.stats().live_images, 1);

        let operand = OperandImage::Transient(image);
        assert!(operand.is_transient());
        drop(operand);
        assert_eq!(device.stats().live_images, 0);
    }

    #[test]
    fn borrowed_image_is_not_released() {
        let device = Arc::new(ReferenceDevice::new());
        let desc = ImageDesc::new(8, 8, ImageFormat::SCALAR_READ);
        let image = device.create_image(&desc).unwrap();
        {
            let operand = OperandImage::Borrowed(&image);
            assert_eq!(operand.image().id, image.id);
            assert!(operand.into_transient().is_none());
        }
        assert_eq!(device.stats().live_images, 1);
        device.release_image(&image).unwrap();
        assert_eq!(device.stats().live_images, 0);
    }
}
