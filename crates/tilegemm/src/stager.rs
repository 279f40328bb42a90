//! Operand staging: copying a matrix region from a buffer into an image.
//!
//! Two image layouts exist (see [`crate::image`]). A transposed B operand
//! goes to an exact-size scalar image; everything else goes to a block
//! image, optionally padded with zeros up to the padded extent. A plain
//! region copy is used when the source rows are contiguous and no padding
//! is needed; otherwise a conversion kernel performs the strided copy.
//!
//! Staging never blocks. Every operation takes a wait-list and returns the
//! completion token of the command it enqueued.

use std::sync::Arc;

use tracing::trace;

use crate::context::GemmContext;
use crate::device::{ComputeDevice, DeviceBuffer, KernelArg, KernelLaunch, check_region};
use crate::error::{GemmError, Result};
use crate::event::Event;
use crate::image::{DeviceImage, ImageDesc, OperandImage, StagingFormats, TransientImage};
use crate::kernels;
use crate::reclaim::{PendingLaunch, ReclaimHandle};

/// A buffer region to be staged into an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRequest {
    pub buffer: DeviceBuffer,
    /// Element offset of the region's first element.
    pub offset: usize,
    pub width: usize,
    pub height: usize,
    pub ld: usize,
    pub is_matrix_a: bool,
    pub transpose: bool,
    pub padding: bool,
    pub padded_width: usize,
    pub padded_height: usize,
}

impl StageRequest {
    /// Unpadded, non-transposed request for a region of matrix B.
    pub fn new(buffer: &DeviceBuffer, offset: usize, width: usize, height: usize, ld: usize) -> Self {
        Self {
            buffer: buffer.clone(),
            offset,
            width,
            height,
            ld,
            is_matrix_a: false,
            transpose: false,
            padding: false,
            padded_width: width,
            padded_height: height,
        }
    }

    pub fn matrix_a(mut self, is_matrix_a: bool) -> Self {
        self.is_matrix_a = is_matrix_a;
        self
    }

    pub fn transposed(mut self, transpose: bool) -> Self {
        self.transpose = transpose;
        self
    }

    /// Zero-pad the image up to `width × height`.
    pub fn padded(mut self, width: usize, height: usize) -> Self {
        self.padding = true;
        self.padded_width = width;
        self.padded_height = height;
        self
    }

    /// Transposed B is read texel by texel instead of with block reads.
    pub fn scalar_layout(&self) -> bool {
        !self.is_matrix_a && self.transpose
    }

    /// Descriptor of the image this request stages into.
    pub fn image_desc(&self, formats: StagingFormats) -> ImageDesc {
        if self.scalar_layout() {
            ImageDesc::new(self.width, self.height, formats.scalar)
        } else if self.padding {
            ImageDesc::new(self.padded_width, self.padded_height, formats.block)
        } else {
            ImageDesc::new(self.width, self.height, formats.block)
        }
    }

    /// Whether a plain region copy suffices.
    pub fn direct_copy(&self) -> bool {
        self.ld == self.width && (self.scalar_layout() || !self.padding)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(GemmError::invariant(format!(
                "cannot stage an empty {}x{} region",
                self.width, self.height
            )));
        }
        if self.padding
            && !self.scalar_layout()
            && (self.padded_width < self.width || self.padded_height < self.height)
        {
            return Err(GemmError::invariant(format!(
                "padded size {}x{} smaller than region {}x{}",
                self.padded_width, self.padded_height, self.width, self.height
            )));
        }
        check_region(
            "staging source",
            &self.buffer,
            self.offset,
            self.width,
            self.height,
            self.ld,
        )
    }
}

fn int_arg(value: usize) -> Result<KernelArg> {
    i32::try_from(value)
        .map(KernelArg::Int)
        .map_err(|_| GemmError::invariant(format!("staging argument {value} does not fit a kernel int")))
}

/// Image descriptor for `req` in the formats the context's element table
/// assigns to the source buffer's element type.
fn target_desc(ctx: &GemmContext, req: &StageRequest) -> Result<ImageDesc> {
    let kind = req.buffer.kind;
    let formats = ctx
        .elements()
        .staging_formats(kind)
        .ok_or_else(|| GemmError::invariant(format!("no staged image format for {kind} elements")))?;
    Ok(req.image_desc(formats))
}

/// Enqueue the copy or conversion kernel writing `req` into `image`.
fn enqueue_stage(
    device: &dyn ComputeDevice,
    req: &StageRequest,
    desc: &ImageDesc,
    image: &DeviceImage,
    wait_list: &[Event],
) -> Result<Event> {
    if !image.desc.holds(desc.width, desc.height, desc.format) {
        return Err(GemmError::invariant(format!(
            "destination image {}x{} ({}) cannot hold {}x{} ({})",
            image.width(),
            image.height(),
            image.desc.format,
            desc.width,
            desc.height,
            desc.format
        )));
    }

    if req.direct_copy() {
        trace!(width = req.width, height = req.height, "stage by region copy");
        return device.enqueue_copy_buffer_to_image(
            &req.buffer,
            req.offset,
            image,
            [req.width, req.height],
            wait_list,
        );
    }

    let global = if req.padding && !req.scalar_layout() {
        [req.padded_width, req.padded_height]
    } else {
        [req.width, req.height]
    };
    let kernel = kernels::copy_to_image(req.scalar_layout());
    trace!(kernel = kernel.name(), ?global, "stage by conversion kernel");
    let launch = KernelLaunch::new(
        kernel,
        vec![
            KernelArg::Buffer(req.buffer.clone()),
            KernelArg::Image(image.clone()),
            int_arg(req.offset)?,
            int_arg(req.width)?,
            int_arg(req.height)?,
            int_arg(req.ld)?,
        ],
        &global,
        None,
    );
    device.enqueue_kernel(&launch, wait_list)
}

/// Stage `req` into `dest`, or into a new transient image when `dest` is
/// `None`. Returns the image read by the compute kernel and the token of
/// the staging command.
pub fn stage_buffer_to_image<'a>(
    ctx: &GemmContext,
    req: &StageRequest,
    dest: Option<&'a DeviceImage>,
    wait_list: &[Event],
) -> Result<(OperandImage<'a>, Event)> {
    req.validate()?;
    let desc = target_desc(ctx, req)?;
    let image = match dest {
        Some(image) => OperandImage::Borrowed(image),
        None => OperandImage::Transient(TransientImage::create(Arc::clone(ctx.device()), &desc)?),
    };
    let event = enqueue_stage(ctx.device().as_ref(), req, &desc, image.image(), wait_list)?;
    ctx.counters().record_stage();
    Ok((image, event))
}

/// A staging target reused across calls, such as a layer's weight image.
pub struct StagedImageCache {
    image: Option<TransientImage>,
    staged: Option<StageRequest>,
    /// Tokens of the last commands reading or writing the image.
    last_use: Vec<Event>,
    reclaim: ReclaimHandle,
}

impl StagedImageCache {
    pub fn new(ctx: &GemmContext) -> Self {
        Self {
            image: None,
            staged: None,
            last_use: Vec::new(),
            reclaim: ctx.reclaimer().handle(),
        }
    }

    pub fn image(&self) -> Option<&DeviceImage> {
        self.image.as_ref().map(TransientImage::image)
    }

    /// The request currently held in the image, if any.
    pub fn staged(&self) -> Option<&StageRequest> {
        self.staged.as_ref()
    }

    /// Stage `req` unless `reuse` is set and the image already holds it.
    ///
    /// Returns the staging token, or `None` when nothing was enqueued.
    pub fn stage_cached(
        &mut self,
        ctx: &GemmContext,
        req: &StageRequest,
        reuse: bool,
        wait_list: &[Event],
    ) -> Result<Option<Event>> {
        if reuse && self.image.is_some() && self.staged.as_ref() == Some(req) {
            trace!(buffer = req.buffer.id, "staged image reused");
            return Ok(None);
        }
        req.validate()?;
        let desc = target_desc(ctx, req)?;
        self.staged = None;

        let image = match self.image.take() {
            Some(image) if image.image().desc == desc => image,
            previous => {
                if let Some(previous) = previous {
                    self.retire(previous);
                }
                TransientImage::create(Arc::clone(ctx.device()), &desc)?
            }
        };

        let mut waits = wait_list.to_vec();
        if ctx.device().info().out_of_order_queue {
            waits.extend(self.last_use.iter().cloned());
        }
        let result = enqueue_stage(ctx.device().as_ref(), req, &desc, image.image(), &waits);
        self.image = Some(image);
        let event = result?;
        ctx.counters().record_stage();
        self.staged = Some(req.clone());
        self.last_use = vec![event.clone()];
        Ok(Some(event))
    }

    /// Record the kernels reading the cached image. On an out-of-order
    /// queue every one of them must be passed.
    pub fn mark_used(&mut self, tokens: &[Event]) {
        if !tokens.is_empty() {
            self.last_use = tokens.to_vec();
        }
    }

    fn retire(&mut self, image: TransientImage) {
        let after = std::mem::take(&mut self.last_use);
        self.reclaim
            .defer_all(PendingLaunch::new(Vec::new(), vec![image]), &after);
    }
}

impl Drop for StagedImageCache {
    fn drop(&mut self) {
        if let Some(image) = self.image.take() {
            self.retire(image);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GemmConfig;
    use crate::device::DeviceExt;
    use crate::device::reference::ReferenceDevice;
    use crate::device::DeviceInfo;
    use crate::element::{ElementInfo, ElementKind};
    use crate::image::ImageFormat;

    const FLOAT: StagingFormats = StagingFormats {
        block: ImageFormat::BLOCK_READ,
        scalar: ImageFormat::SCALAR_READ,
    };

    fn setup() -> (Arc<ReferenceDevice>, GemmContext) {
        let device = Arc::new(ReferenceDevice::new());
        let ctx = GemmContext::new(device.clone(), GemmConfig::default()).unwrap();
        (device, ctx)
    }

    #[test]
    fn image_desc_by_layout() {
        let buf = DeviceBuffer {
            id: 1,
            len: 64,
            kind: crate::element::ElementKind::F32,
        };
        let b_t = StageRequest::new(&buf, 0, 5, 3, 8).transposed(true).padded(8, 8);
        assert_eq!(b_t.image_desc(FLOAT), ImageDesc::new(5, 3, ImageFormat::SCALAR_READ));
        assert!(!b_t.direct_copy());

        let a = StageRequest::new(&buf, 0, 5, 3, 5).matrix_a(true).padded(8, 3);
        assert_eq!(a.image_desc(FLOAT), ImageDesc::new(8, 3, ImageFormat::BLOCK_READ));
        assert!(!a.direct_copy());

        let a = StageRequest::new(&buf, 0, 5, 3, 5).matrix_a(true);
        assert!(a.direct_copy());
        let a = StageRequest::new(&buf, 0, 5, 3, 8).matrix_a(true).transposed(true);
        assert_eq!(a.image_desc(FLOAT).format, ImageFormat::BLOCK_READ);
        assert!(!a.direct_copy());
    }

    #[test]
    fn contiguous_region_uses_plain_copy() {
        let (device, ctx) = setup();
        let buf = device.upload(&(0..12).map(|v| v as f32).collect::<Vec<_>>()).unwrap();
        let req = StageRequest::new(&buf, 4, 4, 2, 4).matrix_a(true);
        let (image, event) = stage_buffer_to_image(&ctx, &req, None, &[]).unwrap();
        event.wait();
        assert!(image.is_transient());
        let stats = device.stats();
        assert_eq!(stats.launches_of(crate::device::COPY_BUFFER_TO_IMAGE), 1);
        assert_eq!(stats.launches_matching("gemm_buffer_copy"), 0);
        drop(image);
        assert_eq!(device.stats().live_images, 0);
    }

    #[test]
    fn strided_or_padded_region_uses_conversion_kernel() {
        let (device, ctx) = setup();
        let buf = device.upload(&[1.0f32; 64]).unwrap();
        let strided = StageRequest::new(&buf, 0, 4, 4, 8).transposed(true);
        let (_img, ev) = stage_buffer_to_image(&ctx, &strided, None, &[]).unwrap();
        ev.wait();
        let padded = StageRequest::new(&buf, 0, 5, 5, 5).matrix_a(true).padded(8, 5);
        let (_img2, ev) = stage_buffer_to_image(&ctx, &padded, None, &[]).unwrap();
        ev.wait();
        device.finish().unwrap();
        let stats = device.stats();
        assert_eq!(stats.launches_of(kernels::COPY_IMAGE_TRANSPOSE), 1);
        assert_eq!(stats.launches_of(kernels::COPY_IMAGE_NO_TRANSPOSE), 1);
        assert_eq!(ctx.counters().snapshot().stage_ops, 2);
    }

    #[test]
    fn borrowed_destination_must_fit() {
        let (device, ctx) = setup();
        let buf = device.upload(&[1.0f32; 64]).unwrap();
        let small = device
            .create_image(&ImageDesc::new(4, 4, ImageFormat::BLOCK_READ))
            .unwrap();
        let req = StageRequest::new(&buf, 0, 8, 8, 8);
        assert!(stage_buffer_to_image(&ctx, &req, Some(&small), &[]).is_err());

        let req = StageRequest::new(&buf, 0, 4, 4, 8);
        let (image, ev) = stage_buffer_to_image(&ctx, &req, Some(&small), &[]).unwrap();
        ev.wait();
        assert!(!image.is_transient());
        drop(image);
        assert_eq!(device.stats().live_images, 1);
    }

    #[test]
    fn out_of_bounds_region_rejected_before_enqueue() {
        let (device, ctx) = setup();
        let buf = device.upload(&[0.0f32; 16]).unwrap();
        let req = StageRequest::new(&buf, 8, 4, 4, 4);
        let err = stage_buffer_to_image(&ctx, &req, None, &[]).unwrap_err();
        assert!(matches!(err, GemmError::InvalidInvariant(_)));
        assert_eq!(device.stats().commands_enqueued, 0);
        assert_eq!(device.stats().images_created, 0);
    }

    #[test]
    fn cache_reuses_identical_request() {
        let (device, ctx) = setup();
        let weights = device.upload(&[0.5f32; 10 * 6]).unwrap();
        let req = StageRequest::new(&weights, 0, 6, 10, 6).transposed(true);
        let mut cache = StagedImageCache::new(&ctx);

        let first = cache.stage_cached(&ctx, &req, true, &[]).unwrap();
        assert!(first.is_some());
        let id = cache.image().unwrap().id;

        assert!(cache.stage_cached(&ctx, &req, true, &[]).unwrap().is_none());
        assert!(cache.stage_cached(&ctx, &req, false, &[]).unwrap().is_some());
        assert_eq!(cache.image().unwrap().id, id);
        assert_eq!(device.stats().images_created, 1);

        let other = StageRequest::new(&weights, 0, 6, 8, 6).transposed(true);
        assert!(cache.stage_cached(&ctx, &other, true, &[]).unwrap().is_some());
        assert_ne!(cache.image().unwrap().id, id);

        drop(cache);
        ctx.quiesce().unwrap();
        assert_eq!(device.stats().live_images, 0);
    }

    fn f32_entry(ctx: &GemmContext) -> ElementInfo {
        ctx.elements().info(ElementKind::F32).unwrap().clone()
    }

    #[test]
    fn image_format_comes_from_element_table() {
        let (device, ctx) = setup();
        let table = ctx.elements().clone().with_entry(ElementInfo {
            scalar_image_format: Some(ImageFormat::SCALAR_READ_HALF),
            ..f32_entry(&ctx)
        });
        let ctx = ctx.with_elements(table);
        let buf = device.upload(&[1.0f32; 16]).unwrap();

        let b_t = StageRequest::new(&buf, 0, 4, 4, 4).transposed(true);
        let (image, ev) = stage_buffer_to_image(&ctx, &b_t, None, &[]).unwrap();
        ev.wait();
        assert_eq!(image.image().desc.format, ImageFormat::SCALAR_READ_HALF);

        let a = StageRequest::new(&buf, 0, 4, 4, 4).matrix_a(true);
        let (image, ev) = stage_buffer_to_image(&ctx, &a, None, &[]).unwrap();
        ev.wait();
        assert_eq!(image.image().desc.format, ImageFormat::BLOCK_READ);
    }

    #[test]
    fn element_without_block_format_is_not_staged() {
        let (device, ctx) = setup();
        let table = ctx.elements().clone().with_entry(ElementInfo {
            block_image_format: None,
            ..f32_entry(&ctx)
        });
        let ctx = ctx.with_elements(table);
        let buf = device.upload(&[1.0f32; 16]).unwrap();
        let req = StageRequest::new(&buf, 0, 4, 4, 4).matrix_a(true);
        let err = stage_buffer_to_image(&ctx, &req, None, &[]).unwrap_err();
        assert!(matches!(err, GemmError::InvalidInvariant(_)));
        assert_eq!(device.stats().commands_enqueued, 0);
        assert_eq!(device.stats().images_created, 0);
    }

    #[test]
    fn restage_waits_for_every_marked_reader() {
        let device = Arc::new(ReferenceDevice::with_info(DeviceInfo {
            out_of_order_queue: true,
            ..ReferenceDevice::default_info()
        }));
        let ctx = GemmContext::new(device.clone(), GemmConfig::default()).unwrap();
        device.enable_command_log();
        let weights = device.upload(&[0.5f32; 8 * 8]).unwrap();
        let req = StageRequest::new(&weights, 0, 8, 8, 8).matrix_a(true);
        let mut cache = StagedImageCache::new(&ctx);
        cache.stage_cached(&ctx, &req, false, &[]).unwrap();

        // two independent readers, neither ordered after the other
        let other = StageRequest::new(&weights, 0, 8, 8, 8).matrix_a(true);
        let (_r1, first) = stage_buffer_to_image(&ctx, &other, None, &[]).unwrap();
        let (_r2, second) = stage_buffer_to_image(&ctx, &other, None, &[]).unwrap();
        cache.mark_used(&[first.clone(), second.clone()]);

        let restaged = cache.stage_cached(&ctx, &req, false, &[]).unwrap().unwrap();
        device.finish().unwrap();
        let log = device.command_log();
        let record = log.iter().find(|r| r.event == restaged.id()).unwrap();
        assert!(record.wait_list.contains(&first.id()));
        assert!(record.wait_list.contains(&second.id()));

        drop(cache);
        ctx.quiesce().unwrap();
    }
}
