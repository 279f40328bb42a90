//! Compute device abstraction.
//!
//! The engine talks to hardware only through [`ComputeDevice`]: buffer and
//! image management plus two asynchronous commands (buffer→image region
//! copy and kernel launch), each taking a wait-list and returning an
//! [`Event`]. Implementations must be safe to share between the issuing
//! thread, the runtime's completion thread and the reaper.

pub(crate) mod host_kernels;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod reference;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::element::{Element, ElementKind};
use crate::error::{GemmError, Result};
use crate::event::Event;
use crate::image::{DeviceImage, ImageDesc};
use crate::kernels::KernelId;

// ---------------------------------------------------------------------------
// Device description
// ---------------------------------------------------------------------------

/// Device type classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Gpu,
    Cpu,
    Accelerator,
}

impl DeviceClass {
    /// Whether the accelerated kernels may run on this class.
    pub fn is_accelerator(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu => write!(f, "GPU"),
            Self::Cpu => write!(f, "CPU"),
            Self::Accelerator => write!(f, "Accelerator"),
        }
    }
}

/// Device properties consulted by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device name (e.g., "Intel(R) Iris(R) Xe Graphics")
    pub name: String,
    pub vendor: String,
    pub class: DeviceClass,
    /// `CL_DEVICE_IMAGE_SUPPORT`
    pub image_support: bool,
    pub image2d_max_width: usize,
    pub image2d_max_height: usize,
    /// `cl_intel_subgroups` is available.
    pub subgroups: bool,
    /// The command queue executes out of order.
    pub out_of_order_queue: bool,
}

impl DeviceInfo {
    /// Largest square image edge the device accepts.
    pub fn max_image_size(&self) -> usize {
        if self.image_support {
            self.image2d_max_width.min(self.image2d_max_height)
        } else {
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Buffers and kernel launches
// ---------------------------------------------------------------------------

pub type BufferId = u64;

/// Handle to a linear device buffer of `len` elements of `kind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub id: BufferId,
    pub len: usize,
    pub kind: ElementKind,
}

/// One positional kernel argument.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelArg {
    Buffer(DeviceBuffer),
    Image(DeviceImage),
    Int(i32),
    Float(f32),
    Half(u16),
    /// Work-group local memory of the given size in bytes.
    Local(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct KernelLaunch {
    pub kernel: KernelId,
    pub args: Vec<KernelArg>,
    pub global: Vec<usize>,
    pub local: Option<Vec<usize>>,
}

impl KernelLaunch {
    pub fn new(kernel: KernelId, args: Vec<KernelArg>, global: &[usize], local: Option<&[usize]>) -> Self {
        Self {
            kernel,
            args,
            global: global.to_vec(),
            local: local.map(<[usize]>::to_vec),
        }
    }
}

// ---------------------------------------------------------------------------
// Resource tracking
// ---------------------------------------------------------------------------

/// Point-in-time resource counters of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub live_buffers: usize,
    pub live_images: usize,
    pub live_events: usize,
    pub images_created: u64,
    pub commands_enqueued: u64,
    /// Launch count per kernel name.
    pub launches: HashMap<String, u64>,
}

impl DeviceStats {
    pub fn launches_of(&self, kernel: &str) -> u64 {
        self.launches.get(kernel).copied().unwrap_or(0)
    }

    /// Launches whose kernel name starts with `prefix`.
    pub fn launches_matching(&self, prefix: &str) -> u64 {
        self.launches
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(_, n)| n)
            .sum()
    }
}

/// Shared counters updated by a device and the events it hands out.
#[derive(Debug, Default)]
pub struct ResourceTracker {
    next_id: AtomicU64,
    live_buffers: AtomicUsize,
    live_images: AtomicUsize,
    live_events: AtomicUsize,
    images_created: AtomicU64,
    commands: AtomicU64,
    launches: Mutex<HashMap<String, u64>>,
}

impl ResourceTracker {
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Create a tracked event for a command named `label`.
    pub fn new_event(self: &Arc<Self>, label: impl Into<String>) -> Event {
        Event::tracked(self.next_id(), label.into(), Arc::clone(self))
    }

    pub fn buffer_allocated(&self) {
        self.live_buffers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn buffer_released(&self) {
        self.live_buffers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn image_created(&self) {
        self.images_created.fetch_add(1, Ordering::SeqCst);
        self.live_images.fetch_add(1, Ordering::SeqCst);
    }

    pub fn image_released(&self) {
        self.live_images.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn event_created(&self) {
        self.live_events.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn event_released(&self) {
        self.live_events.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn command_enqueued(&self, name: &str) {
        self.commands.fetch_add(1, Ordering::SeqCst);
        let mut launches = self.launches.lock().unwrap_or_else(PoisonError::into_inner);
        *launches.entry(name.to_string()).or_default() += 1;
    }

    pub fn snapshot(&self) -> DeviceStats {
        DeviceStats {
            live_buffers: self.live_buffers.load(Ordering::SeqCst),
            live_images: self.live_images.load(Ordering::SeqCst),
            live_events: self.live_events.load(Ordering::SeqCst),
            images_created: self.images_created.load(Ordering::SeqCst),
            commands_enqueued: self.commands.load(Ordering::SeqCst),
            launches: self
                .launches
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Device trait
// ---------------------------------------------------------------------------

/// Name under which region copies appear in [`DeviceStats::launches`].
pub const COPY_BUFFER_TO_IMAGE: &str = "copy_buffer_to_image";

/// A command queue plus the memory objects it operates on.
pub trait ComputeDevice: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    fn alloc_buffer(&self, kind: ElementKind, len: usize) -> Result<DeviceBuffer>;

    /// Blocking write of raw 32-bit words starting at element `offset`.
    /// Ordered after every previously enqueued command.
    fn write_buffer(&self, buffer: &DeviceBuffer, offset: usize, words: &[u32]) -> Result<()>;

    /// Blocking read, ordered after every previously enqueued command.
    fn read_buffer(&self, buffer: &DeviceBuffer, offset: usize, len: usize) -> Result<Vec<u32>>;

    fn release_buffer(&self, buffer: &DeviceBuffer) -> Result<()>;

    fn create_image(&self, desc: &ImageDesc) -> Result<DeviceImage>;

    fn release_image(&self, image: &DeviceImage) -> Result<()>;

    /// Copy a `region[0] × region[1]` block of contiguous rows from
    /// `src[src_offset..]` into the top-left corner of `dst`.
    fn enqueue_copy_buffer_to_image(
        &self,
        src: &DeviceBuffer,
        src_offset: usize,
        dst: &DeviceImage,
        region: [usize; 2],
        wait_list: &[Event],
    ) -> Result<Event>;

    fn enqueue_kernel(&self, launch: &KernelLaunch, wait_list: &[Event]) -> Result<Event>;

    /// Block until every enqueued command has finished.
    fn finish(&self) -> Result<()>;

    fn stats(&self) -> DeviceStats;
}

/// Typed helpers over [`ComputeDevice`].
pub trait DeviceExt: ComputeDevice {
    fn upload<T: Element>(&self, data: &[T]) -> Result<DeviceBuffer> {
        let buffer = self.alloc_buffer(T::KIND, data.len())?;
        let words: Vec<u32> = data.iter().map(|v| v.to_word()).collect();
        self.write_buffer(&buffer, 0, &words)?;
        Ok(buffer)
    }

    fn download<T: Element>(&self, buffer: &DeviceBuffer) -> Result<Vec<T>> {
        if buffer.kind != T::KIND {
            return Err(GemmError::invariant(format!(
                "buffer {} holds {} elements, requested {}",
                buffer.id,
                buffer.kind,
                T::KIND
            )));
        }
        let words = self.read_buffer(buffer, 0, buffer.len)?;
        Ok(words.into_iter().map(T::from_word).collect())
    }
}

impl<D: ComputeDevice + ?Sized> DeviceExt for D {}

/// Check that a `height × width` region with leading dimension `ld`
/// starting at `offset` lies inside `buffer`.
pub(crate) fn check_region(
    what: &str,
    buffer: &DeviceBuffer,
    offset: usize,
    width: usize,
    height: usize,
    ld: usize,
) -> Result<()> {
    if width == 0 || height == 0 {
        return Ok(());
    }
    if ld < width {
        return Err(GemmError::invariant(format!(
            "{what}: leading dimension {ld} smaller than width {width}"
        )));
    }
    let end = offset + (height - 1) * ld + width;
    if end > buffer.len {
        return Err(GemmError::invariant(format!(
            "{what}: region ends at element {end}, buffer holds {}",
            buffer.len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(len: usize) -> DeviceBuffer {
        DeviceBuffer {
            id: 1,
            len,
            kind: ElementKind::F32,
        }
    }

    #[test]
    fn cpu_is_not_an_accelerator() {
        assert!(DeviceClass::Gpu.is_accelerator());
        assert!(DeviceClass::Accelerator.is_accelerator());
        assert!(!DeviceClass::Cpu.is_accelerator());
    }

    #[test]
    fn max_image_size_is_smaller_edge() {
        let info = DeviceInfo {
            name: "dev".into(),
            vendor: "v".into(),
            class: DeviceClass::Gpu,
            image_support: true,
            image2d_max_width: 16384,
            image2d_max_height: 8192,
            subgroups: true,
            out_of_order_queue: false,
        };
        assert_eq!(info.max_image_size(), 8192);
        let no_images = DeviceInfo {
            image_support: false,
            ..info
        };
        assert_eq!(no_images.max_image_size(), 0);
    }

    #[test]
    fn region_bounds() {
        assert!(check_region("A", &buffer(12), 0, 4, 3, 4).is_ok());
        assert!(check_region("A", &buffer(12), 2, 2, 3, 4).is_ok());
        assert!(check_region("A", &buffer(12), 1, 4, 3, 4).is_err());
        assert!(check_region("A", &buffer(12), 0, 5, 2, 4).is_err());
        assert!(check_region("A", &buffer(0), 0, 0, 3, 4).is_ok());
    }

    #[test]
    fn launch_counts_by_prefix() {
        let tracker = ResourceTracker::default();
        tracker.command_enqueued("gemm_32_1_NN_1_1_float");
        tracker.command_enqueued("gemm_32_1_NN_1_1_float");
        tracker.command_enqueued("axpy_float");
        let stats = tracker.snapshot();
        assert_eq!(stats.commands_enqueued, 3);
        assert_eq!(stats.launches_of("gemm_32_1_NN_1_1_float"), 2);
        assert_eq!(stats.launches_matching("gemm_"), 2);
        assert_eq!(stats.launches_of("fill_float"), 0);
    }
}
