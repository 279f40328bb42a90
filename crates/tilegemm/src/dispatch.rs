//! Argument binding and launch geometry for one tile's compute kernel.

use tracing::trace;

use crate::device::{ComputeDevice, DeviceBuffer, KernelArg, KernelLaunch};
use crate::error::{GemmError, Result};
use crate::event::Event;
use crate::image::DeviceImage;
use crate::kernels::KernelId;
use crate::scheduler::{SUB_GROUP_WIDTH, round_up};
use crate::variant::{KernelKey, TileShape};

/// Work-group size of every GEMM variant.
pub const LOCAL_SIZE: [usize; 2] = [SUB_GROUP_WIDTH, 1];
/// Output rows computed by one work-item lane.
pub const ROWS_PER_LANE: usize = 32;
/// Work-group size of the vector kernels.
pub const VECTOR_LOCAL_SIZE: usize = 128;
/// Global size of the grid-stride vector kernels (`axpy`, `fill`).
pub const VECTOR_GLOBAL_SIZE: usize = 128 * 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub global: [usize; 2],
    pub local: [usize; 2],
}

impl LaunchGeometry {
    /// Geometry for a `width × height` output tile.
    pub fn for_tile(shape: TileShape, width: usize, height: usize) -> Self {
        let lanes = width.div_ceil(shape.columns_per_lane());
        Self {
            global: [round_up(lanes, SUB_GROUP_WIDTH), height.div_ceil(ROWS_PER_LANE)],
            local: LOCAL_SIZE,
        }
    }
}

/// How operand B is bound for one tile.
#[derive(Debug, Clone, Copy)]
pub enum BBinding<'a> {
    Image(&'a DeviceImage),
    /// Strided reads straight from the buffer.
    Buffer {
        buffer: &'a DeviceBuffer,
        offset: usize,
        ld: usize,
    },
}

/// Per-tile kernel inputs.
#[derive(Debug, Clone)]
pub struct TileLaunch<'a> {
    pub a_image: &'a DeviceImage,
    pub b: BBinding<'a>,
    pub c: &'a DeviceBuffer,
    pub c_offset: usize,
    pub width: usize,
    pub height: usize,
    pub ldc: usize,
    pub alpha: KernelArg,
    pub beta: KernelArg,
    pub padded_k: usize,
    pub block_k: usize,
    pub first_k_block: bool,
}

fn int_arg(what: &str, value: usize) -> Result<KernelArg> {
    i32::try_from(value)
        .map(KernelArg::Int)
        .map_err(|_| GemmError::invariant(format!("{what} {value} does not fit a kernel int")))
}

/// Positional arguments for `key`'s kernel.
pub fn bind_args(key: &KernelKey, launch: &TileLaunch<'_>) -> Result<Vec<KernelArg>> {
    let mut args = Vec::with_capacity(14);
    args.push(KernelArg::Image(launch.a_image.clone()));
    match (launch.b, key.b_read.reads_image()) {
        (BBinding::Image(image), true) => args.push(KernelArg::Image(image.clone())),
        (BBinding::Buffer { buffer, offset, ld }, false) => {
            args.push(KernelArg::Buffer(buffer.clone()));
            args.push(int_arg("B offset", offset)?);
            args.push(int_arg("ldB", ld)?);
        }
        (binding, _) => {
            return Err(GemmError::invariant(format!(
                "B binding {binding:?} does not match read mode {:?}",
                key.b_read
            )));
        }
    }
    args.push(KernelArg::Buffer(launch.c.clone()));
    args.push(int_arg("C offset", launch.c_offset)?);
    args.push(int_arg("tile height", launch.height)?);
    args.push(int_arg("tile width", launch.width)?);
    args.push(int_arg("ldC", launch.ldc)?);
    args.push(launch.alpha.clone());
    args.push(launch.beta.clone());
    args.push(int_arg("padded K", launch.padded_k)?);
    if key.b_read.trans_b().is_trans() {
        args.push(int_arg("block K", launch.block_k)?);
    }
    args.push(KernelArg::Int(i32::from(launch.first_k_block)));
    Ok(args)
}

/// Enqueue one tile's compute kernel behind `wait_list`.
pub fn dispatch_tile(
    device: &dyn ComputeDevice,
    kernel: &KernelId,
    key: &KernelKey,
    launch: &TileLaunch<'_>,
    wait_list: &[Event],
) -> Result<Event> {
    let geometry = LaunchGeometry::for_tile(key.shape, launch.width, launch.height);
    let args = bind_args(key, launch)?;
    trace!(
        kernel = kernel.name(),
        global = ?geometry.global,
        waits = wait_list.len(),
        "dispatch tile"
    );
    let launch = KernelLaunch::new(kernel.clone(), args, &geometry.global, Some(&geometry.local[..]));
    device.enqueue_kernel(&launch, wait_list)
}

/// Orders the K blocks of one output tile on out-of-order queues.
#[derive(Debug, Default)]
pub struct KChain {
    enabled: bool,
    previous: Option<Event>,
}

impl KChain {
    pub fn new(out_of_order: bool) -> Self {
        Self {
            enabled: out_of_order,
            previous: None,
        }
    }

    /// Final wait-list for a tile: its staging tokens plus, on an
    /// out-of-order queue, the previous K block of the same output tile.
    pub fn wait_list(&mut self, staging: &[Event], first_k_block: bool) -> Vec<Event> {
        if first_k_block {
            self.previous = None;
        }
        let mut waits = staging.to_vec();
        if self.enabled {
            waits.extend(self.previous.iter().cloned());
        }
        waits
    }

    pub fn record(&mut self, compute: &Event) {
        if self.enabled {
            self.previous = Some(compute.clone());
        }
    }
}
