//! `tilegemm`: tiled, image-staged GEMM scheduling for accelerator queues.
//!
//! The engine partitions an `M×N×K` multiply into device-sized tiles,
//! stages operand sub-blocks as 2-D images where that is faster to read
//! than linear memory, picks one specialised compute kernel per call and
//! enqueues every tile asynchronously. Transient images and completion
//! tokens created for a tile are released by a reaper thread once the
//! tile's compute kernel reports completion.
//!
//! | Module        | Role                                                   |
//! |---------------|--------------------------------------------------------|
//! | [`stager`]    | Buffer region → image staging, cached weight images    |
//! | [`variant`]   | Kernel variant keys and the program lookup table       |
//! | [`scheduler`] | Pure tile plan over the M×N×K iteration space          |
//! | [`dispatch`]  | Argument binding and launch geometry                   |
//! | [`reclaim`]   | Completion-driven release of per-tile resources        |
//! | [`gemm`]      | Tiled GEMM entry points                                |
//! | [`vector`]    | GEMV / AXPY / fill primitives                          |
//! | [`inner_product`] | Fully-connected layer built on the above           |
//!
//! Devices are reached through the [`ComputeDevice`] trait. The
//! [`ReferenceDevice`] executes every program on the host behind an
//! asynchronous in-order queue; the `opencl` feature adds an
//! `opencl3`-backed device.
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tilegemm::{DeviceExt, GemmConfig, GemmContext, GemmOutcome, GemmRequest, ReferenceDevice};
//!
//! let device = Arc::new(ReferenceDevice::new());
//! let ctx = GemmContext::new(device.clone(), GemmConfig::default()).unwrap();
//!
//! let a = device.upload(&[1.0f32; 16 * 8]).unwrap();
//! let b = device.upload(&[2.0f32; 8 * 4]).unwrap();
//! let c = device.upload(&[0.0f32; 16 * 4]).unwrap();
//!
//! let request = GemmRequest::new(16, 4, 8, &a, &b, &c);
//! let outcome = tilegemm::gemm::<f32>(&ctx, &request).unwrap();
//! assert!(matches!(outcome, GemmOutcome::Scheduled(_)));
//!
//! ctx.quiesce().unwrap();
//! let out: Vec<f32> = device.download(&c).unwrap();
//! assert!(out.iter().all(|&v| v == 16.0));
//! ```

pub mod config;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod element;
pub mod error;
pub mod event;
pub mod gemm;
pub mod image;
pub mod inner_product;
pub mod kernels;
pub mod reclaim;
pub mod reference_kernels;
pub mod scheduler;
pub mod stager;
pub mod variant;
pub mod vector;

pub use config::{ConfigError, GemmConfig};
pub use context::{ContextId, ContextRegistry, CounterSnapshot, GemmContext, GemmCounters};
pub use device::reference::ReferenceDevice;
pub use device::{
    ComputeDevice, DeviceBuffer, DeviceClass, DeviceExt, DeviceInfo, DeviceStats, KernelArg,
    KernelLaunch,
};
pub use element::{Element, ElementInfo, ElementKind, ElementTable, Operation};
pub use error::{GemmError, Result, UnsupportedReason};
pub use event::{Event, EventStatus};
pub use gemm::{GemmOutcome, GemmRequest, GemmSummary, GemmType, gemm, gemm_common};
pub use image::{DeviceImage, ImageDesc, ImageFormat, OperandImage, StagingFormats, TransientImage};
pub use inner_product::{InnerProduct, InnerProductConfig};
pub use kernels::{KernelId, ProgramModule};
pub use reclaim::{PendingLaunch, ReclaimHandle, Reclaimer};
pub use scheduler::{GemmGeometry, TilePlan, TileRect, TileStep};
pub use stager::{StageRequest, StagedImageCache, stage_buffer_to_image};
pub use variant::{BRead, KernelKey, KernelTable, TileShape, Transpose};
pub use vector::{LaunchOutcome, axpy, fill, gemv};

#[cfg(feature = "opencl")]
pub use device::opencl::{OpenClDevice, ProgramSet};
