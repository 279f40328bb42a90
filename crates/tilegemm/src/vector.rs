//! Single-kernel vector primitives: GEMV, AXPY and fill.
//!
//! These are thin launches with fixed geometry. Every entry point checks
//! element type and device class first and reports an unsupported outcome
//! before any device call, so a caller can fall back without cleanup.

use tracing::{debug, trace};

use crate::context::GemmContext;
use crate::device::{DeviceBuffer, KernelArg, KernelLaunch, check_region};
use crate::dispatch::{VECTOR_GLOBAL_SIZE, VECTOR_LOCAL_SIZE};
use crate::element::{Element, Operation};
use crate::error::{GemmError, Result, UnsupportedReason};
use crate::event::Event;
use crate::gemm::check_device;
use crate::kernels;
use crate::variant::Transpose;

/// Rows reduced together by `matvec_mul4`.
const ROWS_PER_GROUP: usize = 4;

#[derive(Debug, Clone)]
pub enum LaunchOutcome {
    /// Tokens of the launches, in enqueue order. Empty when there was no
    /// work.
    Enqueued(Vec<Event>),
    Unsupported(UnsupportedReason),
}

impl LaunchOutcome {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued(_))
    }

    /// Token of the last launch, if any.
    pub fn last(&self) -> Option<&Event> {
        match self {
            Self::Enqueued(events) => events.last(),
            Self::Unsupported(_) => None,
        }
    }
}

fn int_arg(what: &str, value: usize) -> Result<KernelArg> {
    i32::try_from(value)
        .map(KernelArg::Int)
        .map_err(|_| GemmError::invariant(format!("{what} {value} does not fit a kernel int")))
}

fn unsupported(
    ctx: &GemmContext,
    op: Operation,
    reason: UnsupportedReason,
) -> Result<LaunchOutcome> {
    debug!(%op, %reason, "vector primitive unsupported");
    ctx.counters().record_unsupported();
    Ok(LaunchOutcome::Unsupported(reason))
}

fn enqueue(ctx: &GemmContext, launch: &KernelLaunch, wait_list: &[Event]) -> Result<Event> {
    trace!(kernel = %launch.kernel, global = ?launch.global, "vector launch");
    let event = ctx.device().enqueue_kernel(launch, wait_list)?;
    ctx.counters().record_vector_launch();
    Ok(event)
}

/// `y = alpha * A * x + beta * y` for a row-major `rows × cols` matrix A.
///
/// Rows are reduced four at a time; the remaining `rows % 4` rows go to a
/// second, single-row kernel. Only `trans_a = NoTrans` is implemented.
#[allow(clippy::too_many_arguments)]
pub fn gemv<T: Element>(
    ctx: &GemmContext,
    trans_a: Transpose,
    rows: usize,
    cols: usize,
    alpha: T,
    a: &DeviceBuffer,
    a_offset: usize,
    x: &DeviceBuffer,
    x_offset: usize,
    beta: T,
    y: &DeviceBuffer,
    y_offset: usize,
) -> Result<LaunchOutcome> {
    let element_size = match check_device(ctx, T::KIND, Operation::Gemv) {
        Ok(element) => element.size_bytes,
        Err(reason) => return unsupported(ctx, Operation::Gemv, reason),
    };
    if trans_a.is_trans() {
        return unsupported(ctx, Operation::Gemv, UnsupportedReason::TransposedGemv);
    }
    check_region("gemv A", a, a_offset, cols, rows, cols)?;
    check_region("gemv x", x, x_offset, cols, 1, cols)?;
    check_region("gemv y", y, y_offset, rows, 1, rows)?;

    let mut events = Vec::with_capacity(2);
    if rows == 0 {
        return Ok(LaunchOutcome::Enqueued(events));
    }

    let grouped = rows / ROWS_PER_GROUP * ROWS_PER_GROUP;
    let tail = int_arg("column remainder", cols % ROWS_PER_GROUP)?;
    let head = |row_offset: Option<usize>| -> Result<Vec<KernelArg>> {
        let mut args = vec![
            KernelArg::Buffer(a.clone()),
            int_arg("A offset", a_offset)?,
            int_arg("columns", cols)?,
        ];
        if let Some(row_offset) = row_offset {
            args.push(int_arg("row offset", row_offset)?);
        }
        args.extend([
            tail.clone(),
            KernelArg::Buffer(x.clone()),
            int_arg("x offset", x_offset)?,
            alpha.kernel_arg(),
            beta.kernel_arg(),
            KernelArg::Buffer(y.clone()),
            int_arg("y offset", y_offset)?,
        ]);
        Ok(args)
    };

    if grouped > 0 {
        let mut args = head(None)?;
        args.push(KernelArg::Local(VECTOR_LOCAL_SIZE * ROWS_PER_GROUP * element_size));
        let launch = KernelLaunch::new(
            kernels::matvec_mul4(T::KIND),
            args,
            &[grouped / ROWS_PER_GROUP * VECTOR_LOCAL_SIZE],
            Some(&[VECTOR_LOCAL_SIZE][..]),
        );
        events.push(enqueue(ctx, &launch, &[])?);
    }
    let remainder = rows - grouped;
    if remainder > 0 {
        let mut args = head(Some(grouped))?;
        args.push(KernelArg::Local(VECTOR_LOCAL_SIZE * element_size));
        let launch = KernelLaunch::new(
            kernels::matvec_mul1(T::KIND),
            args,
            &[remainder * VECTOR_LOCAL_SIZE],
            Some(&[VECTOR_LOCAL_SIZE][..]),
        );
        events.push(enqueue(ctx, &launch, &[])?);
    }
    Ok(LaunchOutcome::Enqueued(events))
}

/// `y[i] += alpha * x[i]` for `i < n`.
#[allow(clippy::too_many_arguments)]
pub fn axpy<T: Element>(
    ctx: &GemmContext,
    n: usize,
    alpha: T,
    x: &DeviceBuffer,
    x_offset: usize,
    y: &DeviceBuffer,
    y_offset: usize,
    wait_list: &[Event],
) -> Result<LaunchOutcome> {
    if let Err(reason) = check_device(ctx, T::KIND, Operation::Axpy) {
        return unsupported(ctx, Operation::Axpy, reason);
    }
    check_region("axpy x", x, x_offset, n, 1, n)?;
    check_region("axpy y", y, y_offset, n, 1, n)?;
    if n == 0 {
        return Ok(LaunchOutcome::Enqueued(Vec::new()));
    }
    let launch = KernelLaunch::new(
        kernels::axpy(T::KIND),
        vec![
            int_arg("n", n)?,
            alpha.kernel_arg(),
            KernelArg::Buffer(x.clone()),
            int_arg("x offset", x_offset)?,
            KernelArg::Buffer(y.clone()),
            int_arg("y offset", y_offset)?,
        ],
        &[VECTOR_GLOBAL_SIZE],
        Some(&[VECTOR_LOCAL_SIZE][..]),
    );
    Ok(LaunchOutcome::Enqueued(vec![enqueue(ctx, &launch, wait_list)?]))
}

/// `y[offset..offset + n] = alpha`.
pub fn fill<T: Element>(
    ctx: &GemmContext,
    n: usize,
    alpha: T,
    y: &DeviceBuffer,
    y_offset: usize,
) -> Result<LaunchOutcome> {
    if let Err(reason) = check_device(ctx, T::KIND, Operation::Fill) {
        return unsupported(ctx, Operation::Fill, reason);
    }
    check_region("fill y", y, y_offset, n, 1, n)?;
    if n == 0 {
        return Ok(LaunchOutcome::Enqueued(Vec::new()));
    }
    let launch = KernelLaunch::new(
        kernels::fill(T::KIND),
        vec![
            int_arg("n", n)?,
            alpha.kernel_arg(),
            KernelArg::Buffer(y.clone()),
            int_arg("y offset", y_offset)?,
        ],
        &[VECTOR_GLOBAL_SIZE],
        Some(&[VECTOR_LOCAL_SIZE][..]),
    );
    Ok(LaunchOutcome::Enqueued(vec![enqueue(ctx, &launch, &[])?]))
}
