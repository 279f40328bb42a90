//! Tiled GEMM entry points.
//!
//! `C = alpha * op(A) * op(B) + beta * C` with row-major operands. One call
//! selects a single kernel variant, walks the [`TilePlan`], stages the
//! operand blocks each tile needs, enqueues the tile's compute kernel behind
//! its staging tokens and hands the tile's transient images to the
//! reclaimer. Nothing in here waits on the device.

use std::fmt;

use tracing::{debug, trace};

use crate::context::GemmContext;
use crate::device::{DeviceBuffer, check_region};
use crate::dispatch::{BBinding, KChain, TileLaunch, dispatch_tile};
use crate::element::{Element, ElementInfo, ElementKind, Operation};
use crate::error::{GemmError, Result, UnsupportedReason};
use crate::event::Event;
use crate::image::{DeviceImage, StagingFormats, TransientImage};
use crate::kernels::KernelId;
use crate::reclaim::PendingLaunch;
use crate::scheduler::{BaseOffsets, GemmGeometry, SUB_GROUP_WIDTH, TilePlan, TileStep};
use crate::stager::{StageRequest, stage_buffer_to_image};
use crate::variant::{BRead, KernelKey, TileShape, Transpose};

/// Kernel family requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GemmType {
    FastImage32x1,
    FastImage32x2,
    /// B is a caller image; the tile edge is the device image limit.
    FastImageBImage,
}

impl GemmType {
    fn shape(self) -> TileShape {
        match self {
            Self::FastImage32x1 | Self::FastImageBImage => TileShape::Image32x1,
            Self::FastImage32x2 => TileShape::Image32x2,
        }
    }
}

impl From<TileShape> for GemmType {
    fn from(shape: TileShape) -> Self {
        match shape {
            TileShape::Image32x1 => Self::FastImage32x1,
            TileShape::Image32x2 => Self::FastImage32x2,
        }
    }
}

impl fmt::Display for GemmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FastImage32x1 => "fast-image-32x1",
            Self::FastImage32x2 => "fast-image-32x2",
            Self::FastImageBImage => "fast-image-b-image",
        };
        f.write_str(name)
    }
}

/// One tiled multiply. Buffers are row-major; `op(A)` is `M×K`, `op(B)` is
/// `K×N` and C is `M×N` with leading dimension `N`.
#[derive(Debug, Clone)]
pub struct GemmRequest<'a, T> {
    pub trans_a: Transpose,
    pub trans_b: Transpose,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: T,
    pub beta: T,
    pub a: &'a DeviceBuffer,
    pub a_offset: usize,
    pub b: &'a DeviceBuffer,
    pub b_offset: usize,
    /// B already resident as an image. Never released by the engine.
    pub b_image: Option<&'a DeviceImage>,
    pub c: &'a DeviceBuffer,
    pub c_offset: usize,
    /// Defaults to the configured tile shape, or the B-image family when
    /// `b_image` is set.
    pub gemm_type: Option<GemmType>,
    /// Tokens the first staging commands wait on.
    pub depends_on: Vec<Event>,
}

impl<'a, T: Element> GemmRequest<'a, T> {
    /// `C = A * B` with zero offsets and no transposes.
    pub fn new(
        m: usize,
        n: usize,
        k: usize,
        a: &'a DeviceBuffer,
        b: &'a DeviceBuffer,
        c: &'a DeviceBuffer,
    ) -> Self {
        Self {
            trans_a: Transpose::NoTrans,
            trans_b: Transpose::NoTrans,
            m,
            n,
            k,
            alpha: T::one(),
            beta: T::zero(),
            a,
            a_offset: 0,
            b,
            b_offset: 0,
            b_image: None,
            c,
            c_offset: 0,
            gemm_type: None,
            depends_on: Vec::new(),
        }
    }

    pub fn transpose(mut self, trans_a: Transpose, trans_b: Transpose) -> Self {
        self.trans_a = trans_a;
        self.trans_b = trans_b;
        self
    }

    pub fn scale(mut self, alpha: T, beta: T) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self
    }

    pub fn offsets(mut self, a: usize, b: usize, c: usize) -> Self {
        self.a_offset = a;
        self.b_offset = b;
        self.c_offset = c;
        self
    }

    pub fn with_b_image(mut self, image: &'a DeviceImage) -> Self {
        self.b_image = Some(image);
        self
    }

    pub fn with_gemm_type(mut self, gemm_type: GemmType) -> Self {
        self.gemm_type = Some(gemm_type);
        self
    }

    pub fn after(mut self, events: &[Event]) -> Self {
        self.depends_on.extend(events.iter().cloned());
        self
    }

    fn geometry(&self) -> GemmGeometry {
        GemmGeometry::new(self.trans_a, self.trans_b, self.m, self.n, self.k)
    }
}

/// What a scheduled call enqueued.
#[derive(Debug, Clone)]
pub struct GemmSummary {
    /// Compute launches, one per tile step.
    pub tiles: usize,
    /// Images staged by the engine.
    pub staged_images: usize,
    pub kernel: KernelId,
    pub grid: (usize, usize, usize),
    /// Token of the last compute launch. Waiting on it is only enough on an
    /// in-order queue.
    pub last: Option<Event>,
    /// Token of the final K block of every output tile, in plan order. All
    /// of them together cover the call on any queue.
    pub tile_ends: Vec<Event>,
}

#[derive(Debug, Clone)]
pub enum GemmOutcome {
    Scheduled(GemmSummary),
    /// Nothing was enqueued; the caller should use another path.
    Unsupported(UnsupportedReason),
}

impl GemmOutcome {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled(_))
    }

    pub fn summary(&self) -> Option<&GemmSummary> {
        match self {
            Self::Scheduled(summary) => Some(summary),
            Self::Unsupported(_) => None,
        }
    }
}

/// Capability checks shared by every accelerated entry point.
pub(crate) fn check_device(
    ctx: &GemmContext,
    kind: ElementKind,
    op: Operation,
) -> std::result::Result<&ElementInfo, UnsupportedReason> {
    let element = ctx.elements().require(kind, op)?;
    let info = ctx.device().info();
    if !info.class.is_accelerator() {
        return Err(UnsupportedReason::DeviceClass(info.class));
    }
    Ok(element)
}

fn check_tiled_support(
    ctx: &GemmContext,
    kind: ElementKind,
) -> std::result::Result<StagingFormats, UnsupportedReason> {
    let element = check_device(ctx, kind, Operation::TiledGemm)?;
    let formats = element
        .staging_formats()
        .ok_or(UnsupportedReason::NoImageFormat(kind))?;
    let info = ctx.device().info();
    if !info.image_support {
        return Err(UnsupportedReason::NoImageSupport);
    }
    if !info.subgroups {
        return Err(UnsupportedReason::NoSubgroups);
    }
    Ok(formats)
}

fn round_down(value: usize, multiple: usize) -> usize {
    value / multiple * multiple
}

/// How a supported tiled call is laid out on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TiledRoute {
    pub tile_edge: usize,
    pub formats: StagingFormats,
}

/// Every check [`gemm`] makes before touching the device.
///
/// With `b_is_image` the tile edge is the device image limit rounded down
/// to the sub-group width, and N and K must each fit in one tile.
pub(crate) fn tiled_route(
    ctx: &GemmContext,
    kind: ElementKind,
    (m, n, k): (usize, usize, usize),
    b_is_image: bool,
) -> std::result::Result<TiledRoute, UnsupportedReason> {
    let formats = check_tiled_support(ctx, kind)?;
    if k == 0 {
        return Err(UnsupportedReason::EmptyInnerDimension);
    }
    let max_image = round_down(ctx.device().info().max_image_size(), SUB_GROUP_WIDTH);
    let tile_edge = if b_is_image {
        max_image
    } else {
        ctx.config().max_tile_edge.min(max_image)
    };
    // A caller image is read from its origin.
    if tile_edge == 0 || (b_is_image && (n > tile_edge || k > tile_edge)) {
        return Err(UnsupportedReason::ExceedsImageLimit {
            m,
            n,
            k,
            limit: tile_edge,
        });
    }
    Ok(TiledRoute { tile_edge, formats })
}

fn check_kind(what: &str, buffer: &DeviceBuffer, kind: ElementKind) -> Result<()> {
    if buffer.kind != kind {
        return Err(GemmError::invariant(format!(
            "{what} buffer {} holds {} elements, call is {kind}",
            buffer.id, buffer.kind
        )));
    }
    Ok(())
}

/// Validate a caller-supplied B image against the call geometry.
fn check_b_image<T>(
    request: &GemmRequest<'_, T>,
    image: &DeviceImage,
    formats: StagingFormats,
) -> Result<()> {
    if request.b_offset != 0 {
        return Err(GemmError::invariant(format!(
            "B is an image but has offset {}",
            request.b_offset
        )));
    }
    let (width, height, format) = match request.trans_b {
        Transpose::NoTrans => (request.n, request.k, formats.block),
        Transpose::Trans => (request.k, request.n, formats.scalar),
    };
    if !image.desc.holds(width, height, format) {
        return Err(GemmError::invariant(format!(
            "B image {}x{} ({}) cannot hold a {width}x{height} ({format}) operand",
            image.width(),
            image.height(),
            image.desc.format
        )));
    }
    // Block reads past K clamp to the image's last row, which must be zero.
    if !request.trans_b.is_trans()
        && !request.k.is_multiple_of(SUB_GROUP_WIDTH)
        && image.height() <= request.k
    {
        return Err(GemmError::invariant(format!(
            "B image with K = {} needs a zero row below it, height is {}",
            request.k,
            image.height()
        )));
    }
    Ok(())
}

/// Which operands get zero-padded K extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Padding {
    a: bool,
    b: bool,
}

impl Padding {
    /// One zero-padded operand suffices: the other's out-of-range reads
    /// clamp to edge and are multiplied by zero.
    fn choose(geometry: &GemmGeometry, b_is_image: bool) -> Self {
        match (geometry.trans_b, b_is_image) {
            (_, true) => Self { a: false, b: false },
            (Transpose::NoTrans, false) => {
                let pad_b = geometry.m * geometry.k < geometry.n * geometry.k;
                Self { a: !pad_b, b: pad_b }
            }
            (Transpose::Trans, false) => Self { a: true, b: false },
        }
    }
}

/// Transient resources of one tile step, released through the reclaimer.
#[derive(Default)]
struct StepResources {
    staging: Vec<Event>,
    images: Vec<TransientImage>,
}

impl StepResources {
    fn into_pending(self, compute: Option<Event>) -> PendingLaunch {
        let mut events = self.staging;
        events.extend(compute);
        PendingLaunch::new(events, self.images)
    }
}

/// Enqueue `request` on the context's device.
///
/// Returns `Ok(GemmOutcome::Unsupported)` without touching the device when
/// the element type, device or geometry cannot take the tiled path.
pub fn gemm<T: Element>(ctx: &GemmContext, request: &GemmRequest<'_, T>) -> Result<GemmOutcome> {
    ctx.counters().record_call();
    let unsupported = |reason: UnsupportedReason| {
        debug!(%reason, m = request.m, n = request.n, k = request.k, "tiled gemm unsupported");
        ctx.counters().record_unsupported();
        Ok(GemmOutcome::Unsupported(reason))
    };

    let extents = (request.m, request.n, request.k);
    let TiledRoute { tile_edge, formats } =
        match tiled_route(ctx, T::KIND, extents, request.b_image.is_some()) {
            Ok(route) => route,
            Err(reason) => return unsupported(reason),
        };

    let gemm_type = match (request.gemm_type, request.b_image) {
        (Some(GemmType::FastImageBImage), None) => {
            return Err(GemmError::invariant("B-image GEMM requested without a B image"));
        }
        (_, Some(_)) => GemmType::FastImageBImage,
        (Some(gemm_type), None) => gemm_type,
        (None, None) => GemmType::from(ctx.config().tile_shape),
    };

    for (what, buffer) in [("A", request.a), ("B", request.b), ("C", request.c)] {
        check_kind(what, buffer, T::KIND)?;
    }
    let geometry = request.geometry();
    let (a_width, a_height) = geometry.a_dims();
    check_region("A", request.a, request.a_offset, a_width, a_height, geometry.lda())?;
    check_region("C", request.c, request.c_offset, request.n, request.m, geometry.ldc())?;
    match request.b_image {
        Some(image) => check_b_image(request, image, formats)?,
        None => {
            let (b_width, b_height) = geometry.b_dims();
            check_region("B", request.b, request.b_offset, b_width, b_height, geometry.ldb())?;
        }
    }

    let key = KernelKey {
        shape: gemm_type.shape(),
        trans_a: request.trans_a,
        b_read: BRead::select(request.trans_b, request.b_image.is_some(), request.k),
        alpha_one: request.alpha == T::one(),
        beta_zero: request.beta == T::zero(),
    };
    let kernel = ctx.kernels().lookup(&key)?.clone();

    let plan = TilePlan::new(
        geometry,
        tile_edge,
        BaseOffsets {
            a: request.a_offset,
            b: request.b_offset,
            c: request.c_offset,
        },
    )?;
    debug!(
        kernel = kernel.name(),
        %gemm_type,
        m = request.m,
        n = request.n,
        k = request.k,
        tile_edge,
        grid = ?plan.grid(),
        "scheduling tiled gemm"
    );

    let padding = Padding::choose(&geometry, request.b_image.is_some());
    let mut chain = KChain::new(ctx.device().info().out_of_order_queue);
    let (_, _, k_blocks) = plan.grid();
    let mut staged_images = 0;
    let mut last = None;
    let mut tile_ends = Vec::new();
    for step in plan.steps() {
        let compute = schedule_step(
            ctx,
            request,
            &key,
            &kernel,
            &step,
            padding,
            &mut chain,
            &mut staged_images,
        )?;
        if step.k_block + 1 == k_blocks {
            tile_ends.push(compute.clone());
        }
        last = Some(compute);
    }

    Ok(GemmOutcome::Scheduled(GemmSummary {
        tiles: plan.len(),
        staged_images,
        kernel,
        grid: plan.grid(),
        last,
        tile_ends,
    }))
}

#[allow(clippy::too_many_arguments)]
fn schedule_step<T: Element>(
    ctx: &GemmContext,
    request: &GemmRequest<'_, T>,
    key: &KernelKey,
    kernel: &KernelId,
    step: &TileStep,
    padding: Padding,
    chain: &mut KChain,
    staged_images: &mut usize,
) -> Result<Event> {
    let geometry = request.geometry();
    let mut resources = StepResources::default();
    let result = stage_and_dispatch(
        ctx,
        request,
        &geometry,
        key,
        kernel,
        step,
        padding,
        chain,
        &mut resources,
    );
    *staged_images += resources.images.len();
    match result {
        Ok(compute) => {
            ctx.counters().record_tile();
            chain.record(&compute);
            ctx.reclaimer()
                .attach(&compute, resources.into_pending(Some(compute.clone())));
            Ok(compute)
        }
        Err(e) => {
            // Staging already enqueued may still write these images.
            let after = resources.staging.clone();
            ctx.reclaimer()
                .handle()
                .defer_all(resources.into_pending(None), &after);
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn stage_and_dispatch<T: Element>(
    ctx: &GemmContext,
    request: &GemmRequest<'_, T>,
    geometry: &GemmGeometry,
    key: &KernelKey,
    kernel: &KernelId,
    step: &TileStep,
    padding: Padding,
    chain: &mut KChain,
    resources: &mut StepResources,
) -> Result<Event> {
    let lda = geometry.lda();
    let mut a_req = StageRequest::new(request.a, step.a_offset, step.a.width, step.a.height, lda)
        .matrix_a(true)
        .transposed(request.trans_a.is_trans());
    if padding.a && step.a_padded != (step.a.width, step.a.height) {
        a_req = a_req.padded(step.a_padded.0, step.a_padded.1);
    }
    let (a_image, a_event) = stage_buffer_to_image(ctx, &a_req, None, &request.depends_on)?;
    resources.staging.push(a_event);
    resources.images.extend(a_image.into_transient());

    let b_binding = match (key.b_read, request.b_image) {
        (BRead::TransposedBuffer, _) => Some((step.b_offset, geometry.ldb())),
        (_, Some(_)) => None,
        (read, None) => {
            let ldb = geometry.ldb();
            let mut b_req =
                StageRequest::new(request.b, step.b_offset, step.b.width, step.b.height, ldb)
                    .transposed(read.trans_b().is_trans());
            if padding.b && step.b_padded != (step.b.width, step.b.height) {
                b_req = b_req.padded(step.b_padded.0, step.b_padded.1);
            }
            let (b_image, b_event) = stage_buffer_to_image(ctx, &b_req, None, &request.depends_on)?;
            resources.staging.push(b_event);
            resources.images.extend(b_image.into_transient());
            None
        }
    };

    let a_image = resources
        .images
        .first()
        .map(TransientImage::image)
        .ok_or_else(|| GemmError::invariant("A tile was not staged"))?;
    let b = match (b_binding, request.b_image) {
        (Some((offset, ld)), _) => BBinding::Buffer {
            buffer: request.b,
            offset,
            ld,
        },
        (None, Some(image)) => BBinding::Image(image),
        (None, None) => BBinding::Image(
            resources
                .images
                .get(1)
                .map(TransientImage::image)
                .ok_or_else(|| GemmError::invariant("B tile was not staged"))?,
        ),
    };

    let launch = TileLaunch {
        a_image,
        b,
        c: request.c,
        c_offset: step.c_offset,
        width: step.c.width,
        height: step.c.height,
        ldc: geometry.ldc(),
        alpha: request.alpha.kernel_arg(),
        beta: request.beta.kernel_arg(),
        padded_k: step.padded_k,
        block_k: step.block_k,
        first_k_block: step.first_k_block,
    };
    let waits = chain.wait_list(&resources.staging, step.first_k_block);
    trace!(
        step = step.index,
        row_block = step.row_block,
        col_block = step.col_block,
        k_block = step.k_block,
        "tile staged"
    );
    dispatch_tile(ctx.device().as_ref(), kernel, key, &launch, &waits)
}

/// Layer-facing shorthand: `C = A * op(B)` with A not transposed, unit
/// alpha and zero beta.
#[allow(clippy::too_many_arguments)]
pub fn gemm_common<T: Element>(
    ctx: &GemmContext,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    a: &DeviceBuffer,
    b: &DeviceBuffer,
    b_image: Option<&DeviceImage>,
    c: &DeviceBuffer,
    depends_on: &[Event],
) -> Result<GemmOutcome> {
    let mut request = GemmRequest::<T>::new(m, n, k, a, b, c)
        .transpose(Transpose::NoTrans, trans_b)
        .after(depends_on);
    if let Some(image) = b_image {
        request = request.with_b_image(image);
    }
    gemm(ctx, &request)
}
