//! Fully-connected layer on top of the tiled GEMM.
//!
//! `output (M×N) = input (M×K) · Wᵀ + bias`, with the weight stored `N×K`
//! or, when `transpose` is set, `K×N`. A single-row batch goes through the
//! matrix-vector kernels. Larger batches stage the weight into a cached
//! image and run the B-image GEMM against it.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::GemmContext;
use crate::device::DeviceBuffer;
use crate::element::Element;
use crate::error::{GemmError, Result};
use crate::event::Event;
use crate::gemm::{GemmOutcome, GemmRequest, gemm, gemm_common, tiled_route};
use crate::stager::{StageRequest, StagedImageCache};
use crate::variant::Transpose;
use crate::vector::{LaunchOutcome, axpy, fill, gemv};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InnerProductConfig {
    pub bias_term: bool,
    /// Weights stored `K×N` instead of `N×K`.
    pub transpose: bool,
    /// N.
    pub num_output: usize,
    /// Batch rows.
    pub m: usize,
    /// Input features.
    pub k: usize,
    /// Weights are frozen; stage them once.
    pub phase_test: bool,
}

pub struct InnerProduct<T: Element> {
    ctx: Arc<GemmContext>,
    config: InnerProductConfig,
    /// `M` ones, the left operand of the bias GEMM.
    bias_multiplier: Option<DeviceBuffer>,
    /// Fill commands writing `bias_multiplier`.
    bias_multiplier_ready: Vec<Event>,
    weight_cache: StagedImageCache,
    _element: PhantomData<T>,
}

impl<T: Element> InnerProduct<T> {
    pub fn new(ctx: Arc<GemmContext>, config: InnerProductConfig) -> Result<Self> {
        let (bias_multiplier, bias_multiplier_ready) = if config.bias_term && config.m > 1 {
            let ones = ctx.device().alloc_buffer(T::KIND, config.m)?;
            match fill(&ctx, config.m, T::one(), &ones, 0)? {
                LaunchOutcome::Enqueued(events) => (Some(ones), events),
                LaunchOutcome::Unsupported(reason) => {
                    debug!(%reason, "bias multiplier not filled on device");
                    ctx.device().release_buffer(&ones)?;
                    (None, Vec::new())
                }
            }
        } else {
            (None, Vec::new())
        };
        let weight_cache = StagedImageCache::new(&ctx);
        Ok(Self {
            ctx,
            config,
            bias_multiplier,
            bias_multiplier_ready,
            weight_cache,
            _element: PhantomData,
        })
    }

    pub fn config(&self) -> &InnerProductConfig {
        &self.config
    }

    /// Schedule the layer.
    ///
    /// Returns `Ok(false)` when this route cannot run the layer and nothing
    /// observable was left behind for the caller to clean up.
    pub fn forward(
        &mut self,
        input: &DeviceBuffer,
        weight: &DeviceBuffer,
        bias: Option<&DeviceBuffer>,
        output: &DeviceBuffer,
    ) -> Result<bool> {
        let bias = match (self.config.bias_term, bias) {
            (true, None) => {
                return Err(GemmError::invariant("bias term configured but no bias given"));
            }
            (true, Some(bias)) => Some(bias),
            (false, _) => None,
        };
        if self.config.m == 1 {
            self.forward_vector(input, weight, bias, output)
        } else {
            self.forward_tiled(input, weight, bias, output)
        }
    }

    fn forward_vector(
        &self,
        input: &DeviceBuffer,
        weight: &DeviceBuffer,
        bias: Option<&DeviceBuffer>,
        output: &DeviceBuffer,
    ) -> Result<bool> {
        let InnerProductConfig {
            num_output: n,
            k,
            transpose,
            ..
        } = self.config;
        let events = match gemv(
            &self.ctx,
            Transpose::from(transpose),
            n,
            k,
            T::one(),
            weight,
            0,
            input,
            0,
            T::zero(),
            output,
            0,
        )? {
            LaunchOutcome::Enqueued(events) => events,
            LaunchOutcome::Unsupported(_) => return Ok(false),
        };
        if let Some(bias) = bias {
            let added = axpy(&self.ctx, n, T::one(), bias, 0, output, 0, &events)?;
            if let LaunchOutcome::Unsupported(reason) = added {
                return Err(GemmError::invariant(format!(
                    "bias add unsupported after matrix-vector product: {reason}"
                )));
            }
        }
        Ok(true)
    }

    /// The B-image GEMM's own checks, run before the weight is staged.
    fn tiled_route_available(&self) -> bool {
        if !self.ctx.config().enable_tiled_path {
            debug!("tiled layers disabled");
            return false;
        }
        let InnerProductConfig { m, num_output: n, k, .. } = self.config;
        match tiled_route(&self.ctx, T::KIND, (m, n, k), true) {
            Ok(_) => true,
            Err(reason) => {
                debug!(%reason, "weight cannot be read as a B image");
                false
            }
        }
    }

    fn forward_tiled(
        &mut self,
        input: &DeviceBuffer,
        weight: &DeviceBuffer,
        bias: Option<&DeviceBuffer>,
        output: &DeviceBuffer,
    ) -> Result<bool> {
        if !self.tiled_route_available() {
            debug!(config = ?self.config, "tiled inner product unavailable");
            return Ok(false);
        }
        let InnerProductConfig {
            m,
            num_output: n,
            k,
            transpose,
            phase_test,
            ..
        } = self.config;

        // Weight as stored: N×K, or K×N when transposed.
        let (width, height) = if transpose { (n, k) } else { (k, n) };
        let pad = |extent: usize| extent + usize::from(!extent.is_multiple_of(8));
        let request = StageRequest::new(weight, 0, width, height, width)
            .transposed(!transpose)
            .padded(pad(width), pad(height));
        let staged = self
            .weight_cache
            .stage_cached(&self.ctx, &request, phase_test, &[])?;

        let trans_b = if transpose {
            Transpose::NoTrans
        } else {
            Transpose::Trans
        };
        let outcome = gemm_common::<T>(
            &self.ctx,
            trans_b,
            m,
            n,
            k,
            input,
            weight,
            self.weight_cache.image(),
            output,
            staged.as_slice(),
        )?;
        let summary = match outcome {
            GemmOutcome::Scheduled(summary) => summary,
            GemmOutcome::Unsupported(reason) => {
                debug!(%reason, "tiled inner product declined");
                return Ok(false);
            }
        };
        self.weight_cache.mark_used(&summary.tile_ends);

        if let Some(bias) = bias {
            self.add_bias(bias, output, &summary.tile_ends)?;
        }
        Ok(true)
    }

    /// `output += ones(M) × bias` as a K = 1 GEMM, ordered after every
    /// command in `after`.
    fn add_bias(&self, bias: &DeviceBuffer, output: &DeviceBuffer, after: &[Event]) -> Result<()> {
        let ones = self
            .bias_multiplier
            .as_ref()
            .ok_or_else(|| GemmError::invariant("bias multiplier was not initialised"))?;
        let InnerProductConfig { m, num_output: n, .. } = self.config;
        let request = GemmRequest::<T>::new(m, n, 1, ones, bias, output)
            .scale(T::one(), T::one())
            .after(after)
            .after(&self.bias_multiplier_ready);
        match gemm(&self.ctx, &request)? {
            GemmOutcome::Scheduled(_) => Ok(()),
            GemmOutcome::Unsupported(reason) => Err(GemmError::invariant(format!(
                "bias GEMM unsupported after the main product: {reason}"
            ))),
        }
    }
}

impl<T: Element> Drop for InnerProduct<T> {
    fn drop(&mut self) {
        if let Some(ones) = self.bias_multiplier.take() {
            // the queue may still hold a bias GEMM reading it
            if let Err(e) = self.ctx.device().finish() {
                warn!("device finish before releasing bias multiplier failed: {e}");
            }
            if let Err(e) = self.ctx.device().release_buffer(&ones) {
                warn!(id = ones.id, "failed to release bias multiplier: {e}");
            }
        }
    }
}
