//! Engine context and the registry of live contexts.
//!
//! A [`GemmContext`] bundles everything a call needs: the device, the
//! validated configuration, the element and kernel tables built at
//! initialisation and the reclaimer that releases per-tile resources.
//! Contexts are threaded explicitly through every call; the
//! [`ContextRegistry`] maps small integer ids to shared contexts for
//! callers that address devices by index.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::config::GemmConfig;
use crate::device::ComputeDevice;
use crate::element::ElementTable;
use crate::error::{GemmError, Result};
use crate::reclaim::Reclaimer;
use crate::variant::KernelTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ContextId(pub u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Work counters of one context.
#[derive(Debug, Default)]
pub struct GemmCounters {
    gemm_calls: AtomicU64,
    tiles: AtomicU64,
    stage_ops: AtomicU64,
    vector_launches: AtomicU64,
    unsupported: AtomicU64,
}

/// Snapshot of [`GemmCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub gemm_calls: u64,
    pub tiles: u64,
    pub stage_ops: u64,
    pub vector_launches: u64,
    pub unsupported: u64,
}

impl GemmCounters {
    pub(crate) fn record_call(&self) {
        self.gemm_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tile(&self) {
        self.tiles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stage(&self) {
        self.stage_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_vector_launch(&self) {
        self.vector_launches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unsupported(&self) {
        self.unsupported.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            gemm_calls: self.gemm_calls.load(Ordering::Relaxed),
            tiles: self.tiles.load(Ordering::Relaxed),
            stage_ops: self.stage_ops.load(Ordering::Relaxed),
            vector_launches: self.vector_launches.load(Ordering::Relaxed),
            unsupported: self.unsupported.load(Ordering::Relaxed),
        }
    }
}

pub struct GemmContext {
    id: ContextId,
    device: Arc<dyn ComputeDevice>,
    config: GemmConfig,
    elements: ElementTable,
    kernels: KernelTable,
    reclaimer: Reclaimer,
    counters: GemmCounters,
}

impl GemmContext {
    /// Create an unregistered context.
    pub fn new(device: Arc<dyn ComputeDevice>, config: GemmConfig) -> Result<Self> {
        Self::with_id(ContextId::default(), device, config)
    }

    /// Swap the element capability table.
    pub fn with_elements(mut self, elements: ElementTable) -> Self {
        self.elements = elements;
        self
    }

    fn with_id(id: ContextId, device: Arc<dyn ComputeDevice>, config: GemmConfig) -> Result<Self> {
        config.validate()?;
        let kernels = KernelTable::builtin();
        let info = device.info();
        debug!(
            %id,
            device = %info.name,
            class = %info.class,
            max_image = info.max_image_size(),
            subgroups = info.subgroups,
            kernels = kernels.len(),
            "gemm context created"
        );
        Ok(Self {
            id,
            device,
            config,
            elements: ElementTable::builtin(),
            kernels,
            reclaimer: Reclaimer::new(),
            counters: GemmCounters::default(),
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn device(&self) -> &Arc<dyn ComputeDevice> {
        &self.device
    }

    pub fn config(&self) -> &GemmConfig {
        &self.config
    }

    pub fn elements(&self) -> &ElementTable {
        &self.elements
    }

    pub fn kernels(&self) -> &KernelTable {
        &self.kernels
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    pub fn counters(&self) -> &GemmCounters {
        &self.counters
    }

    /// Wait for the device queue to drain and every pending tile record to
    /// be released.
    pub fn quiesce(&self) -> Result<()> {
        self.device.finish()?;
        self.reclaimer.quiesce();
        Ok(())
    }
}

impl fmt::Debug for GemmContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GemmContext")
            .field("id", &self.id)
            .field("device", &self.device.info().name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Registry of live contexts keyed by [`ContextId`].
#[derive(Debug, Default)]
pub struct ContextRegistry {
    next_id: AtomicU32,
    contexts: RwLock<HashMap<ContextId, Arc<GemmContext>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context for `device` and register it under a fresh id.
    pub fn register(
        &self,
        device: Arc<dyn ComputeDevice>,
        config: GemmConfig,
    ) -> Result<Arc<GemmContext>> {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let ctx = Arc::new(GemmContext::with_id(id, device, config)?);
        self.contexts
            .write()
            .map_err(|e| GemmError::invariant(format!("context registry lock poisoned: {e}")))?
            .insert(id, Arc::clone(&ctx));
        info!(%id, device = %ctx.device().info().name, "context registered");
        Ok(ctx)
    }

    pub fn get(&self, id: ContextId) -> Result<Arc<GemmContext>> {
        self.contexts
            .read()
            .map_err(|e| GemmError::invariant(format!("context registry lock poisoned: {e}")))?
            .get(&id)
            .cloned()
            .ok_or(GemmError::UnknownContext(id))
    }

    /// Unregister `id`. The context stays usable by existing holders.
    pub fn remove(&self, id: ContextId) -> Result<Arc<GemmContext>> {
        let removed = self
            .contexts
            .write()
            .map_err(|e| GemmError::invariant(format!("context registry lock poisoned: {e}")))?
            .remove(&id)
            .ok_or(GemmError::UnknownContext(id))?;
        debug!(%id, "context unregistered");
        Ok(removed)
    }

    pub fn ids(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self
            .contexts
            .read()
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.contexts.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
