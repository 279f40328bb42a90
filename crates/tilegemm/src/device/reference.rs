//! Host-executed reference device.
//!
//! Commands are queued in order and executed by a dedicated worker thread,
//! so completion (and every callback attached to it) happens off the
//! issuing thread exactly like on a real driver. The queue can be paused
//! to hold commands back, which keeps their transient resources alive.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use crate::element::ElementKind;
use crate::error::{GemmError, Result};
use crate::event::{ERROR_IN_WAIT_LIST, Event, EventId, EventStatus};
use crate::image::{DeviceImage, ImageDesc};

use super::host_kernels::{self, HostImage, HostKernel, INVALID_KERNEL_ARGS, Storage};
use super::{
    COPY_BUFFER_TO_IMAGE, ComputeDevice, DeviceBuffer, DeviceClass, DeviceInfo, DeviceStats,
    KernelLaunch, ResourceTracker,
};

/// One enqueued command as seen by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub name: String,
    pub event: EventId,
    pub wait_list: Vec<EventId>,
}

enum Op {
    Copy {
        src: DeviceBuffer,
        src_offset: usize,
        dst: DeviceImage,
        region: [usize; 2],
    },
    Kernel {
        kernel: HostKernel,
        launch: KernelLaunch,
    },
}

struct Command {
    op: Op,
    wait_list: Vec<Event>,
    event: Event,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Command>,
    in_flight: bool,
    paused: bool,
    shutdown: bool,
    failures: Vec<String>,
    log: Vec<CommandRecord>,
}

struct Shared {
    storage: Mutex<Storage>,
    queue: Mutex<QueueState>,
    wake: Condvar,
    idle: Condvar,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reference implementation of [`ComputeDevice`] running every program on
/// the host.
pub struct ReferenceDevice {
    info: DeviceInfo,
    tracker: Arc<ResourceTracker>,
    shared: Arc<Shared>,
    programs: HashMap<String, HostKernel>,
    log_commands: AtomicBool,
    worker: Option<JoinHandle<()>>,
}

impl ReferenceDevice {
    /// A GPU-class device with image and sub-group support.
    pub fn new() -> Self {
        Self::with_info(Self::default_info())
    }

    /// A CPU-class device. Accelerated kernels refuse to run on it.
    pub fn cpu() -> Self {
        Self::with_info(DeviceInfo {
            name: "Reference CPU (host)".to_string(),
            class: DeviceClass::Cpu,
            subgroups: false,
            ..Self::default_info()
        })
    }

    pub fn default_info() -> DeviceInfo {
        DeviceInfo {
            name: "Reference GPU (host)".to_string(),
            vendor: "tilegemm".to_string(),
            class: DeviceClass::Gpu,
            image_support: true,
            image2d_max_width: 16384,
            image2d_max_height: 16384,
            subgroups: true,
            out_of_order_queue: false,
        }
    }

    pub fn with_info(info: DeviceInfo) -> Self {
        let shared = Arc::new(Shared {
            storage: Mutex::new(Storage::default()),
            queue: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
            idle: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || run_worker(&worker_shared));
        debug!(name = %info.name, class = %info.class, "reference device started");
        Self {
            info,
            tracker: Arc::new(ResourceTracker::default()),
            shared,
            programs: host_kernels::builtin_programs(),
            log_commands: AtomicBool::new(false),
            worker: Some(worker),
        }
    }

    /// Hold back execution of queued commands until [`resume`](Self::resume).
    pub fn pause(&self) {
        lock(&self.shared.queue).paused = true;
    }

    pub fn resume(&self) {
        lock(&self.shared.queue).paused = false;
        self.shared.wake.notify_all();
    }

    /// Commands enqueued but not yet finished.
    pub fn pending_commands(&self) -> usize {
        let q = lock(&self.shared.queue);
        q.pending.len() + usize::from(q.in_flight)
    }

    /// Start recording every enqueued command with its wait-list.
    pub fn enable_command_log(&self) {
        self.log_commands.store(true, Ordering::SeqCst);
    }

    pub fn command_log(&self) -> Vec<CommandRecord> {
        lock(&self.shared.queue).log.clone()
    }

    fn submit(&self, name: &str, op: Op, wait_list: &[Event]) -> Event {
        self.tracker.command_enqueued(name);
        let event = self.tracker.new_event(name);
        trace!(name, event = event.id(), waits = wait_list.len(), "enqueue");
        {
            let mut q = lock(&self.shared.queue);
            if self.log_commands.load(Ordering::SeqCst) {
                q.log.push(CommandRecord {
                    name: name.to_string(),
                    event: event.id(),
                    wait_list: wait_list.iter().map(Event::id).collect(),
                });
            }
            q.pending.push_back(Command {
                op,
                wait_list: wait_list.to_vec(),
                event: event.clone(),
            });
        }
        self.shared.wake.notify_one();
        event
    }

    fn wait_idle(&self, op: &'static str) -> Result<()> {
        let mut q = lock(&self.shared.queue);
        while !q.pending.is_empty() || q.in_flight {
            if q.paused && !q.in_flight {
                return Err(GemmError::device(op, "queue is paused with commands pending"));
            }
            q = self
                .shared
                .idle
                .wait(q)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }
}

impl Default for ReferenceDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReferenceDevice {
    fn drop(&mut self) {
        {
            let mut q = lock(&self.shared.queue);
            q.shutdown = true;
            q.paused = false;
        }
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            // Last handle dropped from a completion callback: the worker
            // exits on its own once the current command returns.
            if worker.thread().id() == thread::current().id() {
                trace!("reference device dropped on its worker thread");
                return;
            }
            if worker.join().is_err() {
                warn!("reference device worker panicked");
            }
        }
    }
}

fn run_worker(shared: &Shared) {
    loop {
        let command = {
            let mut q = lock(&shared.queue);
            loop {
                if !q.paused {
                    if let Some(cmd) = q.pending.pop_front() {
                        q.in_flight = true;
                        break cmd;
                    }
                    if q.shutdown {
                        return;
                    }
                }
                q = shared.wake.wait(q).unwrap_or_else(PoisonError::into_inner);
            }
        };

        if let Err(reason) = execute(shared, command) {
            lock(&shared.queue).failures.push(reason);
        }

        lock(&shared.queue).in_flight = false;
        shared.idle.notify_all();
    }
}

fn execute(shared: &Shared, command: Command) -> std::result::Result<(), String> {
    let Command {
        op,
        wait_list,
        event,
    } = command;

    for dep in &wait_list {
        if let EventStatus::Error(code) = dep.wait() {
            let reason = format!("{}: dependency {} failed with {code}", event.label(), dep.id());
            warn!("{reason}");
            event.fail(ERROR_IN_WAIT_LIST);
            return Err(reason);
        }
    }
    drop(wait_list);

    event.set_running();
    let result = {
        let mut storage = lock(&shared.storage);
        match &op {
            Op::Copy {
                src,
                src_offset,
                dst,
                region,
            } => host_kernels::copy_region(&mut storage, src, *src_offset, dst, *region),
            Op::Kernel { kernel, launch } => host_kernels::execute(*kernel, &mut storage, launch),
        }
    };
    drop(op);

    match result {
        Ok(()) => {
            event.complete();
            Ok(())
        }
        Err(reason) => {
            warn!(kernel = event.label(), "command failed: {reason}");
            event.fail(INVALID_KERNEL_ARGS);
            Err(reason)
        }
    }
}

impl ComputeDevice for ReferenceDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn alloc_buffer(&self, kind: ElementKind, len: usize) -> Result<DeviceBuffer> {
        if len == 0 {
            return Err(GemmError::device("alloc_buffer", "CL_INVALID_BUFFER_SIZE"));
        }
        let buffer = DeviceBuffer {
            id: self.tracker.next_id(),
            len,
            kind,
        };
        lock(&self.shared.storage)
            .buffers
            .insert(buffer.id, vec![0; len]);
        self.tracker.buffer_allocated();
        Ok(buffer)
    }

    fn write_buffer(&self, buffer: &DeviceBuffer, offset: usize, words: &[u32]) -> Result<()> {
        self.wait_idle("write_buffer")?;
        let mut storage = lock(&self.shared.storage);
        let dst = storage
            .buffers
            .get_mut(&buffer.id)
            .ok_or_else(|| GemmError::device("write_buffer", "CL_INVALID_MEM_OBJECT"))?;
        let end = offset + words.len();
        if end > dst.len() {
            return Err(GemmError::invariant(format!(
                "write of {} words at {offset} overruns buffer of {}",
                words.len(),
                dst.len()
            )));
        }
        dst[offset..end].copy_from_slice(words);
        Ok(())
    }

    fn read_buffer(&self, buffer: &DeviceBuffer, offset: usize, len: usize) -> Result<Vec<u32>> {
        self.wait_idle("read_buffer")?;
        let storage = lock(&self.shared.storage);
        let src = storage
            .buffers
            .get(&buffer.id)
            .ok_or_else(|| GemmError::device("read_buffer", "CL_INVALID_MEM_OBJECT"))?;
        src.get(offset..offset + len)
            .map(<[u32]>::to_vec)
            .ok_or_else(|| {
                GemmError::invariant(format!(
                    "read of {len} words at {offset} overruns buffer of {}",
                    src.len()
                ))
            })
    }

    fn release_buffer(&self, buffer: &DeviceBuffer) -> Result<()> {
        lock(&self.shared.storage)
            .buffers
            .remove(&buffer.id)
            .ok_or_else(|| GemmError::device("release_buffer", "CL_INVALID_MEM_OBJECT"))?;
        self.tracker.buffer_released();
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<DeviceImage> {
        if !self.info.image_support {
            return Err(GemmError::device("create_image", "CL_INVALID_OPERATION"));
        }
        if desc.width == 0
            || desc.height == 0
            || desc.width > self.info.image2d_max_width
            || desc.height > self.info.image2d_max_height
        {
            return Err(GemmError::device(
                "create_image",
                format!("CL_INVALID_IMAGE_SIZE ({}x{})", desc.width, desc.height),
            ));
        }
        let image = DeviceImage {
            id: self.tracker.next_id(),
            desc: *desc,
        };
        lock(&self.shared.storage)
            .images
            .insert(image.id, HostImage::new(*desc));
        self.tracker.image_created();
        Ok(image)
    }

    fn release_image(&self, image: &DeviceImage) -> Result<()> {
        lock(&self.shared.storage)
            .images
            .remove(&image.id)
            .ok_or_else(|| GemmError::device("release_image", "CL_INVALID_MEM_OBJECT"))?;
        self.tracker.image_released();
        Ok(())
    }

    fn enqueue_copy_buffer_to_image(
        &self,
        src: &DeviceBuffer,
        src_offset: usize,
        dst: &DeviceImage,
        region: [usize; 2],
        wait_list: &[Event],
    ) -> Result<Event> {
        if region.contains(&0) {
            return Err(GemmError::device(
                "enqueue_copy_buffer_to_image",
                "CL_INVALID_VALUE (empty region)",
            ));
        }
        let op = Op::Copy {
            src: src.clone(),
            src_offset,
            dst: dst.clone(),
            region,
        };
        Ok(self.submit(COPY_BUFFER_TO_IMAGE, op, wait_list))
    }

    fn enqueue_kernel(&self, launch: &KernelLaunch, wait_list: &[Event]) -> Result<Event> {
        let name = launch.kernel.name();
        let kernel = *self.programs.get(name).ok_or_else(|| {
            GemmError::device("enqueue_kernel", format!("CL_INVALID_KERNEL_NAME ({name})"))
        })?;
        if launch.global.is_empty() || launch.global.contains(&0) {
            return Err(GemmError::device(
                "enqueue_kernel",
                format!("CL_INVALID_GLOBAL_WORK_SIZE ({name}: {:?})", launch.global),
            ));
        }
        if let Some(local) = &launch.local {
            let divides = local.len() == launch.global.len()
                && local
                    .iter()
                    .zip(&launch.global)
                    .all(|(l, g)| *l > 0 && g % l == 0);
            if !divides {
                return Err(GemmError::device(
                    "enqueue_kernel",
                    format!(
                        "CL_INVALID_WORK_GROUP_SIZE ({name}: global {:?}, local {local:?})",
                        launch.global
                    ),
                ));
            }
        }
        let op = Op::Kernel {
            kernel,
            launch: launch.clone(),
        };
        Ok(self.submit(name, op, wait_list))
    }

    fn finish(&self) -> Result<()> {
        self.wait_idle("finish")?;
        let failures = std::mem::take(&mut lock(&self.shared.queue).failures);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(GemmError::device("finish", failures.join("; ")))
        }
    }

    fn stats(&self) -> DeviceStats {
        self.tracker.snapshot()
    }
}
