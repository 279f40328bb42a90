//! OpenCL implementation of [`ComputeDevice`] built on `opencl3`.
//!
//! Context creation and program compilation belong to the caller: the
//! device takes an existing context plus a [`ProgramSet`] holding one built
//! program per [`ProgramModule`]. Driver events are bridged to engine
//! [`Event`]s with a `CL_COMPLETE` callback, so completion is reported on
//! the driver's callback thread.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use opencl3::command_queue::{
    CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE, CommandQueue,
};
use opencl3::context::Context;
use opencl3::device::{CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_CPU, Device};
use opencl3::event::{CL_COMPLETE, Event as ClEvent};
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{
    Buffer, CL_FLOAT, CL_HALF_FLOAT, CL_MEM_OBJECT_IMAGE2D, CL_MEM_READ_WRITE, CL_R, CL_RGBA,
    CL_UNSIGNED_INT8, ClMem, Image,
};
use opencl3::program::Program;
use opencl3::types::{CL_BLOCKING, cl_event, cl_image_desc, cl_image_format, cl_int, cl_mem};
use tracing::{debug, trace, warn};

use crate::element::ElementKind;
use crate::error::{GemmError, Result};
use crate::event::{Event, EventId, EventStatus};
use crate::image::{DeviceImage, ImageChannelOrder, ImageChannelType, ImageDesc, ImageFormat};
use crate::kernels::ProgramModule;

use super::{
    COPY_BUFFER_TO_IMAGE, ComputeDevice, DeviceBuffer, DeviceClass, DeviceInfo, DeviceStats,
    KernelArg, KernelLaunch, ResourceTracker,
};

const WORD: usize = size_of::<u32>();

/// Built programs, one per module.
#[derive(Default)]
pub struct ProgramSet {
    programs: HashMap<ProgramModule, Program>,
}

impl ProgramSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, module: ProgramModule, program: Program) -> &mut Self {
        self.programs.insert(module, program);
        self
    }

    pub fn get(&self, module: ProgramModule) -> Option<&Program> {
        self.programs.get(&module)
    }

    /// Modules without a program.
    pub fn missing(&self) -> Vec<ProgramModule> {
        ProgramModule::ALL
            .into_iter()
            .filter(|m| !self.programs.contains_key(m))
            .collect()
    }
}

#[derive(Default)]
struct Objects {
    buffers: HashMap<u64, Buffer<u32>>,
    images: HashMap<u64, Image>,
    /// Driver events of commands that may still be referenced by a
    /// wait-list.
    events: HashMap<EventId, (Event, ClEvent)>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn cl_err(op: &'static str) -> impl Fn(opencl3::error_codes::ClError) -> GemmError {
    move |e| GemmError::device(op, e.to_string())
}

pub struct OpenClDevice {
    info: DeviceInfo,
    tracker: Arc<ResourceTracker>,
    context: Context,
    queue: CommandQueue,
    programs: ProgramSet,
    objects: Mutex<Objects>,
}

// SAFETY: OpenCL objects are reference-counted driver handles that the
// runtime allows to be used from any thread. Argument setting happens on a
// kernel object created per launch, and every map is behind a mutex.
unsafe impl Send for OpenClDevice {}
unsafe impl Sync for OpenClDevice {}

impl OpenClDevice {
    /// Wrap `device` inside `context`. An out-of-order queue is requested
    /// when `out_of_order` is set.
    pub fn new(context: Context, device: &Device, programs: ProgramSet, out_of_order: bool) -> Result<Self> {
        let missing = programs.missing();
        if !missing.is_empty() {
            return Err(GemmError::device("program lookup", format!("missing programs {missing:?}")));
        }
        let info = probe(device, out_of_order)?;
        let properties = if out_of_order {
            CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE
        } else {
            0
        };
        let queue = CommandQueue::create_default_with_properties(&context, properties, 0)
            .map_err(cl_err("create command queue"))?;
        debug!(name = %info.name, vendor = %info.vendor, out_of_order, "opencl device ready");
        Ok(Self {
            info,
            tracker: Arc::new(ResourceTracker::default()),
            context,
            queue,
            programs,
            objects: Mutex::new(Objects::default()),
        })
    }

    fn context(&self) -> &Context {
        &self.context
    }

    fn track(&self, label: &str, cl_event: ClEvent) -> Result<Event> {
        self.tracker.command_enqueued(label);
        let event = self.tracker.new_event(label);
        let user_data = Box::into_raw(Box::new(event.clone())).cast::<c_void>();
        if let Err(e) = cl_event.set_callback(CL_COMPLETE, on_complete, user_data) {
            // SAFETY: the callback was not registered, so ownership returns here.
            drop(unsafe { Box::from_raw(user_data.cast::<Event>()) });
            return Err(GemmError::device("set event callback", e.to_string()));
        }
        let mut objects = lock(&self.objects);
        objects.events.retain(|_, (ev, _)| !ev.is_finished());
        objects.events.insert(event.id(), (event.clone(), cl_event));
        Ok(event)
    }

    fn wait_handles(&self, objects: &Objects, wait_list: &[Event]) -> Result<Vec<cl_event>> {
        let mut handles = Vec::with_capacity(wait_list.len());
        for event in wait_list {
            match objects.events.get(&event.id()) {
                Some((_, cl_event)) => handles.push(cl_event.get()),
                None if event.is_finished() => {}
                None => {
                    return Err(GemmError::invariant(format!(
                        "event {} ({}) was not issued by this device",
                        event.id(),
                        event.label()
                    )));
                }
            }
        }
        Ok(handles)
    }
}

extern "C" fn on_complete(_event: cl_event, status: cl_int, user_data: *mut c_void) {
    // SAFETY: `user_data` is the boxed event registered in `track`, and the
    // driver invokes a `CL_COMPLETE` callback exactly once.
    let event = unsafe { Box::from_raw(user_data.cast::<Event>()) };
    if status < 0 {
        event.fail(status);
    } else {
        event.complete();
    }
}

fn probe(device: &Device, out_of_order: bool) -> Result<DeviceInfo> {
    let err = cl_err("query device info");
    let dev_type = device.dev_type().map_err(&err)?;
    let class = if dev_type & CL_DEVICE_TYPE_CPU != 0 {
        DeviceClass::Cpu
    } else if dev_type & CL_DEVICE_TYPE_ACCELERATOR != 0 {
        DeviceClass::Accelerator
    } else {
        DeviceClass::Gpu
    };
    let extensions = device.extensions().map_err(&err)?;
    Ok(DeviceInfo {
        name: device.name().map_err(&err)?,
        vendor: device.vendor().map_err(&err)?,
        class,
        image_support: device.image_support().map_err(&err)?,
        image2d_max_width: device.image2d_max_width().map_err(&err)?,
        image2d_max_height: device.image2d_max_height().map_err(&err)?,
        subgroups: extensions.contains("cl_intel_subgroups"),
        out_of_order_queue: out_of_order,
    })
}

fn cl_format(format: ImageFormat) -> cl_image_format {
    cl_image_format {
        image_channel_order: match format.channel_order {
            ImageChannelOrder::R => CL_R,
            ImageChannelOrder::Rgba => CL_RGBA,
        },
        image_channel_data_type: match format.channel_type {
            ImageChannelType::Float => CL_FLOAT,
            ImageChannelType::Half => CL_HALF_FLOAT,
            ImageChannelType::UnsignedInt8 => CL_UNSIGNED_INT8,
        },
    }
}

enum BoundArg {
    Mem(cl_mem),
    Int(i32),
    Float(f32),
    Half(u16),
    Local(usize),
}

impl ComputeDevice for OpenClDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn alloc_buffer(&self, kind: ElementKind, len: usize) -> Result<DeviceBuffer> {
        // SAFETY: no host pointer is passed.
        let buffer = unsafe {
            Buffer::<u32>::create(self.context(), CL_MEM_READ_WRITE, len, ptr::null_mut())
        }
        .map_err(cl_err("create buffer"))?;
        let id = self.tracker.next_id();
        lock(&self.objects).buffers.insert(id, buffer);
        self.tracker.buffer_allocated();
        Ok(DeviceBuffer { id, len, kind })
    }

    fn write_buffer(&self, buffer: &DeviceBuffer, offset: usize, words: &[u32]) -> Result<()> {
        let mut objects = lock(&self.objects);
        let target = objects
            .buffers
            .get_mut(&buffer.id)
            .ok_or_else(|| GemmError::device("write_buffer", "CL_INVALID_MEM_OBJECT"))?;
        // SAFETY: blocking write from a live slice.
        unsafe {
            self.queue
                .enqueue_write_buffer(target, CL_BLOCKING, offset * WORD, words, &[])
        }
        .map_err(cl_err("write_buffer"))?;
        Ok(())
    }

    fn read_buffer(&self, buffer: &DeviceBuffer, offset: usize, len: usize) -> Result<Vec<u32>> {
        let objects = lock(&self.objects);
        let source = objects
            .buffers
            .get(&buffer.id)
            .ok_or_else(|| GemmError::device("read_buffer", "CL_INVALID_MEM_OBJECT"))?;
        let mut words = vec![0u32; len];
        // SAFETY: blocking read into a live slice.
        unsafe {
            self.queue
                .enqueue_read_buffer(source, CL_BLOCKING, offset * WORD, &mut words, &[])
        }
        .map_err(cl_err("read_buffer"))?;
        Ok(words)
    }

    fn release_buffer(&self, buffer: &DeviceBuffer) -> Result<()> {
        lock(&self.objects)
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
        let format = cl_format(desc.format);
        let cl_desc = cl_image_desc {
            image_type: CL_MEM_OBJECT_IMAGE2D,
            image_width: desc.width,
            image_height: desc.height,
            image_depth: 0,
            image_array_size: 0,
            image_row_pitch: 0,
            image_slice_pitch: 0,
            num_mip_levels: 0,
            num_samples: 0,
            buffer: ptr::null_mut(),
        };
        // SAFETY: no host pointer is passed.
        let image = unsafe {
            Image::create(self.context(), CL_MEM_READ_WRITE, &format, &cl_desc, ptr::null_mut())
        }
        .map_err(cl_err("create_image"))?;
        let id = self.tracker.next_id();
        lock(&self.objects).images.insert(id, image);
        self.tracker.image_created();
        trace!(id, width = desc.width, height = desc.height, "opencl image created");
        Ok(DeviceImage { id, desc: *desc })
    }

    fn release_image(&self, image: &DeviceImage) -> Result<()> {
        lock(&self.objects)
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
        let cl_event = {
            let mut objects = lock(&self.objects);
            let waits = self.wait_handles(&objects, wait_list)?;
            let Objects {
                buffers, images, ..
            } = &mut *objects;
            let source = buffers
                .get(&src.id)
                .ok_or_else(|| GemmError::device(COPY_BUFFER_TO_IMAGE, "CL_INVALID_MEM_OBJECT"))?;
            let target = images
                .get_mut(&dst.id)
                .ok_or_else(|| GemmError::device(COPY_BUFFER_TO_IMAGE, "CL_INVALID_MEM_OBJECT"))?;
            let origin = [0usize; 3];
            let extent = [region[0], region[1], 1];
            // SAFETY: origin and extent outlive the call; handles are live.
            unsafe {
                self.queue.enqueue_copy_buffer_to_image(
                    source,
                    target,
                    src_offset * WORD,
                    origin.as_ptr(),
                    extent.as_ptr(),
                    &waits,
                )
            }
            .map_err(cl_err(COPY_BUFFER_TO_IMAGE))?
        };
        self.track(COPY_BUFFER_TO_IMAGE, cl_event)
    }

    fn enqueue_kernel(&self, launch: &KernelLaunch, wait_list: &[Event]) -> Result<Event> {
        let name = launch.kernel.name();
        let program = self
            .programs
            .get(launch.kernel.module())
            .ok_or_else(|| GemmError::device("enqueue_kernel", format!("no program for {}", launch.kernel)))?;
        let kernel = Kernel::create(program, name).map_err(cl_err("create kernel"))?;

        let cl_event = {
            let objects = lock(&self.objects);
            let waits = self.wait_handles(&objects, wait_list)?;
            let mut bound = Vec::with_capacity(launch.args.len());
            for arg in &launch.args {
                bound.push(match arg {
                    KernelArg::Buffer(b) => BoundArg::Mem(
                        objects
                            .buffers
                            .get(&b.id)
                            .ok_or_else(|| GemmError::device("enqueue_kernel", "CL_INVALID_MEM_OBJECT"))?
                            .get(),
                    ),
                    KernelArg::Image(i) => BoundArg::Mem(
                        objects
                            .images
                            .get(&i.id)
                            .ok_or_else(|| GemmError::device("enqueue_kernel", "CL_INVALID_MEM_OBJECT"))?
                            .get(),
                    ),
                    KernelArg::Int(v) => BoundArg::Int(*v),
                    KernelArg::Float(v) => BoundArg::Float(*v),
                    KernelArg::Half(v) => BoundArg::Half(*v),
                    KernelArg::Local(size) => BoundArg::Local(*size),
                });
            }

            let mut exec = ExecuteKernel::new(&kernel);
            // SAFETY: argument kinds follow the kernel signature and every
            // memory handle stays alive while the lock is held.
            unsafe {
                for arg in &bound {
                    match arg {
                        BoundArg::Mem(mem) => exec.set_arg(mem),
                        BoundArg::Int(v) => exec.set_arg(v),
                        BoundArg::Float(v) => exec.set_arg(v),
                        BoundArg::Half(v) => exec.set_arg(v),
                        BoundArg::Local(size) => exec.set_arg_local_buffer(*size),
                    };
                }
                exec.set_global_work_sizes(&launch.global);
                if let Some(local) = &launch.local {
                    exec.set_local_work_sizes(local);
                }
                exec.set_event_wait_list(&waits);
                exec.enqueue_nd_range(&self.queue)
            }
            .map_err(cl_err("enqueue_kernel"))?
        };
        trace!(kernel = name, global = ?launch.global, "opencl kernel enqueued");
        self.track(name, cl_event)
    }

    fn finish(&self) -> Result<()> {
        self.queue.finish().map_err(cl_err("finish"))?;
        let mut objects = lock(&self.objects);
        let failed: Vec<EventId> = objects
            .events
            .values()
            .filter(|(ev, _)| matches!(ev.status(), EventStatus::Error(_)))
            .map(|(ev, _)| ev.id())
            .collect();
        objects.events.clear();
        if !failed.is_empty() {
            warn!(?failed, "commands failed before finish");
            return Err(GemmError::device("finish", format!("{} command(s) failed", failed.len())));
        }
        Ok(())
    }

    fn stats(&self) -> DeviceStats {
        self.tracker.snapshot()
    }
}

impl Drop for OpenClDevice {
    fn drop(&mut self) {
        if let Err(e) = self.queue.finish() {
            warn!("opencl queue finish on drop failed: {e}");
        }
    }
}
