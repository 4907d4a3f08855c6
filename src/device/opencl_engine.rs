use super::{DeviceEngine, DeviceInfo, EngineArg, EngineKind, Migration};
use crate::{
    buffer::{Access, RawHostSlice},
    result::Result,
};
use opencl3::{
    command_queue::CommandQueue,
    context::Context,
    device::{get_all_devices, Device, CL_DEVICE_TYPE_ACCELERATOR},
    error_codes::ClError,
    event::Event as ClEvent,
    kernel::Kernel as ClKernel,
    memory::{
        Buffer, ClMem, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_USE_HOST_PTR,
        CL_MEM_WRITE_ONLY,
    },
    program::Program as ClProgram,
    types::{cl_mem, cl_uint},
};
use std::{ffi::c_void, ptr, sync::Arc};

// CL_MIGRATE_MEM_OBJECT_HOST
const MIGRATE_MEM_OBJECT_HOST: u64 = 1 << 0;
// CL_INVALID_KERNEL_NAME
const INVALID_KERNEL_NAME: i32 = -46;
// CL_DEVICE_NOT_FOUND
const DEVICE_NOT_FOUND: i32 = -1;
// CL_PLATFORM_NOT_FOUND_KHR
const PLATFORM_NOT_FOUND_KHR: i32 = -1001;

pub(crate) type Program = ClProgram;
pub(crate) type Kernel = ClKernel;
pub(crate) type Event = ClEvent;

#[derive(Clone)]
pub(crate) struct RawDevice {
    device: Device,
    info: Arc<DeviceInfo>,
}

impl RawDevice {
    pub(crate) fn info(&self) -> &Arc<DeviceInfo> {
        &self.info
    }
}

/// Accelerator devices of all platforms, in platform order.
pub(crate) fn devices() -> Result<Vec<RawDevice>> {
    let ids = found_or_empty(get_all_devices(CL_DEVICE_TYPE_ACCELERATOR))?;
    ids.into_iter()
        .enumerate()
        .map(|(index, id)| {
            let device = Device::new(id);
            let name = device.name()?;
            tracing::debug!(index, name = %name, "found accelerator");
            let info = Arc::new(DeviceInfo {
                index,
                name,
                engine: EngineKind::OpenCl,
            });
            Ok(RawDevice { device, info })
        })
        .collect()
}

/// No platform or no device is an empty list, other errors are returned.
fn found_or_empty<T>(result: Result<Vec<T>, ClError>) -> Result<Vec<T>> {
    match result {
        Ok(found) => Ok(found),
        Err(ClError(DEVICE_NOT_FOUND | PLATFORM_NOT_FOUND_KHR)) => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) struct Engine {
    // released before the context
    queue: CommandQueue,
    context: Context,
}

pub(crate) struct DeviceBuffer {
    buffer: Buffer<cl_uint>,
}

impl DeviceEngine for Engine {
    type RawDevice = RawDevice;
    type DeviceBuffer = DeviceBuffer;
    type Program = Program;
    type Kernel = Kernel;
    type Event = Event;
    fn new(device: &RawDevice) -> Result<Arc<Self>> {
        let context = Context::from_device(&device.device)?;
        // OpenCL 1.2 queue creation, XRT does not require the 2.0 properties API
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&context, 0)?;
        Ok(Arc::new(Self { queue, context }))
    }
    unsafe fn buffer(&self, host: RawHostSlice, access: Access) -> Result<DeviceBuffer> {
        let flags = match access {
            Access::ReadOnly => CL_MEM_READ_ONLY,
            Access::WriteOnly => CL_MEM_WRITE_ONLY,
            Access::ReadWrite => CL_MEM_READ_WRITE,
        } | CL_MEM_USE_HOST_PTR;
        #[allow(unused_unsafe)]
        let buffer = unsafe {
            Buffer::<cl_uint>::create(&self.context, flags, host.len, host.ptr as *mut c_void)?
        };
        Ok(DeviceBuffer { buffer })
    }
    fn program(&self, binary: &[u8]) -> Result<Program> {
        #[allow(unused_unsafe)]
        let program = unsafe { ClProgram::create_and_build_from_binary(&self.context, &[binary], "") }
            .map_err(anyhow::Error::msg)?;
        Ok(program)
    }
    fn kernel(program: &Program, name: &str) -> Result<Option<Kernel>> {
        match ClKernel::create(program, name) {
            Ok(kernel) => Ok(Some(kernel)),
            Err(e) if e.0 == INVALID_KERNEL_NAME => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
    fn num_args(kernel: &Kernel) -> Result<u32> {
        Ok(kernel.num_args()?)
    }
    unsafe fn set_arg(kernel: &mut Kernel, index: u32, arg: EngineArg<DeviceBuffer>) -> Result<()> {
        match arg {
            EngineArg::Buffer(buffer) => {
                let mem: cl_mem = buffer.buffer.get();
                unsafe { kernel.set_arg(index, &mem)? };
            }
            EngineArg::U32(value) => {
                let value: cl_uint = value;
                unsafe { kernel.set_arg(index, &value)? };
            }
        }
        Ok(())
    }
    fn migrate(&self, buffers: &[&DeviceBuffer], migration: Migration) -> Result<Event> {
        let mems: Vec<cl_mem> = buffers.iter().map(|x| x.buffer.get()).collect();
        let flags = match migration {
            Migration::ToDevice => 0,
            Migration::ToHost => MIGRATE_MEM_OBJECT_HOST,
        };
        let event = unsafe {
            self.queue.enqueue_migrate_mem_object(
                mems.len() as cl_uint,
                mems.as_ptr(),
                flags,
                &[],
            )?
        };
        Ok(event)
    }
    fn enqueue_task(&self, kernel: &Kernel) -> Result<Event> {
        // clEnqueueTask is a one work item NDRange
        let work_size: [usize; 1] = [1];
        let event = unsafe {
            self.queue.enqueue_nd_range_kernel(
                kernel.get(),
                1,
                ptr::null(),
                work_size.as_ptr(),
                work_size.as_ptr(),
                &[],
            )?
        };
        Ok(event)
    }
    fn wait(event: Event) -> Result<()> {
        Ok(event.wait()?)
    }
    fn finish(&self) -> Result<()> {
        Ok(self.queue.finish()?)
    }
}
