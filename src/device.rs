/*!

A [`Device`] identifies one accelerator. A [`Context`] binds a device to a single command queue,
every transfer and kernel launch of a run is issued through it.

Two engines are available:
- OpenCL (the "device" feature), which enumerates accelerator devices and loads precompiled
images.
- Emulated, a software accelerator with its own device memory, used when no hardware is
present (`--emulate`, or `XCL_EMULATION_MODE` is set) and for tests. It can inject [faults](Fault).

Selecting the first emulated device and creating a context:
```
# use vadd_offload::{anyhow::Result, device::{Context, Device}};
# fn main() -> Result<()> {
let device = Device::builder().emulated(true).build()?;
dbg!(device.info());
let context = Context::new(&device)?;
context.finish()?;
# Ok(())
# }
```

# Completion
Enqueue operations return an [`Event`]. Nothing is pipelined, callers wait on each event before
issuing the next operation.
*/

use crate::{
    buffer::{Access, DeviceBuffer, RawHostSlice},
    kernel::BoundKernel,
    result::Result,
};
use std::{
    fmt::{self, Debug, Display},
    sync::Arc,
};

mod emulated_engine;
#[cfg(feature = "device")]
mod opencl_engine;

/// Errors.
pub mod error {
    use super::{EngineKind, Fault};

    /// No device was found.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("NoDeviceFound: no {engine} device is available")]
    pub struct NoDeviceFound {
        pub(super) engine: EngineKind,
    }

    impl NoDeviceFound {
        /// The engine that was searched.
        pub fn engine(&self) -> EngineKind {
            self.engine
        }
    }

    /** Device is unavailable.

    The "device" feature is not enabled, only the emulated engine can be used.
    */
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("DeviceUnavailable: built without the \"device\" feature")]
    pub struct DeviceUnavailable;

    /// Objects from different engines were combined.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("EngineMismatch: object belongs to a different engine")]
    pub struct EngineMismatch;

    /// An operation failed because of an injected [`Fault`].
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("InjectedFault: {0:?}")]
    pub struct InjectedFault(pub(super) Fault);

    impl InjectedFault {
        /// The fault.
        pub fn fault(&self) -> Fault {
            self.0
        }
    }
}
use error::*;

/// Builders.
pub mod builder {
    use super::*;

    /// Builder for selecting a [`Device`].
    #[derive(Clone, Debug)]
    pub struct DeviceBuilder {
        pub(super) options: DeviceOptions,
    }

    impl DeviceBuilder {
        /// Use the emulated engine, defaults to false.
        pub fn emulated(self, emulated: bool) -> Self {
            let mut this = self;
            this.options.engine = if emulated {
                EngineKind::Emulated
            } else {
                EngineKind::OpenCl
            };
            this
        }
        /// Injects `fault` into the emulated engine.
        ///
        /// Ignored by other engines.
        pub fn fault(self, fault: Fault) -> Self {
            let mut this = self;
            this.options.fault.replace(fault);
            this
        }
        /// Selects the first device.
        ///
        /// **errors**
        ///
        /// - [`NoDeviceFound`](super::error::NoDeviceFound)
        /// - [`DeviceUnavailable`](super::error::DeviceUnavailable)
        /// - Devices could not be enumerated.
        pub fn build(self) -> Result<Device> {
            let engine = self.options.engine;
            let device = Device::list_with(&self.options)?
                .into_iter()
                .next()
                .ok_or(NoDeviceFound { engine })?;
            tracing::info!(device = %device.info(), "selected device");
            Ok(device)
        }
    }
}
use builder::*;

#[derive(Clone, Debug)]
pub(crate) struct DeviceOptions {
    engine: EngineKind,
    fault: Option<Fault>,
}

/// Engines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineKind {
    /// The software accelerator.
    Emulated,
    /// OpenCL accelerator devices.
    OpenCl,
}

impl Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Emulated => f.write_str("emulated"),
            Self::OpenCl => f.write_str("OpenCL accelerator"),
        }
    }
}

/** Faults the emulated engine can inject.

Operations that fail return an [`InjectedFault`](error::InjectedFault).
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// No devices are found.
    NoDevices,
    /// The kernel leaves `index` of its output unmodified.
    StuckOutput {
        /// The output index.
        index: usize,
    },
    /// Enqueuing a migration to the device fails.
    MigrateToDevice,
    /// Enqueuing a migration to the host fails.
    MigrateToHost,
    /// Enqueuing the kernel fails.
    EnqueueTask,
    /// The kernel completes with an error.
    TaskCompletion,
    /// Draining the queue fails.
    Finish,
}

/// Direction of a migration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Migration {
    /// Host to device.
    ToDevice,
    /// Device to host.
    ToHost,
}

trait DeviceEngine: Sized {
    type RawDevice;
    type DeviceBuffer;
    type Program;
    type Kernel;
    type Event;
    fn new(device: &Self::RawDevice) -> Result<Arc<Self>>;
    /// # Safety
    /// `host` must remain borrowed, as `access` requires, for the life of the buffer.
    unsafe fn buffer(&self, host: RawHostSlice, access: Access) -> Result<Self::DeviceBuffer>;
    fn program(&self, binary: &[u8]) -> Result<Self::Program>;
    /// Returns None if there is no kernel `name`.
    fn kernel(program: &Self::Program, name: &str) -> Result<Option<Self::Kernel>>;
    fn num_args(kernel: &Self::Kernel) -> Result<u32>;
    /// # Safety
    /// Buffer arguments must outlive any enqueue of the kernel.
    unsafe fn set_arg(
        kernel: &mut Self::Kernel,
        index: u32,
        arg: EngineArg<Self::DeviceBuffer>,
    ) -> Result<()>;
    fn migrate(&self, buffers: &[&Self::DeviceBuffer], migration: Migration) -> Result<Self::Event>;
    fn enqueue_task(&self, kernel: &Self::Kernel) -> Result<Self::Event>;
    fn wait(event: Self::Event) -> Result<()>;
    fn finish(&self) -> Result<()>;
}

pub(crate) enum EngineArg<'a, B> {
    Buffer(&'a B),
    U32(u32),
}

/** A device.

Devices can be cloned, clones refer to the same device.
*/
#[derive(Clone)]
pub struct Device {
    inner: DeviceInner,
}

impl Device {
    /// A builder for selecting a device.
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder {
            options: DeviceOptions {
                engine: EngineKind::OpenCl,
                fault: None,
            },
        }
    }
    /** Lists the devices of `engine`.

    **errors**
    - [`DeviceUnavailable`](error::DeviceUnavailable) if OpenCL is requested without the "device"
    feature.
    - Devices could not be queried.
    */
    pub fn list(engine: EngineKind) -> Result<Vec<Self>> {
        let options = Self::builder()
            .emulated(engine == EngineKind::Emulated)
            .options;
        Self::list_with(&options)
    }
    fn list_with(options: &DeviceOptions) -> Result<Vec<Self>> {
        match options.engine {
            EngineKind::Emulated => Ok(emulated_engine::devices(options.fault)
                .into_iter()
                .map(|raw| Self {
                    inner: DeviceInner::Emulated(raw),
                })
                .collect()),
            #[cfg(feature = "device")]
            EngineKind::OpenCl => Ok(opencl_engine::devices()?
                .into_iter()
                .map(|raw| Self {
                    inner: DeviceInner::OpenCl(raw),
                })
                .collect()),
            #[cfg(not(feature = "device"))]
            EngineKind::OpenCl => Err(DeviceUnavailable.into()),
        }
    }
    /// Device info.
    pub fn info(&self) -> &Arc<DeviceInfo> {
        match &self.inner {
            DeviceInner::Emulated(raw) => raw.info(),
            #[cfg(feature = "device")]
            DeviceInner::OpenCl(raw) => raw.info(),
        }
    }
    /// The device name.
    pub fn name(&self) -> &str {
        self.info().name()
    }
    /// Is emulated.
    pub fn is_emulated(&self) -> bool {
        matches!(self.inner, DeviceInner::Emulated(_))
    }
}

/// Prints `Device(engine:index, name)`.
impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info();
        write!(f, "Device({:?}:{}, {:?})", info.engine, info.index, info.name)
    }
}

#[derive(Clone)]
enum DeviceInner {
    Emulated(emulated_engine::RawDevice),
    #[cfg(feature = "device")]
    OpenCl(opencl_engine::RawDevice),
}

/// Device info.
#[derive(Debug)]
pub struct DeviceInfo {
    index: usize,
    name: String,
    engine: EngineKind,
}

impl DeviceInfo {
    /// The index in the device list.
    pub fn index(&self) -> usize {
        self.index
    }
    /// The device name, used to resolve kernel images.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The engine.
    pub fn engine(&self) -> EngineKind {
        self.engine
    }
}

impl Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({} device {})", self.name, self.engine, self.index)
    }
}

/** An execution context with one command queue.

Created once per run, the queue is drained on [`finish`](Context::finish) and when dropped.
*/
pub struct Context {
    device: Device,
    inner: ContextInner,
}

enum ContextInner {
    Emulated(Arc<emulated_engine::Engine>),
    #[cfg(feature = "device")]
    OpenCl(Arc<opencl_engine::Engine>),
}

impl Context {
    /// Creates a context and command queue for `device`.
    ///
    /// **errors**
    /// The context or queue could not be created.
    pub fn new(device: &Device) -> Result<Self> {
        let inner = match &device.inner {
            DeviceInner::Emulated(raw) => {
                ContextInner::Emulated(<emulated_engine::Engine as DeviceEngine>::new(raw)?)
            }
            #[cfg(feature = "device")]
            DeviceInner::OpenCl(raw) => {
                ContextInner::OpenCl(<opencl_engine::Engine as DeviceEngine>::new(raw)?)
            }
        };
        tracing::debug!(device = ?device, "created context");
        Ok(Self {
            device: device.clone(),
            inner,
        })
    }
    /// The device.
    pub fn device(&self) -> &Device {
        &self.device
    }
    /** Migrates `buffers` to the device or back to the host.

    Returns once the migration is enqueued, [wait](Event::wait) on the event for completion.

    **errors**
    - The migration could not be enqueued.
    */
    pub fn migrate(&self, buffers: &[&DeviceBuffer], migration: Migration) -> Result<Event> {
        let inner = match &self.inner {
            ContextInner::Emulated(engine) => {
                let buffers = buffers
                    .iter()
                    .map(|buffer| match buffer.raw() {
                        RawBuffer::Emulated(raw) => Ok::<_, EngineMismatch>(raw),
                        #[cfg(feature = "device")]
                        _ => Err(EngineMismatch),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                EventInner::Emulated(engine.migrate(&buffers, migration)?)
            }
            #[cfg(feature = "device")]
            ContextInner::OpenCl(engine) => {
                let buffers = buffers
                    .iter()
                    .map(|buffer| match buffer.raw() {
                        RawBuffer::OpenCl(raw) => Ok::<_, EngineMismatch>(raw),
                        _ => Err(EngineMismatch),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                EventInner::OpenCl(engine.migrate(&buffers, migration)?)
            }
        };
        tracing::trace!(?migration, buffers = buffers.len(), "enqueued migration");
        Ok(Event { inner })
    }
    /** Enqueues `kernel` as a single task.

    **errors**
    - The kernel could not be enqueued.
    */
    pub fn enqueue_task(&self, kernel: &BoundKernel) -> Result<Event> {
        let inner = match (&self.inner, kernel.raw()) {
            (ContextInner::Emulated(engine), RawKernel::Emulated(raw)) => {
                EventInner::Emulated(engine.enqueue_task(raw)?)
            }
            #[cfg(feature = "device")]
            (ContextInner::OpenCl(engine), RawKernel::OpenCl(raw)) => {
                EventInner::OpenCl(engine.enqueue_task(raw)?)
            }
            #[cfg(feature = "device")]
            _ => return Err(EngineMismatch.into()),
        };
        tracing::trace!(kernel = kernel.name(), "enqueued task");
        Ok(Event { inner })
    }
    /** Blocks until all enqueued work has retired.

    **errors**
    - The queue reported an error.
    */
    pub fn finish(&self) -> Result<()> {
        match &self.inner {
            ContextInner::Emulated(engine) => engine.finish(),
            #[cfg(feature = "device")]
            ContextInner::OpenCl(engine) => engine.finish(),
        }
    }
    pub(crate) unsafe fn raw_buffer(&self, host: RawHostSlice, access: Access) -> Result<RawBuffer> {
        match &self.inner {
            ContextInner::Emulated(engine) => {
                Ok(RawBuffer::Emulated(unsafe { engine.buffer(host, access)? }))
            }
            #[cfg(feature = "device")]
            ContextInner::OpenCl(engine) => {
                Ok(RawBuffer::OpenCl(unsafe { engine.buffer(host, access)? }))
            }
        }
    }
    pub(crate) fn raw_program(&self, binary: &[u8]) -> Result<RawProgram> {
        match &self.inner {
            ContextInner::Emulated(engine) => Ok(RawProgram::Emulated(engine.program(binary)?)),
            #[cfg(feature = "device")]
            ContextInner::OpenCl(engine) => Ok(RawProgram::OpenCl(engine.program(binary)?)),
        }
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.device)
            .finish()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::warn!("failed to drain queue: {e:#}");
        }
    }
}

/// A completion signal.
#[must_use = "wait on the event before using the buffers it references"]
pub struct Event {
    inner: EventInner,
}

enum EventInner {
    Emulated(emulated_engine::Event),
    #[cfg(feature = "device")]
    OpenCl(opencl_engine::Event),
}

impl Event {
    /** Blocks until the operation completes.

    There is no timeout.

    **errors**
    - The operation completed with an error.
    */
    pub fn wait(self) -> Result<()> {
        match self.inner {
            EventInner::Emulated(event) => emulated_engine::Engine::wait(event),
            #[cfg(feature = "device")]
            EventInner::OpenCl(event) => opencl_engine::Engine::wait(event),
        }
    }
}

impl Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").finish_non_exhaustive()
    }
}

pub(crate) enum RawBuffer {
    Emulated(emulated_engine::DeviceBuffer),
    #[cfg(feature = "device")]
    OpenCl(opencl_engine::DeviceBuffer),
}

pub(crate) enum RawProgram {
    Emulated(emulated_engine::Program),
    #[cfg(feature = "device")]
    OpenCl(opencl_engine::Program),
}

impl RawProgram {
    pub(crate) fn kernel(&self, name: &str) -> Result<Option<RawKernel>> {
        match self {
            Self::Emulated(program) => Ok(
                <emulated_engine::Engine as DeviceEngine>::kernel(program, name)?
                    .map(RawKernel::Emulated),
            ),
            #[cfg(feature = "device")]
            Self::OpenCl(program) => Ok(
                <opencl_engine::Engine as DeviceEngine>::kernel(program, name)?
                    .map(RawKernel::OpenCl),
            ),
        }
    }
}

pub(crate) enum RawKernel {
    Emulated(emulated_engine::Kernel),
    #[cfg(feature = "device")]
    OpenCl(opencl_engine::Kernel),
}

pub(crate) enum RawArg<'a> {
    Buffer(&'a RawBuffer),
    U32(u32),
}

impl RawKernel {
    pub(crate) fn num_args(&self) -> Result<u32> {
        match self {
            Self::Emulated(kernel) => emulated_engine::Engine::num_args(kernel),
            #[cfg(feature = "device")]
            Self::OpenCl(kernel) => opencl_engine::Engine::num_args(kernel),
        }
    }
    /// # Safety
    /// See [`DeviceEngine::set_arg`].
    pub(crate) unsafe fn set_arg(&mut self, index: u32, arg: RawArg) -> Result<()> {
        match (self, arg) {
            (Self::Emulated(kernel), RawArg::Buffer(RawBuffer::Emulated(buffer))) => unsafe {
                emulated_engine::Engine::set_arg(kernel, index, EngineArg::Buffer(buffer))
            },
            (Self::Emulated(kernel), RawArg::U32(value)) => unsafe {
                emulated_engine::Engine::set_arg(kernel, index, EngineArg::U32(value))
            },
            #[cfg(feature = "device")]
            (Self::OpenCl(kernel), RawArg::Buffer(RawBuffer::OpenCl(buffer))) => unsafe {
                opencl_engine::Engine::set_arg(kernel, index, EngineArg::Buffer(buffer))
            },
            #[cfg(feature = "device")]
            (Self::OpenCl(kernel), RawArg::U32(value)) => unsafe {
                opencl_engine::Engine::set_arg(kernel, index, EngineArg::U32(value))
            },
            #[cfg(feature = "device")]
            _ => Err(EngineMismatch.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulated_first_device() {
        let device = Device::builder().emulated(true).build().unwrap();
        assert!(device.is_emulated());
        assert_eq!(device.info().index(), 0);
        assert_eq!(device.info().engine(), EngineKind::Emulated);
        assert_eq!(Device::list(EngineKind::Emulated).unwrap().len(), 1);
    }

    #[test]
    fn no_device_found() {
        let error = Device::builder()
            .emulated(true)
            .fault(Fault::NoDevices)
            .build()
            .unwrap_err();
        let error = error.downcast_ref::<NoDeviceFound>().unwrap();
        assert_eq!(error.engine(), EngineKind::Emulated);
    }

    #[cfg(not(feature = "device"))]
    #[test]
    fn opencl_unavailable() {
        let error = Device::builder().build().unwrap_err();
        assert!(error.is::<DeviceUnavailable>());
    }

    #[test]
    fn context_finish() {
        let device = Device::builder().emulated(true).build().unwrap();
        let context = Context::new(&device).unwrap();
        context.finish().unwrap();
        assert!(context.device().is_emulated());
    }

    #[test]
    fn injected_finish_fault() {
        let device = Device::builder()
            .emulated(true)
            .fault(Fault::Finish)
            .build()
            .unwrap();
        let context = Context::new(&device).unwrap();
        let error = context.finish().unwrap_err();
        assert_eq!(
            error.downcast_ref::<InjectedFault>().unwrap().fault(),
            Fault::Finish
        );
    }
}
