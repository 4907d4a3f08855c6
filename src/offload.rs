/*!
Offloads `c = a + b` to the device.

[`run`] wraps the host regions as host-backed device buffers, binds them to the kernel and then
migrates the inputs, runs the kernel as a single task and migrates the output back, waiting on
each step before the next. The queue is drained before returning, after which the output region
holds the device result.

A failure of any step is a [`DeviceExecutionError`](error::DeviceExecutionError) naming the
step.
*/

use crate::{
    buffer::{
        error::{BufferLengthMismatch, EmptyDeviceBuffer},
        DeviceBuffer,
    },
    device::{Context, Migration},
    kernel::Kernel,
    result::Result,
    timer::PhaseTimer,
};

/// Errors.
pub mod error {
    use std::error::Error;

    /// A step of the offload.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
    pub enum OffloadStep {
        /// Wrapping host regions as device buffers.
        #[display(fmt = "wrap host buffers")]
        WrapBuffers,
        /// Binding kernel arguments.
        #[display(fmt = "bind kernel arguments")]
        BindArguments,
        /// Migrating the inputs to the device.
        #[display(fmt = "migrate inputs to the device")]
        MigrateInputs,
        /// Enqueuing the kernel.
        #[display(fmt = "enqueue the kernel task")]
        EnqueueTask,
        /// Waiting for the kernel.
        #[display(fmt = "wait for the kernel to complete")]
        WaitTask,
        /// Migrating the output to the host.
        #[display(fmt = "migrate the output to the host")]
        MigrateOutput,
        /// Draining the queue.
        #[display(fmt = "finish the command queue")]
        Finish,
    }

    /// An offload step failed.
    #[derive(Debug, thiserror::Error)]
    #[error("DeviceExecutionError: failed to {step}")]
    pub struct DeviceExecutionError {
        pub(super) step: OffloadStep,
        #[source]
        pub(super) source: Box<dyn Error + Send + Sync + 'static>,
    }

    impl DeviceExecutionError {
        /// The step that failed.
        pub fn step(&self) -> OffloadStep {
            self.step
        }
    }
}
use error::*;

fn failed(step: OffloadStep) -> impl FnOnce(anyhow::Error) -> anyhow::Error {
    move |source| {
        tracing::debug!(%step, "offload step failed: {source:#}");
        DeviceExecutionError {
            step,
            source: source.into(),
        }
        .into()
    }
}

/** Computes `c = a + b` on the device.

`a`, `b` and `c` are used in place, the device is not given its own copies. Phases are recorded
in `timer`.

**errors**
- [`BufferLengthMismatch`](crate::buffer::error::BufferLengthMismatch) if the lengths differ.
- [`EmptyDeviceBuffer`](crate::buffer::error::EmptyDeviceBuffer) if the buffers are empty.
- [`DeviceExecutionError`](error::DeviceExecutionError)
*/
pub fn run(
    context: &Context,
    kernel: &mut Kernel,
    a: &[u32],
    b: &[u32],
    c: &mut [u32],
    timer: &mut PhaseTimer,
) -> Result<()> {
    let len = a.len();
    for found in [b.len(), c.len()] {
        if found != len {
            return Err(BufferLengthMismatch {
                expected: len,
                found,
            }
            .into());
        }
    }
    if len == 0 {
        return Err(EmptyDeviceBuffer.into());
    }
    let size = u32::try_from(len)?;

    timer.begin("Map host buffers to OpenCL buffers");
    let wrap = OffloadStep::WrapBuffers;
    let a = DeviceBuffer::read_only(context, a).map_err(failed(wrap))?;
    let b = DeviceBuffer::read_only(context, b).map_err(failed(wrap))?;
    let c = DeviceBuffer::write_only(context, c).map_err(failed(wrap))?;

    timer.begin("Set kernel arguments");
    let bind = OffloadStep::BindArguments;
    let kernel = kernel
        .bind()
        .buffer(0, &a)
        .and_then(|args| args.buffer(1, &b))
        .and_then(|args| args.buffer(2, &c))
        .and_then(|args| args.u32(3, size))
        .and_then(|args| args.finish())
        .map_err(failed(bind))?;

    timer.begin("Memory object migration enqueue");
    context
        .migrate(&[&a, &b], Migration::ToDevice)
        .and_then(|event| event.wait())
        .map_err(failed(OffloadStep::MigrateInputs))?;

    timer.begin("OCL Enqueue task");
    let event = context
        .enqueue_task(&kernel)
        .map_err(failed(OffloadStep::EnqueueTask))?;

    timer.begin("Wait for kernel to complete");
    event.wait().map_err(failed(OffloadStep::WaitTask))?;

    timer.begin("Read back computation results");
    context
        .migrate(&[&c], Migration::ToHost)
        .and_then(|event| event.wait())
        .map_err(failed(OffloadStep::MigrateOutput))?;
    context.finish().map_err(failed(OffloadStep::Finish))?;
    timer.finish();
    tracing::info!(len, "offload complete");
    Ok(())
}
