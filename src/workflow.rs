/*!
The whole vector add run.

[`Workflow::run`] selects the device and loads the kernel, prepares the host buffers and the
reference result, offloads the sum and verifies it, writing a report of the run and the time
spent in each phase.

```
# use vadd_offload::{config::Config, device::{Device, Fault}, workflow::Workflow};
# fn main() -> vadd_offload::anyhow::Result<()> {
# let dir = tempfile::tempdir()?;
# let xclbin = dir.path().join("vadd.xclbin");
# std::fs::write(&xclbin, b"xclbin")?;
let config = Config {
    elements: 8,
    ..Config::new(xclbin)
};
let mut out = Vec::new();
let outcome = Workflow::new(config)
    .device(Device::builder().emulated(true).fault(Fault::StuckOutput { index: 3 }))
    .run(&mut out)?;
assert_eq!(outcome.mismatch().map(|x| x.index), Some(3));
# Ok(())
# }
```
*/

use crate::{
    buffer::{error::OutOfMemory, HostBuffers},
    config::{Config, MismatchPolicy},
    device::{
        builder::DeviceBuilder,
        error::{DeviceUnavailable, NoDeviceFound},
        Context, Device,
    },
    kernel::{
        error::{ImageLoadError, KernelNotFound},
        KernelImage, Program,
    },
    offload::{self, error::DeviceExecutionError},
    result::Result,
    timer::{PhaseReport, PhaseTimer},
    verify::{vadd_host, verify, Mismatch},
};
use std::{error::Error, io::Write, process::ExitCode};

/// The entry point of the kernel.
pub const KERNEL_NAME: &str = "vadd";

/// Categories of fatal errors of a run.
///
/// Usage errors are reported by [`Config::from_args`] before a run starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum ErrorKind {
    /// No device could be selected.
    #[display(fmt = "no device found")]
    NoDeviceFound,
    /// The kernel image could not be loaded or lacks the kernel.
    #[display(fmt = "image load error")]
    ImageLoad,
    /// Host memory could not be allocated.
    #[display(fmt = "out of memory")]
    OutOfMemory,
    /// An offload step failed.
    #[display(fmt = "device execution error")]
    DeviceExecution,
    /// Anything else.
    #[display(fmt = "error")]
    Other,
}

impl ErrorKind {
    /// Classifies `error` by the first categorized error in its chain.
    pub fn of(error: &anyhow::Error) -> Self {
        error
            .chain()
            .find_map(Self::of_source)
            .unwrap_or(Self::Other)
    }
    fn of_source(error: &(dyn Error + 'static)) -> Option<Self> {
        if error.is::<NoDeviceFound>() || error.is::<DeviceUnavailable>() {
            Some(Self::NoDeviceFound)
        } else if error.is::<ImageLoadError>() || error.is::<KernelNotFound>() {
            Some(Self::ImageLoad)
        } else if error.is::<OutOfMemory>() {
            Some(Self::OutOfMemory)
        } else if error.is::<DeviceExecutionError>() {
            Some(Self::DeviceExecution)
        } else {
            None
        }
    }
}

/// The result of a completed run.
#[derive(Debug)]
pub struct Outcome {
    mismatch: Option<Mismatch>,
    phases: PhaseReport,
}

impl Outcome {
    /// The first mismatch, if any.
    pub fn mismatch(&self) -> Option<&Mismatch> {
        self.mismatch.as_ref()
    }
    /// The device result matched the reference.
    pub fn verified(&self) -> bool {
        self.mismatch.is_none()
    }
    /// The timed phases.
    pub fn phases(&self) -> &PhaseReport {
        &self.phases
    }
    /// Whether the run succeeded under `policy`.
    pub fn succeeded(&self, policy: MismatchPolicy) -> bool {
        match policy {
            MismatchPolicy::Report => true,
            MismatchPolicy::Fail => self.verified(),
        }
    }
    /// The exit status under `policy`.
    pub fn exit_code(&self, policy: MismatchPolicy) -> ExitCode {
        if self.succeeded(policy) {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

/// A configured run.
#[derive(Debug)]
pub struct Workflow {
    config: Config,
    device: DeviceBuilder,
}

impl Workflow {
    /// A run of `config`.
    pub fn new(config: Config) -> Self {
        let device = Device::builder().emulated(config.emulation());
        Self { config, device }
    }
    /// Selects the device with `device` instead.
    pub fn device(self, device: DeviceBuilder) -> Self {
        Self { device, ..self }
    }
    /** Runs the workflow, writing the report to `out`.

    A mismatch is not an error, it is reported and returned in the [`Outcome`].

    **errors**
    - Categorized by [`ErrorKind::of`].
    - Writing to `out` failed.
    */
    pub fn run(self, out: &mut impl Write) -> Result<Outcome> {
        let Self { config, device } = self;
        let mut timer = PhaseTimer::new();

        writeln!(out, "-- Vector Add with host allocated buffers --")?;
        writeln!(out)?;
        writeln!(out, "Loading XCLBin to program the device:")?;
        writeln!(out)?;
        timer.begin("OpenCL Initialization");
        let device = device.build()?;
        let context = Context::new(&device)?;
        let image = KernelImage::for_device(&device, &config.xclbin)?;
        let program = Program::new(&context, &image)?;
        let mut kernel = program.kernel(KERNEL_NAME)?;
        timer.finish();

        writeln!(out, "Running kernel test with host allocated buffers")?;
        tracing::info!(elements = config.elements, "running kernel test");
        timer.begin("Allocating memory buffer");
        let mut buffers = HostBuffers::alloc(config.elements)?;
        timer.finish();

        timer.begin("Populating buffer inputs");
        buffers.populate();
        timer.finish();

        timer.begin("Software VADD run");
        vadd_host(&buffers.a, &buffers.b, &mut buffers.reference_result);
        timer.finish();

        offload::run(
            &context,
            &mut kernel,
            &buffers.a,
            &buffers.b,
            &mut buffers.device_result,
            &mut timer,
        )?;

        let mismatch = verify(&buffers.device_result, &buffers.reference_result).err();
        if let Some(mismatch) = mismatch.as_ref() {
            writeln!(out, "ERROR: {mismatch}")?;
        }
        let status = if mismatch.is_none() {
            ""
        } else {
            " (with errors)"
        };
        writeln!(out)?;
        writeln!(out, "Vector add example complete!{status}")?;
        writeln!(out)?;
        writeln!(out, "--------------- Key execution times ---------------")?;
        let phases = timer.report();
        write!(out, "{phases}")?;
        out.flush()?;
        Ok(Outcome { mismatch, phases })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Fault;
    use std::{fs, path::PathBuf};
    use tempfile::TempDir;

    fn xclbin() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vadd.xclbin");
        fs::write(&path, b"xclbin").unwrap();
        (dir, path)
    }

    fn emulated(elements: usize, path: PathBuf) -> Workflow {
        let config = Config {
            elements,
            ..Config::new(path)
        };
        Workflow::new(config).device(Device::builder().emulated(true))
    }

    #[test]
    fn run_verified() {
        let (_dir, path) = xclbin();
        let mut out = Vec::new();
        let outcome = emulated(8, path).run(&mut out).unwrap();
        assert!(outcome.verified());
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("Vector add example complete!\n"), "{out}");
        assert!(!out.contains("ERROR"));
        for label in [
            "OpenCL Initialization",
            "Allocating memory buffer",
            "Populating buffer inputs",
            "Software VADD run",
            "Map host buffers to OpenCL buffers",
            "Set kernel arguments",
            "Memory object migration enqueue",
            "OCL Enqueue task",
            "Wait for kernel to complete",
            "Read back computation results",
        ] {
            assert!(outcome.phases().get(label).is_some(), "{label}");
        }
        assert_eq!(outcome.phases().len(), 10);
    }

    #[test]
    fn run_mismatch() {
        let (_dir, path) = xclbin();
        let mut out = Vec::new();
        let outcome = emulated(8, path)
            .device(Device::builder().emulated(true).fault(Fault::StuckOutput { index: 3 }))
            .run(&mut out)
            .unwrap();
        assert!(!outcome.verified());
        assert!(outcome.succeeded(MismatchPolicy::Report));
        assert!(!outcome.succeeded(MismatchPolicy::Fail));
        let out = String::from_utf8(out).unwrap();
        assert!(
            out.contains("ERROR: software and hardware vadd do not match: 0!=9 at position 3\n"),
            "{out}"
        );
        assert!(out.contains("complete! (with errors)"));
        let report = out
            .split("--------------- Key execution times ---------------\n")
            .nth(1)
            .unwrap();
        assert_eq!(report.lines().count(), 10);
    }

    #[test]
    fn error_kinds() {
        let (_dir, path) = xclbin();
        let e = emulated(8, path.clone())
            .device(Device::builder().emulated(true).fault(Fault::NoDevices))
            .run(&mut Vec::new())
            .unwrap_err();
        assert_eq!(ErrorKind::of(&e), ErrorKind::NoDeviceFound);
        let e = emulated(8, path.with_file_name("missing.xclbin"))
            .run(&mut Vec::new())
            .unwrap_err();
        assert_eq!(ErrorKind::of(&e), ErrorKind::ImageLoad);
        let e = emulated(8, path)
            .device(Device::builder().emulated(true).fault(Fault::EnqueueTask))
            .run(&mut Vec::new())
            .unwrap_err();
        assert_eq!(ErrorKind::of(&e), ErrorKind::DeviceExecution);
        let e = anyhow::Error::from(OutOfMemory { bytes: 4 }).context("allocating");
        assert_eq!(ErrorKind::of(&e), ErrorKind::OutOfMemory);
        assert_eq!(ErrorKind::of(&anyhow::anyhow!("other")), ErrorKind::Other);
    }
}
