/*!
Kernel images, programs and argument binding.

A kernel image is a precompiled binary for one device. [`find_binary_file`] resolves the path
given on the command line against the device name, [`KernelImage`] loads it and a [`Program`]
is built from it for a [`Context`].

Arguments are bound positionally with [`Kernel::bind`]. Every argument must be bound exactly
once, the resulting [`BoundKernel`] borrows the bound buffers so they outlive any launch:
```no_run
# use vadd_offload::{anyhow::Result, buffer::{DeviceBuffer, HostBuffers}, device::{Context, Device}, kernel::{KernelImage, Program}};
# fn main() -> Result<()> {
# let device = Device::builder().emulated(true).build()?;
# let context = Context::new(&device)?;
# let image = KernelImage::for_device(&device, "vadd.xclbin")?;
let mut kernel = Program::new(&context, &image)?.kernel("vadd")?;
let mut buffers = HostBuffers::alloc(64)?;
let a = DeviceBuffer::read_only(&context, &buffers.a)?;
let b = DeviceBuffer::read_only(&context, &buffers.b)?;
let c = DeviceBuffer::write_only(&context, &mut buffers.device_result)?;
let kernel = kernel
    .bind()
    .buffer(0, &a)?
    .buffer(1, &b)?
    .buffer(2, &c)?
    .u32(3, 64)?
    .finish()?;
context.enqueue_task(&kernel)?.wait()?;
# Ok(())
# }
```
*/

use crate::{
    buffer::DeviceBuffer,
    device::{Context, Device, RawArg, RawKernel, RawProgram},
    result::Result,
};
use std::{
    fmt::{self, Debug},
    fs,
    path::{Path, PathBuf},
};

/// Errors.
pub mod error {
    use std::path::PathBuf;

    /// The kernel image could not be loaded.
    #[derive(Debug, thiserror::Error)]
    pub enum ImageLoadError {
        /// No candidate path exists.
        #[error("ImageLoadError: no kernel image for device {device:?}, tried {tried:?}")]
        NotFound {
            /// The device name.
            device: String,
            /// The candidate paths, in order.
            tried: Vec<PathBuf>,
        },
        /// The image could not be read.
        #[error("ImageLoadError: failed to read {path:?}")]
        Io {
            /// The image path.
            path: PathBuf,
            /// The cause.
            #[source]
            source: std::io::Error,
        },
        /// The image is empty.
        #[error("ImageLoadError: {path:?} is empty")]
        Empty {
            /// The image path.
            path: PathBuf,
        },
        /// The device rejected the image.
        #[error("ImageLoadError: failed to build a program from {path:?}: {message}")]
        Build {
            /// The image path.
            path: PathBuf,
            /// The build log or error.
            message: String,
        },
    }

    /// The program has no such kernel.
    #[derive(Debug, thiserror::Error)]
    #[error("KernelNotFound: kernel {name:?} not found in {path:?}")]
    pub struct KernelNotFound {
        pub(super) name: String,
        pub(super) path: PathBuf,
    }

    impl KernelNotFound {
        /// The kernel name.
        pub fn name(&self) -> &str {
            &self.name
        }
    }

    /// Arguments were bound incorrectly.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
    pub enum KernelArgError {
        /// The index is not an argument of the kernel.
        #[error("KernelArgError: argument {index} is out of range 0..{args}")]
        OutOfRange {
            /// The index.
            index: u32,
            /// The number of arguments.
            args: u32,
        },
        /// The argument was already bound.
        #[error("KernelArgError: argument {index} is already bound")]
        AlreadyBound {
            /// The index.
            index: u32,
        },
        /// The argument was never bound.
        #[error("KernelArgError: argument {index} is not bound")]
        Unbound {
            /// The index.
            index: u32,
        },
    }
}
use error::*;

/** Resolves a kernel image for the device named `device_name`.

Tries, in order:
- `path` itself.
- `<dir>/<stem>.<device_name>.xclbin`, with `:` and `.` in the device name replaced by `_`.
- `<dir>/<stem>.xclbin`.

**errors**
- [`ImageLoadError::NotFound`](error::ImageLoadError::NotFound) listing every candidate.
*/
pub fn find_binary_file(device_name: &str, path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let mut tried = vec![path.to_path_buf()];
    if let Some(stem) = path.file_stem().and_then(|x| x.to_str()) {
        let device = device_name.replace([':', '.'], "_");
        for candidate in [
            dir.join(format!("{stem}.{device}.xclbin")),
            dir.join(format!("{stem}.xclbin")),
        ] {
            if !tried.contains(&candidate) {
                tried.push(candidate);
            }
        }
    }
    if let Some(found) = tried.iter().find(|x| x.is_file()) {
        tracing::debug!(path = ?found, "resolved kernel image");
        return Ok(found.clone());
    }
    Err(ImageLoadError::NotFound {
        device: device_name.to_string(),
        tried,
    }
    .into())
}

/// A loaded kernel image.
#[derive(Clone)]
pub struct KernelImage {
    path: PathBuf,
    binary: Vec<u8>,
}

impl KernelImage {
    /** Reads the image at `path`.

    **errors**
    - [`ImageLoadError::Io`](error::ImageLoadError::Io)
    - [`ImageLoadError::Empty`](error::ImageLoadError::Empty)
    */
    pub fn import(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let binary = match fs::read(&path) {
            Ok(binary) => binary,
            Err(source) => return Err(ImageLoadError::Io { path, source }.into()),
        };
        if binary.is_empty() {
            return Err(ImageLoadError::Empty { path }.into());
        }
        tracing::info!(path = ?path, bytes = binary.len(), "loaded kernel image");
        Ok(Self { path, binary })
    }
    /// Resolves `path` for `device` with [`find_binary_file`] and imports it.
    pub fn for_device(device: &Device, path: impl AsRef<Path>) -> Result<Self> {
        Self::import(find_binary_file(device.name(), path)?)
    }
    /// The path the image was read from.
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// The binary.
    pub fn binary(&self) -> &[u8] {
        &self.binary
    }
}

impl Debug for KernelImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelImage")
            .field("path", &self.path)
            .field("bytes", &self.binary.len())
            .finish()
    }
}

/// A program built from a kernel image.
pub struct Program {
    path: PathBuf,
    raw: RawProgram,
}

impl Program {
    /** Builds `image` for the device of `context`.

    **errors**
    - [`ImageLoadError::Build`](error::ImageLoadError::Build) if the device rejects the image.
    */
    pub fn new(context: &Context, image: &KernelImage) -> Result<Self> {
        let raw = context
            .raw_program(image.binary())
            .map_err(|e| ImageLoadError::Build {
                path: image.path.clone(),
                message: format!("{e:#}"),
            })?;
        Ok(Self {
            path: image.path.clone(),
            raw,
        })
    }
    /** The kernel `name`.

    **errors**
    - [`KernelNotFound`](error::KernelNotFound)
    */
    pub fn kernel(&self, name: &str) -> Result<Kernel> {
        let raw = self.raw.kernel(name)?.ok_or_else(|| KernelNotFound {
            name: name.to_string(),
            path: self.path.clone(),
        })?;
        let num_args = raw.num_args()?;
        tracing::debug!(kernel = name, num_args, "resolved kernel");
        Ok(Kernel {
            name: name.to_string(),
            num_args,
            raw,
        })
    }
}

impl Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program").field("path", &self.path).finish()
    }
}

/// A kernel entry point.
pub struct Kernel {
    name: String,
    num_args: u32,
    raw: RawKernel,
}

impl Kernel {
    /// The name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The number of arguments.
    pub fn num_args(&self) -> u32 {
        self.num_args
    }
    /// Starts binding arguments, all arguments must be bound again.
    pub fn bind(&mut self) -> KernelArgs<'_> {
        let bound = vec![false; self.num_args as usize];
        KernelArgs {
            kernel: self,
            bound,
        }
    }
}

impl Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("num_args", &self.num_args)
            .finish()
    }
}

/// Binds the arguments of a [`Kernel`].
pub struct KernelArgs<'a> {
    kernel: &'a mut Kernel,
    bound: Vec<bool>,
}

impl<'a> KernelArgs<'a> {
    /// Binds `buffer` to argument `index`.
    ///
    /// **errors**
    /// - [`KernelArgError`](error::KernelArgError)
    /// - The device rejected the argument.
    pub fn buffer(self, index: u32, buffer: &'a DeviceBuffer) -> Result<Self> {
        // # Safety
        // `buffer` is borrowed by the returned binding.
        unsafe { self.arg(index, RawArg::Buffer(buffer.raw())) }
    }
    /// Binds `value` to argument `index`.
    ///
    /// **errors**
    /// See [`buffer`](KernelArgs::buffer).
    pub fn u32(self, index: u32, value: u32) -> Result<Self> {
        unsafe { self.arg(index, RawArg::U32(value)) }
    }
    unsafe fn arg(mut self, index: u32, arg: RawArg) -> Result<Self> {
        let args = self.kernel.num_args;
        let bound = self
            .bound
            .get_mut(index as usize)
            .ok_or(KernelArgError::OutOfRange { index, args })?;
        if *bound {
            return Err(KernelArgError::AlreadyBound { index }.into());
        }
        unsafe {
            self.kernel.raw.set_arg(index, arg)?;
        }
        *bound = true;
        Ok(self)
    }
    /// Finishes binding.
    ///
    /// **errors**
    /// - [`KernelArgError::Unbound`](error::KernelArgError::Unbound)
    pub fn finish(self) -> Result<BoundKernel<'a>> {
        if let Some(index) = self.bound.iter().position(|x| !x) {
            return Err(KernelArgError::Unbound {
                index: index as u32,
            }
            .into());
        }
        Ok(BoundKernel {
            kernel: self.kernel,
        })
    }
}

/// A kernel with all arguments bound, ready to enqueue.
pub struct BoundKernel<'a> {
    kernel: &'a Kernel,
}

impl BoundKernel<'_> {
    /// The name.
    pub fn name(&self) -> &str {
        &self.kernel.name
    }
    pub(crate) fn raw(&self) -> &RawKernel {
        &self.kernel.raw
    }
}

impl Debug for BoundKernel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BoundKernel").field(self.kernel).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn find_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vadd.xclbin");
        fs::write(&path, b"xclbin2").unwrap();
        assert_eq!(find_binary_file("xilinx_u200", &path).unwrap(), path);
    }

    #[test]
    fn find_for_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vadd.xilinx_u200_xdma_201830_2.xclbin");
        fs::write(&path, b"xclbin2").unwrap();
        let found =
            find_binary_file("xilinx_u200_xdma_201830.2", dir.path().join("vadd")).unwrap();
        assert_eq!(found, path);
    }

    #[test]
    fn find_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let error = find_binary_file("dev", dir.path().join("vadd.awsxclbin")).unwrap_err();
        match error.downcast_ref::<ImageLoadError>() {
            Some(ImageLoadError::NotFound { device, tried }) => {
                assert_eq!(device, "dev");
                assert_eq!(
                    tried,
                    &[
                        dir.path().join("vadd.awsxclbin"),
                        dir.path().join("vadd.dev.xclbin"),
                        dir.path().join("vadd.xclbin"),
                    ]
                );
            }
            _ => panic!("{error:?}"),
        }
    }

    #[test]
    fn import_empty() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let error = KernelImage::import(file.path()).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<ImageLoadError>(),
            Some(ImageLoadError::Empty { .. })
        ));
    }

    #[test]
    fn import_missing() {
        let dir = tempfile::tempdir().unwrap();
        let error = KernelImage::import(dir.path().join("missing.xclbin")).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<ImageLoadError>(),
            Some(ImageLoadError::Io { .. })
        ));
    }
}
