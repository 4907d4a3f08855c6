/*!
Host-memory vector add, offloaded to an accelerator.

The workflow allocates plain host buffers, computes a reference sum on the host, then hands the
same memory to the device as host-backed buffers, runs the `vadd` kernel and checks the device
result against the reference, timing every phase along the way.

See [`workflow::Workflow`] for the whole sequence, or use the pieces directly:

```no_run
# use vadd_offload::{anyhow::Result, buffer::HostBuffers, device::{Context, Device}, kernel::{KernelImage, Program}};
# fn main() -> Result<()> {
let device = Device::builder().emulated(true).build()?;
let context = Context::new(&device)?;
let image = KernelImage::for_device(&device, "vadd.xclbin")?;
let kernel = Program::new(&context, &image)?.kernel("vadd")?;
let mut buffers = HostBuffers::alloc(1024)?;
buffers.populate();
# Ok(())
# }
```
*/

#![forbid(unsafe_op_in_unsafe_fn)]

pub extern crate anyhow;

pub mod result {
    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
}

pub mod buffer;
pub mod config;
pub mod device;
pub mod kernel;
pub mod offload;
pub mod timer;
pub mod verify;
pub mod workflow;
