/*!
Host buffers and their host-backed device views.

[`HostBuffers`] owns the four regions of a run: the two inputs, the device result and the
reference result. Memory is released when the buffers are dropped, on every exit path.

A [`DeviceBuffer`] wraps an existing host region instead of allocating device memory (OpenCL
`CL_MEM_USE_HOST_PTR`). It borrows the region for its whole lifetime, shared for
[`Access::ReadOnly`] and exclusively otherwise, so the host can neither mutate an input nor read
an output while the device may still be using it.
*/

use crate::{
    device::{Context, RawBuffer},
    result::Result,
};
use std::{marker::PhantomData, mem::size_of};

/// Errors.
pub mod error {
    /// Host memory could not be allocated.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("OutOfMemory: failed to allocate {bytes} bytes of host memory")]
    pub struct OutOfMemory {
        pub(crate) bytes: usize,
    }

    impl OutOfMemory {
        /// The requested size in bytes.
        pub fn bytes(&self) -> usize {
            self.bytes
        }
    }

    /// Device buffers can not be empty.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("EmptyDeviceBuffer: can not wrap an empty host region")]
    pub struct EmptyDeviceBuffer;

    /// Buffers that must have equal lengths do not.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("BufferLengthMismatch: expected {expected} elements, found {found}")]
    pub struct BufferLengthMismatch {
        pub(crate) expected: usize,
        pub(crate) found: usize,
    }
}
use error::*;

/** A fixed length host region of `u32`.

Dereferences to the elements, it can not be resized.
*/
#[derive(Clone, Debug, PartialEq, Eq, derive_more::Deref, derive_more::DerefMut)]
pub struct HostBuffer {
    data: Box<[u32]>,
}

impl HostBuffer {
    /** Allocates a zeroed buffer of `len` elements.

    **errors**

    - [`OutOfMemory`](error::OutOfMemory) if the allocation fails.
    */
    pub fn alloc(len: usize) -> Result<Self> {
        let bytes = len.saturating_mul(size_of::<u32>());
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| OutOfMemory { bytes })?;
        data.resize(len, 0);
        Ok(Self {
            data: data.into_boxed_slice(),
        })
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }
    /// Has no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    /// The size in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.data.len() * size_of::<u32>()
    }
}

/// Fills the inputs with `a[i] = i` and `b[i] = 2 * i`, wrapping.
pub fn populate_inputs(a: &mut [u32], b: &mut [u32]) {
    for (i, a) in a.iter_mut().enumerate() {
        *a = i as u32;
    }
    for (i, b) in b.iter_mut().enumerate() {
        *b = (i as u32).wrapping_mul(2);
    }
}

/// The four equally sized regions of a run.
#[derive(Debug)]
pub struct HostBuffers {
    /// Input a.
    pub a: HostBuffer,
    /// Input b.
    pub b: HostBuffer,
    /// Written by the device.
    pub device_result: HostBuffer,
    /// Written by the host.
    pub reference_result: HostBuffer,
}

impl HostBuffers {
    /** Allocates four zeroed buffers of `len` elements.

    **errors**

    - [`OutOfMemory`](error::OutOfMemory) if any allocation fails, buffers already allocated
    are released.
    */
    pub fn alloc(len: usize) -> Result<Self> {
        let buffers = Self {
            a: HostBuffer::alloc(len)?,
            b: HostBuffer::alloc(len)?,
            device_result: HostBuffer::alloc(len)?,
            reference_result: HostBuffer::alloc(len)?,
        };
        tracing::debug!(
            len,
            bytes = buffers.a.size_in_bytes() * 4,
            "allocated host buffers"
        );
        Ok(buffers)
    }
    /// The number of elements per buffer.
    pub fn len(&self) -> usize {
        self.a.len()
    }
    /// Has no elements.
    pub fn is_empty(&self) -> bool {
        self.a.is_empty()
    }
    /// Fills the inputs, see [`populate_inputs`].
    pub fn populate(&mut self) {
        populate_inputs(&mut self.a, &mut self.b);
    }
}

/// How the device may access a [`DeviceBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// The device only reads.
    ReadOnly,
    /// The device only writes.
    WriteOnly,
    /// The device reads and writes.
    ReadWrite,
}

impl Access {
    /// The device may write.
    pub fn is_writable(&self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct RawHostSlice {
    pub(crate) ptr: *mut u32,
    pub(crate) len: usize,
}

impl RawHostSlice {
    fn from_slice(slice: &[u32]) -> Self {
        Self {
            ptr: slice.as_ptr() as *mut u32,
            len: slice.len(),
        }
    }
    fn from_slice_mut(slice: &mut [u32]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }
    /// # Safety
    /// The region must still be borrowed by the owning [`DeviceBuffer`].
    pub(crate) unsafe fn as_slice<'a>(&self) -> &'a [u32] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
    /// # Safety
    /// The region must still be exclusively borrowed by the owning [`DeviceBuffer`].
    pub(crate) unsafe fn as_slice_mut<'a>(&self) -> &'a mut [u32] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/** A device visible buffer backed by host memory.

```no_run
# use vadd_offload::{anyhow::Result, buffer::{DeviceBuffer, HostBuffers}, device::{Context, Device}};
# fn main() -> Result<()> {
# let context = Context::new(&Device::builder().emulated(true).build()?)?;
let mut buffers = HostBuffers::alloc(16)?;
buffers.populate();
let a = DeviceBuffer::read_only(&context, &buffers.a)?;
let c = DeviceBuffer::write_only(&context, &mut buffers.device_result)?;
// buffers.a can be read, but not written, while `a` lives.
# Ok(())
# }
```
*/
pub struct DeviceBuffer<'a> {
    raw: RawBuffer,
    access: Access,
    len: usize,
    _m: PhantomData<&'a mut [u32]>,
}

impl<'a> DeviceBuffer<'a> {
    /// Wraps `host` for the device to read.
    ///
    /// **errors**
    /// - [`EmptyDeviceBuffer`](error::EmptyDeviceBuffer)
    /// - The device failed to create the buffer.
    pub fn read_only(context: &Context, host: &'a [u32]) -> Result<Self> {
        // # Safety
        // `host` is borrowed for 'a and never written through.
        unsafe { Self::new(context, RawHostSlice::from_slice(host), Access::ReadOnly) }
    }
    /// Wraps `host` for the device to write.
    ///
    /// **errors**
    /// See [`read_only`](DeviceBuffer::read_only).
    pub fn write_only(context: &Context, host: &'a mut [u32]) -> Result<Self> {
        // # Safety
        // `host` is exclusively borrowed for 'a.
        unsafe { Self::new(context, RawHostSlice::from_slice_mut(host), Access::WriteOnly) }
    }
    /// Wraps `host` for the device to read and write.
    ///
    /// **errors**
    /// See [`read_only`](DeviceBuffer::read_only).
    pub fn read_write(context: &Context, host: &'a mut [u32]) -> Result<Self> {
        // # Safety
        // `host` is exclusively borrowed for 'a.
        unsafe { Self::new(context, RawHostSlice::from_slice_mut(host), Access::ReadWrite) }
    }
    unsafe fn new(context: &Context, host: RawHostSlice, access: Access) -> Result<Self> {
        if host.len == 0 {
            return Err(EmptyDeviceBuffer.into());
        }
        let raw = unsafe { context.raw_buffer(host, access)? };
        Ok(Self {
            raw,
            access,
            len: host.len,
            _m: PhantomData,
        })
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        self.len
    }
    /// Has no elements, always false.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// The access granted to the device.
    pub fn access(&self) -> Access {
        self.access
    }
    pub(crate) fn raw(&self) -> &RawBuffer {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_zeroed() {
        let buffer = HostBuffer::alloc(5).unwrap();
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.size_in_bytes(), 20);
        assert!(buffer.iter().all(|x| *x == 0));
    }

    #[test]
    fn alloc_out_of_memory() {
        let len = usize::MAX / size_of::<u32>();
        let error = HostBuffers::alloc(len).unwrap_err();
        let oom = error.downcast_ref::<OutOfMemory>().unwrap();
        assert_eq!(oom.bytes(), len * size_of::<u32>());
    }

    #[test]
    fn populate() {
        let mut buffers = HostBuffers::alloc(8).unwrap();
        buffers.populate();
        assert_eq!(&buffers.a[..], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(&buffers.b[..], &[0, 2, 4, 6, 8, 10, 12, 14]);
        assert!(buffers.device_result.iter().all(|x| *x == 0));
        assert!(buffers.reference_result.iter().all(|x| *x == 0));
    }

    #[test]
    fn populate_idempotent() {
        let mut x = HostBuffers::alloc(1000).unwrap();
        let mut y = HostBuffers::alloc(1000).unwrap();
        x.populate();
        y.populate();
        y.populate();
        assert_eq!(x.a, y.a);
        assert_eq!(x.b, y.b);
    }

    #[test]
    fn populate_single() {
        let mut buffers = HostBuffers::alloc(1).unwrap();
        buffers.populate();
        assert_eq!(buffers.len(), 1);
        assert_eq!(&buffers.a[..], &[0]);
        assert_eq!(&buffers.b[..], &[0]);
    }
}
