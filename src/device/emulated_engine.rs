use super::{
    error::InjectedFault, DeviceEngine, DeviceInfo, EngineArg, EngineKind, Fault, Migration,
};
use crate::{
    buffer::{Access, RawHostSlice},
    result::Result,
};
use anyhow::{bail, format_err};
use parking_lot::RwLock;
use std::sync::Arc;

pub(crate) const DEVICE_NAME: &str = "xilinx_vadd_sw_emu";

// name, number of arguments
const KERNELS: &[(&str, u32)] = &[("vadd", 4)];

type Memory = Arc<RwLock<Vec<u32>>>;

#[derive(Clone)]
pub(crate) struct RawDevice {
    info: Arc<DeviceInfo>,
    fault: Option<Fault>,
}

impl RawDevice {
    pub(crate) fn info(&self) -> &Arc<DeviceInfo> {
        &self.info
    }
}

pub(crate) fn devices(fault: Option<Fault>) -> Vec<RawDevice> {
    if fault == Some(Fault::NoDevices) {
        return Vec::new();
    }
    let info = Arc::new(DeviceInfo {
        index: 0,
        name: DEVICE_NAME.to_string(),
        engine: EngineKind::Emulated,
    });
    vec![RawDevice { info, fault }]
}

pub(crate) struct Engine {
    fault: Option<Fault>,
}

impl Engine {
    fn inject(&self, fault: Fault) -> Result<(), InjectedFault> {
        if self.fault == Some(fault) {
            tracing::debug!(?fault, "injecting fault");
            Err(InjectedFault(fault))
        } else {
            Ok(())
        }
    }
    fn stuck_output(&self) -> Option<usize> {
        match self.fault {
            Some(Fault::StuckOutput { index }) => Some(index),
            _ => None,
        }
    }
}

pub(crate) struct DeviceBuffer {
    host: RawHostSlice,
    access: Access,
    memory: Memory,
}

pub(crate) struct Program {
    kernels: &'static [(&'static str, u32)],
}

#[derive(Clone)]
enum Arg {
    Buffer(Memory),
    U32(u32),
}

pub(crate) struct Kernel {
    name: &'static str,
    args: Vec<Option<Arg>>,
}

/// Work runs when it is enqueued, the event carries its status.
pub(crate) struct Event {
    status: Result<()>,
}

impl DeviceEngine for Engine {
    type RawDevice = RawDevice;
    type DeviceBuffer = DeviceBuffer;
    type Program = Program;
    type Kernel = Kernel;
    type Event = Event;
    fn new(device: &RawDevice) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            fault: device.fault,
        }))
    }
    unsafe fn buffer(&self, host: RawHostSlice, access: Access) -> Result<DeviceBuffer> {
        // host backed buffers start with the host contents
        let data = unsafe { host.as_slice() }.to_vec();
        Ok(DeviceBuffer {
            host,
            access,
            memory: Arc::new(RwLock::new(data)),
        })
    }
    fn program(&self, binary: &[u8]) -> Result<Program> {
        if binary.is_empty() {
            bail!("empty binary");
        }
        Ok(Program { kernels: KERNELS })
    }
    fn kernel(program: &Program, name: &str) -> Result<Option<Kernel>> {
        let kernel = program
            .kernels
            .iter()
            .find(|(x, _)| *x == name)
            .map(|&(name, args)| Kernel {
                name,
                args: vec![None; args as usize],
            });
        Ok(kernel)
    }
    fn num_args(kernel: &Kernel) -> Result<u32> {
        Ok(kernel.args.len() as u32)
    }
    unsafe fn set_arg(kernel: &mut Kernel, index: u32, arg: EngineArg<DeviceBuffer>) -> Result<()> {
        let slot = kernel
            .args
            .get_mut(index as usize)
            .ok_or_else(|| format_err!("invalid argument index {index}"))?;
        slot.replace(match arg {
            EngineArg::Buffer(buffer) => Arg::Buffer(buffer.memory.clone()),
            EngineArg::U32(value) => Arg::U32(value),
        });
        Ok(())
    }
    fn migrate(&self, buffers: &[&DeviceBuffer], migration: Migration) -> Result<Event> {
        match migration {
            Migration::ToDevice => {
                self.inject(Fault::MigrateToDevice)?;
                for buffer in buffers {
                    let host = unsafe { buffer.host.as_slice() };
                    buffer.memory.write().copy_from_slice(host);
                }
            }
            Migration::ToHost => {
                self.inject(Fault::MigrateToHost)?;
                for buffer in buffers.iter().filter(|x| x.access.is_writable()) {
                    // # Safety
                    // writable buffers hold an exclusive borrow of the host region
                    let host = unsafe { buffer.host.as_slice_mut() };
                    host.copy_from_slice(&buffer.memory.read());
                }
            }
        }
        Ok(Event { status: Ok(()) })
    }
    fn enqueue_task(&self, kernel: &Kernel) -> Result<Event> {
        self.inject(Fault::EnqueueTask)?;
        // invalid launches are rejected at enqueue
        match kernel.name {
            "vadd" => vadd(&kernel.args, self.stuck_output())?,
            name => bail!("unknown kernel {name:?}"),
        }
        let status = self.inject(Fault::TaskCompletion).map_err(anyhow::Error::from);
        Ok(Event { status })
    }
    fn wait(event: Event) -> Result<()> {
        event.status
    }
    fn finish(&self) -> Result<()> {
        Ok(self.inject(Fault::Finish)?)
    }
}

fn vadd(args: &[Option<Arg>], stuck: Option<usize>) -> Result<()> {
    let [Some(Arg::Buffer(a)), Some(Arg::Buffer(b)), Some(Arg::Buffer(c)), Some(Arg::U32(size))] =
        args
    else {
        bail!("vadd expects (a, b, c, size)");
    };
    if Arc::ptr_eq(c, a) || Arc::ptr_eq(c, b) {
        bail!("vadd output aliases an input");
    }
    let size = *size as usize;
    let a = a.read();
    let b = b.read();
    let mut c = c.write();
    if size > a.len() || size > b.len() || size > c.len() {
        bail!(
            "vadd size {size} is out of bounds for buffers of {}, {} and {} elements",
            a.len(),
            b.len(),
            c.len()
        );
    }
    let c = c[..size]
        .iter_mut()
        .zip(a[..size].iter().zip(&b[..size]))
        .enumerate();
    for (i, (c, (a, b))) in c {
        if Some(i) != stuck {
            *c = a.wrapping_add(*b);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(data: Vec<u32>) -> Option<Arg> {
        Some(Arg::Buffer(Arc::new(RwLock::new(data))))
    }

    #[test]
    fn vadd_wraps() {
        let c = memory(vec![7; 3]);
        let args = [
            memory(vec![u32::MAX, 1, 2]),
            memory(vec![1, 1, 2]),
            c.clone(),
            Some(Arg::U32(3)),
        ];
        vadd(&args, None).unwrap();
        let Some(Arg::Buffer(c)) = c else {
            unreachable!()
        };
        assert_eq!(c.read().as_slice(), &[0, 2, 4]);
    }

    #[test]
    fn vadd_stuck() {
        let c = memory(vec![7; 3]);
        let args = [memory(vec![1; 3]), memory(vec![1; 3]), c.clone(), Some(Arg::U32(3))];
        vadd(&args, Some(1)).unwrap();
        let Some(Arg::Buffer(c)) = c else {
            unreachable!()
        };
        assert_eq!(c.read().as_slice(), &[2, 7, 2]);
    }

    #[test]
    fn vadd_invalid_args() {
        let args = [memory(vec![1; 3]), None, memory(vec![0; 3]), Some(Arg::U32(3))];
        assert!(vadd(&args, None).is_err());
        let args = [
            memory(vec![1; 3]),
            memory(vec![1; 3]),
            memory(vec![0; 2]),
            Some(Arg::U32(3)),
        ];
        assert!(vadd(&args, None).is_err());
    }

    #[test]
    fn enqueue_rejects_invalid_launch() {
        let engine = Engine { fault: None };
        let kernel = Kernel {
            name: "vadd",
            args: vec![
                memory(vec![1; 3]),
                memory(vec![1; 3]),
                memory(vec![0; 3]),
                Some(Arg::U32(4)),
            ],
        };
        assert!(engine.enqueue_task(&kernel).is_err());
        let kernel = Kernel {
            name: "vmul",
            args: Vec::new(),
        };
        assert!(engine.enqueue_task(&kernel).is_err());
    }

    #[test]
    fn task_completion_fault_is_reported_by_wait() {
        let engine = Engine {
            fault: Some(Fault::TaskCompletion),
        };
        let kernel = Kernel {
            name: "vadd",
            args: vec![
                memory(vec![1; 3]),
                memory(vec![1; 3]),
                memory(vec![0; 3]),
                Some(Arg::U32(3)),
            ],
        };
        let event = engine.enqueue_task(&kernel).unwrap();
        assert!(Engine::wait(event).is_err());
    }

    #[test]
    fn vadd_aliased() {
        let a = memory(vec![1; 3]);
        let args = [a.clone(), memory(vec![1; 3]), a, Some(Arg::U32(3))];
        assert!(vadd(&args, None).is_err());
    }
}
