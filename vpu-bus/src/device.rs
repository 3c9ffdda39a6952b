//! The physical encoder shared by every session opened on it.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{FailCode, HwError, InitError};
use crate::hw::{
    DmaBuffer, EncodeCommand, HardwareChannel, HwCommand, InitialInfo, OpenParam, OutputInfo,
    QueueStatus,
};

pub const MAX_INSTANCES: usize = 32;

struct DeviceInner {
    name: String,
    /// Serializes access to the single command channel.
    hw_lock: Mutex<()>,
    instances: Mutex<BTreeSet<u32>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
pub struct VpuDevice {
    inner: Arc<DeviceInner>,
}

impl VpuDevice {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                name: name.to_string(),
                hw_lock: Mutex::new(()),
                instances: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Wraps a per-instance channel so its calls take the device lock.
    pub fn attach<H: HardwareChannel + 'static>(&self, hw: H) -> DeviceChannel {
        DeviceChannel {
            device: self.inner.clone(),
            hw: Box::new(hw),
        }
    }

    /// Reserves the lowest free instance id.
    pub fn acquire_instance(&self) -> Result<InstanceId, InitError> {
        let mut ids = lock(&self.inner.instances);
        let id = (0..MAX_INSTANCES as u32)
            .find(|id| !ids.contains(id))
            .ok_or(InitError::NoFreeInstance(MAX_INSTANCES))?;
        ids.insert(id);
        log::debug!("{}: instance {} acquired", self.inner.name, id);
        Ok(InstanceId {
            id,
            device: self.inner.clone(),
        })
    }

    pub fn active_instances(&self) -> usize {
        lock(&self.inner.instances).len()
    }
}

impl Display for VpuDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} instances)", self.inner.name, self.active_instances())
    }
}

/// An encoder instance slot; released when dropped.
pub struct InstanceId {
    id: u32,
    device: Arc<DeviceInner>,
}

impl InstanceId {
    pub fn get(&self) -> u32 {
        self.id
    }
}

impl std::fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "InstanceId({})", self.id)
    }
}

impl Drop for InstanceId {
    fn drop(&mut self) {
        lock(&self.device.instances).remove(&self.id);
        log::debug!("{}: instance {} released", self.device.name, self.id);
    }
}

/// A session's view of the hardware: every primitive except
/// `wait_for_interrupt` runs under the device lock.
pub struct DeviceChannel {
    device: Arc<DeviceInner>,
    hw: Box<dyn HardwareChannel>,
}

impl HardwareChannel for DeviceChannel {
    fn open(&mut self, param: &OpenParam) -> Result<(), HwError> {
        let _guard = lock(&self.device.hw_lock);
        self.hw.open(param)
    }

    fn close(&mut self) -> Result<(), HwError> {
        let _guard = lock(&self.device.hw_lock);
        self.hw.close()
    }

    fn issue_seq_init(&mut self) -> Result<(), HwError> {
        let _guard = lock(&self.device.hw_lock);
        self.hw.issue_seq_init()
    }

    fn complete_seq_init(&mut self) -> Result<InitialInfo, HwError> {
        let _guard = lock(&self.device.hw_lock);
        self.hw.complete_seq_init()
    }

    fn allocate_dma(&mut self, size: usize) -> Result<DmaBuffer, HwError> {
        let _guard = lock(&self.device.hw_lock);
        self.hw.allocate_dma(size)
    }

    fn free_dma(&mut self, buffer: DmaBuffer) {
        let _guard = lock(&self.device.hw_lock);
        self.hw.free_dma(buffer)
    }

    fn register_frame_buffers(
        &mut self,
        buffers: &[DmaBuffer],
        stride: u32,
        height: u32,
    ) -> Result<(), HwError> {
        let _guard = lock(&self.device.hw_lock);
        self.hw.register_frame_buffers(buffers, stride, height)
    }

    fn submit_frame(&mut self, cmd: &EncodeCommand) -> Result<(), FailCode> {
        let _guard = lock(&self.device.hw_lock);
        self.hw.submit_frame(cmd)
    }

    fn query_output(&mut self) -> Result<OutputInfo, HwError> {
        let _guard = lock(&self.device.hw_lock);
        self.hw.query_output()
    }

    fn send_command(&mut self, cmd: HwCommand) -> Result<(), HwError> {
        let _guard = lock(&self.device.hw_lock);
        self.hw.send_command(cmd)
    }

    fn query_queue_status(&mut self) -> QueueStatus {
        let _guard = lock(&self.device.hw_lock);
        self.hw.query_queue_status()
    }

    fn wait_for_interrupt(&mut self, timeout: Duration) -> bool {
        self.hw.wait_for_interrupt(timeout)
    }

    fn clear_interrupt(&mut self, status: u32) {
        let _guard = lock(&self.device.hw_lock);
        self.hw.clear_interrupt(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimVpu;

    #[test]
    fn lowest_free_id_is_reused() {
        let device = VpuDevice::new("vpu0");
        let a = device.acquire_instance().unwrap();
        let b = device.acquire_instance().unwrap();
        let c = device.acquire_instance().unwrap();
        assert_eq!((a.get(), b.get(), c.get()), (0, 1, 2));
        drop(b);
        assert_eq!(device.active_instances(), 2);
        let d = device.acquire_instance().unwrap();
        assert_eq!(d.get(), 1);
    }

    #[test]
    fn instance_limit() {
        let device = VpuDevice::new("vpu0");
        let held: Vec<_> = (0..MAX_INSTANCES)
            .map(|_| device.acquire_instance().unwrap())
            .collect();
        assert!(matches!(
            device.acquire_instance(),
            Err(InitError::NoFreeInstance(MAX_INSTANCES))
        ));
        drop(held);
        assert_eq!(device.active_instances(), 0);
    }

    #[test]
    fn channels_share_one_lock_across_threads() {
        let device = VpuDevice::new("vpu0");
        let sims: Vec<SimVpu> = (0..4).map(|_| SimVpu::new()).collect();
        let handles: Vec<_> = sims
            .iter()
            .map(|sim| {
                let mut ch = device.attach(sim.clone());
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let buf = ch.allocate_dma(64).unwrap();
                        ch.free_dma(buf);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(sims.iter().all(|s| s.live_dma() == 0));
    }
}
