//! Internal reconstructed-frame buffers the encoder references for
//! motion compensation. Never exposed to the caller.

use crate::error::InitError;
use crate::format::reference_frame_geometry;
use crate::hw::{DmaBuffer, HardwareChannel};

#[derive(Debug, Default)]
pub struct ReferencePool {
    buffers: Vec<DmaBuffer>,
    stride: u32,
    height: u32,
}

impl ReferencePool {
    /// Allocates `count` frames sized for a `width` x `height` stream.
    /// A failed allocation frees everything allocated before it.
    pub fn allocate<H>(hw: &mut H, count: u32, width: u32, height: u32) -> Result<Self, InitError>
    where
        H: HardwareChannel + ?Sized,
    {
        let (stride, aligned_height, size) = reference_frame_geometry(width, height);
        let mut pool = Self {
            buffers: Vec::with_capacity(count as usize),
            stride,
            height: aligned_height,
        };

        for index in 0..count as usize {
            match hw.allocate_dma(size) {
                Ok(buf) => pool.buffers.push(buf),
                Err(source) => {
                    log::error!(
                        "reference buffer {} of {} ({} bytes) allocation failed: {}",
                        index,
                        count,
                        size,
                        source
                    );
                    pool.release(hw);
                    return Err(InitError::Allocation {
                        index,
                        size,
                        source,
                    });
                }
            }
        }

        log::debug!(
            "allocated {} reference buffers, stride {} height {} size {}",
            count,
            stride,
            aligned_height,
            size
        );
        Ok(pool)
    }

    /// Hands the whole set to the hardware in one call.
    pub fn register<H>(&self, hw: &mut H) -> Result<(), InitError>
    where
        H: HardwareChannel + ?Sized,
    {
        hw.register_frame_buffers(&self.buffers, self.stride, self.height)
            .map_err(InitError::Register)
    }

    pub fn release<H>(&mut self, hw: &mut H)
    where
        H: HardwareChannel + ?Sized,
    {
        for buf in self.buffers.drain(..) {
            hw.free_dma(buf);
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn buffers(&self) -> &[DmaBuffer] {
        &self.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HwError;
    use crate::hw::OpenParam;
    use crate::sim::SimVpu;

    #[test]
    fn allocate_and_register() {
        let mut sim = SimVpu::new();
        sim.open(&OpenParam::default()).unwrap();
        let mut pool = ReferencePool::allocate(&mut sim, 3, 416, 240).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.stride(), 416);
        assert_eq!(pool.height(), 256);
        assert!(pool.buffers().iter().all(|b| b.size == 416 * 256 + 208 * 256));

        pool.register(&mut sim).unwrap();
        assert_eq!(sim.registered(), Some((3, 416, 256)));

        pool.release(&mut sim);
        assert!(pool.is_empty());
        assert_eq!(sim.live_dma(), 0);
    }

    #[test]
    fn failed_allocation_rolls_back() {
        let mut sim = SimVpu::new();
        sim.fail_allocation_at(2);
        let err = ReferencePool::allocate(&mut sim, 4, 1920, 1080).unwrap_err();
        assert!(matches!(
            err,
            InitError::Allocation {
                index: 2,
                source: HwError::OutOfMemory(_),
                ..
            }
        ));
        assert_eq!(sim.live_dma(), 0);
    }

    #[test]
    fn register_failure_is_reported() {
        let mut sim = SimVpu::new();
        sim.open(&OpenParam::default()).unwrap();
        sim.fail_register(HwError::Firmware(0x40));
        let mut pool = ReferencePool::allocate(&mut sim, 2, 640, 480).unwrap();
        assert!(matches!(
            pool.register(&mut sim),
            Err(InitError::Register(HwError::Firmware(0x40)))
        ));
        pool.release(&mut sim);
        assert_eq!(sim.live_dma(), 0);
    }
}
