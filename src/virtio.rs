//! VirtIO block device driver: one indirect virtqueue slot, one request
//! in flight at a time, sleep on submit and wake from the ISR.
//!
//! Modeled on the legacy (pre-1.0) virtio-mmio transport: a fixed
//! register window at `VIRTIO0`, feature negotiation, and a
//! descriptor/avail/used ring trio the driver itself allocates rather
//! than accepting a host-chosen layout.

use core::ptr;
use core::sync::atomic::{fence, Ordering};

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes};

use crate::io::{IoCtl, IoResult, SysError};
use crate::kernel::kernel;
use crate::lock::Sleepablelock;
use crate::memlayout::VIRTIO0;

#[repr(usize)]
#[allow(dead_code)]
enum Reg {
    MagicValue = 0x000,
    Version = 0x004,
    DeviceId = 0x008,
    VendorId = 0x00c,
    DeviceFeatures = 0x010,
    DeviceFeaturesSel = 0x014,
    DriverFeatures = 0x020,
    DriverFeaturesSel = 0x024,
    GuestPageSize = 0x028,
    QueueSel = 0x030,
    QueueNumMax = 0x034,
    QueueNum = 0x038,
    QueueAlign = 0x03c,
    QueuePfn = 0x040,
    QueueNotify = 0x050,
    InterruptStatus = 0x060,
    InterruptAck = 0x064,
    Status = 0x070,
    ConfigCapacity = 0x100,
    ConfigBlkSize = 0x114,
}

fn reg_read(r: Reg) -> u32 {
    // SAFETY: `VIRTIO0..VIRTIO0+0x200` is identity-mapped MMIO, global to
    // every address space; every offset used here is 4-byte aligned.
    unsafe { ptr::read_volatile((VIRTIO0 as *const u8).add(r as usize) as *const u32) }
}

fn reg_write(r: Reg, v: u32) {
    // SAFETY: see `reg_read`.
    unsafe { ptr::write_volatile((VIRTIO0 as *mut u8).add(r as usize) as *mut u32, v) }
}

bitflags! {
    struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
    }
}

bitflags! {
    struct Features: u32 {
        const RING_RESET = 1 << 1;
        const INDIRECT_DESC = 1 << 28;
        const BLK_SIZE = 1 << 6;
        const TOPOLOGY = 1 << 10;
    }
}

bitflags! {
    struct DescFlags: u16 {
        const NEXT = 1;
        const WRITE = 2;
        const INDIRECT = 4;
    }
}

const VIRTIO_ID_BLOCK: u32 = 2;
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_S_OK: u8 = 0;

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
struct VirtqAvail {
    flags: u16,
    idx: u16,
    ring: [u16; 1],
}

#[repr(C)]
struct VirtqUsedElem {
    id: u32,
    len: u32,
}

#[repr(C)]
struct VirtqUsed {
    flags: u16,
    idx: u16,
    ring: [VirtqUsedElem; 1],
}

#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct RequestHeader {
    type_: u32,
    reserved: u32,
    sector: u64,
}

/// The one-slot indirect virtqueue: `desc[0]` is the indirect descriptor
/// referenced by `avail`/`used`; it points at `desc[1..=3]`, the header,
/// data, and status chain for the single outstanding request.
struct Virtqueue {
    desc: [VirtqDesc; 4],
    avail: VirtqAvail,
    used: VirtqUsed,
    req_header: RequestHeader,
    req_status: u8,
}

const MAX_BLKSZ: usize = 4096;

struct VirtioDiskInner {
    blksz: usize,
    size: u64,
    blkcnt: u64,
    pos: u64,
    opened: bool,
    readonly: bool,
    vq: Virtqueue,
    blkbuf: [u8; MAX_BLKSZ],
}

pub struct VirtioDisk {
    inner: Sleepablelock<VirtioDiskInner>,
}

static DISK: spin::Once<VirtioDisk> = spin::Once::new();

impl VirtioDisk {
    pub fn shared() -> &'static VirtioDisk {
        DISK.get().expect("virtio disk not initialized")
    }

    /// Negotiates features, sets up the virtqueue, and installs the
    /// singleton. Called once during kernel init.
    pub fn init() {
        DISK.call_once(|| {
            assert_eq!(reg_read(Reg::DeviceId), VIRTIO_ID_BLOCK);

            reg_write(Reg::Status, 0);
            let mut status = DeviceStatus::ACKNOWLEDGE;
            reg_write(Reg::Status, status.bits());
            status |= DeviceStatus::DRIVER;
            reg_write(Reg::Status, status.bits());
            fence(Ordering::SeqCst);

            let device_features = Features::from_bits_truncate(reg_read(Reg::DeviceFeatures));
            let needed = Features::RING_RESET | Features::INDIRECT_DESC;
            assert!(
                device_features.contains(needed),
                "virtio disk: missing required features"
            );
            let wanted = Features::BLK_SIZE | Features::TOPOLOGY;
            let enabled = needed | (device_features & wanted);
            reg_write(Reg::DriverFeatures, enabled.bits());
            status |= DeviceStatus::FEATURES_OK;
            reg_write(Reg::Status, status.bits());
            fence(Ordering::SeqCst);
            assert!(
                DeviceStatus::from_bits_truncate(reg_read(Reg::Status))
                    .contains(DeviceStatus::FEATURES_OK),
                "virtio disk: device rejected our feature set"
            );

            let blksz = if enabled.contains(Features::BLK_SIZE) {
                reg_read(Reg::ConfigBlkSize) as usize
            } else {
                512
            };
            assert!(blksz <= MAX_BLKSZ, "virtio disk: block size too large");

            let capacity_sectors = reg_read(Reg::ConfigCapacity) as u64;
            let size = capacity_sectors * 512;

            reg_write(Reg::GuestPageSize, crate::riscv::PGSIZE as u32);
            reg_write(Reg::QueueSel, 0);
            assert!(reg_read(Reg::QueueNumMax) >= 1, "virtio disk: no queue 0");
            reg_write(Reg::QueueNum, 1);
            reg_write(Reg::QueueAlign, crate::riscv::PGSIZE as u32);

            let inner = VirtioDiskInner {
                blksz,
                size,
                blkcnt: size / blksz as u64,
                pos: 0,
                opened: false,
                readonly: false,
                vq: Virtqueue {
                    desc: [VirtqDesc {
                        addr: 0,
                        len: 0,
                        flags: 0,
                        next: 0,
                    }; 4],
                    avail: VirtqAvail {
                        flags: 0,
                        idx: 0,
                        ring: [0; 1],
                    },
                    used: VirtqUsed {
                        flags: 0,
                        idx: 0,
                        ring: [VirtqUsedElem { id: 0, len: 0 }],
                    },
                    req_header: RequestHeader {
                        type_: 0,
                        reserved: 0,
                        sector: 0,
                    },
                    req_status: 0,
                },
                blkbuf: [0; MAX_BLKSZ],
            };

            let disk = VirtioDisk {
                inner: Sleepablelock::new("virtio_disk", inner),
            };
            {
                let mut guard = disk.inner.lock();
                let vq_pfn = (&guard.vq as *const Virtqueue as usize) >> crate::riscv::PGSHIFT;
                // The queue's physical frame number must be written after
                // its contents exist, since the device may read it back
                // immediately.
                reg_write(Reg::QueuePfn, vq_pfn as u32);
                guard.vq.desc[0].flags = DescFlags::INDIRECT.bits();
                guard.vq.desc[0].next = 1;
            }

            status |= DeviceStatus::DRIVER_OK;
            reg_write(Reg::Status, status.bits());
            fence(Ordering::SeqCst);

            disk
        });
    }

    /// Runs on a VirtIO interrupt: reads the status byte of the just
    /// completed request and wakes anyone waiting on it. Never blocks, so
    /// it is always safe from interrupt context.
    pub fn isr(&self) {
        if reg_read(Reg::InterruptStatus) & 0x1 == 0 {
            return;
        }
        let guard = self.inner.lock();
        reg_write(Reg::InterruptAck, reg_read(Reg::InterruptStatus) & 0x1);
        fence(Ordering::SeqCst);
        guard.wakeup();
    }

    fn open(&self) -> IoResult<()> {
        let mut guard = self.inner.lock();
        if guard.opened {
            return Err(SysError::Busy);
        }
        guard.opened = true;
        guard.pos = 0;
        Ok(())
    }

    fn close(&self) {
        self.inner.lock().opened = false;
    }

    /// Submits the request currently described by `vq.req_header` /
    /// `vq.desc[2]` and blocks until the device signals completion.
    fn submit_and_wait(guard: &mut crate::lock::SleepablelockGuard<'_, VirtioDiskInner>) {
        guard.vq.desc[1].addr = &guard.vq.req_header as *const _ as u64;
        guard.vq.desc[1].len = core::mem::size_of::<RequestHeader>() as u32;
        guard.vq.desc[1].flags = DescFlags::NEXT.bits();
        guard.vq.desc[1].next = 2;

        guard.vq.desc[3].addr = &guard.vq.req_status as *const _ as u64;
        guard.vq.desc[3].len = 1;
        guard.vq.desc[3].flags = DescFlags::WRITE.bits();
        guard.vq.desc[3].next = 0;

        guard.vq.avail.ring[0] = 0;
        fence(Ordering::SeqCst);
        guard.vq.avail.idx = guard.vq.avail.idx.wrapping_add(1);
        fence(Ordering::SeqCst);
        reg_write(Reg::QueueNotify, 0);

        let intr_was_enabled = kernel().scheduler().intr_disable();
        guard.sleep();
        kernel().scheduler().intr_restore(intr_was_enabled);
    }

    fn read(&self, buf: &mut [u8]) -> IoResult<usize> {
        let mut guard = self.inner.lock();
        let blksz = guard.blksz;
        let mut total = 0;
        while total < buf.len() && guard.pos < guard.size {
            let sector = guard.pos / blksz as u64;
            let off = (guard.pos % blksz as u64) as usize;
            let chunk = (blksz - off).min(buf.len() - total);

            guard.vq.req_header.type_ = VIRTIO_BLK_T_IN;
            guard.vq.req_header.sector = sector;
            guard.vq.desc[2].addr = guard.blkbuf.as_ptr() as u64;
            guard.vq.desc[2].len = blksz as u32;
            guard.vq.desc[2].flags = (DescFlags::NEXT | DescFlags::WRITE).bits();
            guard.vq.desc[2].next = 3;

            Self::submit_and_wait(&mut guard);
            if guard.vq.req_status != VIRTIO_BLK_S_OK {
                return Err(SysError::InvalidArgument);
            }

            buf[total..total + chunk].copy_from_slice(&guard.blkbuf[off..off + chunk]);
            guard.pos += chunk as u64;
            total += chunk;
        }
        Ok(total)
    }

    /// Writes `buf` at the device's current position. Any write that
    /// doesn't cover a whole block first reads that block in (so the
    /// untouched bytes survive), then overwrites the touched range and
    /// writes the block back out.
    fn write(&self, buf: &[u8]) -> IoResult<usize> {
        let mut guard = self.inner.lock();
        if guard.readonly {
            return Err(SysError::InvalidArgument);
        }
        let blksz = guard.blksz;
        let mut total = 0;
        while total < buf.len() && guard.pos < guard.size {
            let sector = guard.pos / blksz as u64;
            let off = (guard.pos % blksz as u64) as usize;
            let chunk = (blksz - off).min(buf.len() - total);

            if chunk < blksz {
                guard.vq.req_header.type_ = VIRTIO_BLK_T_IN;
                guard.vq.req_header.sector = sector;
                guard.vq.desc[2].addr = guard.blkbuf.as_ptr() as u64;
                guard.vq.desc[2].len = blksz as u32;
                guard.vq.desc[2].flags = (DescFlags::NEXT | DescFlags::WRITE).bits();
                guard.vq.desc[2].next = 3;
                Self::submit_and_wait(&mut guard);
                if guard.vq.req_status != VIRTIO_BLK_S_OK {
                    return Err(SysError::InvalidArgument);
                }
            }

            guard.blkbuf[off..off + chunk].copy_from_slice(&buf[total..total + chunk]);

            guard.vq.req_header.type_ = VIRTIO_BLK_T_OUT;
            guard.vq.req_header.sector = sector;
            guard.vq.desc[2].addr = guard.blkbuf.as_ptr() as u64;
            guard.vq.desc[2].len = blksz as u32;
            guard.vq.desc[2].flags = DescFlags::NEXT.bits();
            guard.vq.desc[2].next = 3;
            Self::submit_and_wait(&mut guard);
            if guard.vq.req_status != VIRTIO_BLK_S_OK {
                return Err(SysError::InvalidArgument);
            }

            guard.pos += chunk as u64;
            total += chunk;
        }
        Ok(total)
    }

    fn ctl(&self, cmd: IoCtl) -> IoResult<u64> {
        let mut guard = self.inner.lock();
        match cmd {
            IoCtl::GetLen => Ok(guard.size),
            IoCtl::GetPos => Ok(guard.pos),
            IoCtl::SetPos(p) => {
                if p > guard.size {
                    return Err(SysError::InvalidArgument);
                }
                guard.pos = p;
                Ok(0)
            }
            IoCtl::GetBlkSz => Ok(guard.blksz as u64),
        }
    }
}

/// Opens the shared block device, failing with `Busy` if it is already
/// open (there is only ever one handle to the one disk in this system).
pub fn open() -> IoResult<()> {
    VirtioDisk::shared().open()
}
