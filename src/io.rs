//! A uniform byte-stream I/O handle with `{read, write, ctl, close}` and a
//! reference count, used for everything that looks like a stream of bytes
//! to its caller: a filesystem file, the block device itself, and the
//! in-memory buffer handle the ELF loader reads an executable through.
//!
//! Handles are tagged by an explicit small enum instead of recovered by
//! pointer arithmetic from an embedded vtable: a caller holding a `Handle`
//! always knows its `IoKind` and dispatches on it directly.
//!
//! There is no heap, so `Handle`s themselves live in a fixed-size static
//! pool: `alloc_file`/`alloc_block_device` claim a free slot (`refs == 0`)
//! and hand back a `&'static Handle`, the same shape `fs.rs` and `elf.rs`
//! already expect to hold onto across a file's lifetime.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use array_macro::array;

use crate::lock::Spinlock;
use crate::param::{FS_MAXOPEN, PROCESS_IOMAX};
use crate::virtio::VirtioDisk;

/// Control commands every handle must at least recognize; unrecognized
/// ones fail with `SysError::ENOTSUP`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IoCtl {
    /// Total length of the underlying stream, in bytes.
    GetLen,
    /// Current stream position.
    GetPos,
    /// Set the stream position to the given offset.
    SetPos(u64),
    /// Block size the device transfers in.
    GetBlkSz,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SysError {
    NotSupported,
    InvalidArgument,
    BadFd,
    TooManyOpenFiles,
    Busy,
}

impl SysError {
    /// The negative `isize` this error becomes at the syscall ABI
    /// boundary.
    pub fn as_retval(self) -> isize {
        match self {
            SysError::NotSupported => -1,
            SysError::InvalidArgument => -2,
            SysError::BadFd => -3,
            SysError::TooManyOpenFiles => -4,
            SysError::Busy => -5,
        }
    }
}

pub type IoResult<T> = Result<T, SysError>;

/// What kind of resource a `Handle` refers to, and thus which concrete
/// implementation its operations dispatch to.
#[derive(Clone, Copy)]
enum IoKind {
    /// A filesystem file, identified by its slot in the open-file pool.
    File(usize),
    /// The (singleton) block device.
    BlockDevice,
}

/// A reference-counted handle over one of the kinds above, living in the
/// static pool below. `kind` is only ever written while holding
/// `HANDLE_POOL_LOCK` with `refs == 0`, and only ever read while `refs >
/// 0`, so the `UnsafeCell` never sees concurrent access.
pub struct Handle {
    kind: UnsafeCell<IoKind>,
    refs: AtomicUsize,
}

unsafe impl Sync for Handle {}

impl Handle {
    const EMPTY: Handle = Handle {
        kind: UnsafeCell::new(IoKind::BlockDevice),
        refs: AtomicUsize::new(0),
    };

    fn kind(&self) -> IoKind {
        // SAFETY: a live `Handle` (refs > 0) never has its `kind` mutated.
        unsafe { *self.kind.get() }
    }

    /// Increments the reference count, as when a handle is duplicated
    /// into a child's fd table across `fork`.
    pub fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(&self, buf: &mut [u8]) -> IoResult<usize> {
        match self.kind() {
            IoKind::File(slot) => crate::fs::filesystem().read(slot, buf),
            IoKind::BlockDevice => VirtioDisk::shared().read(buf),
        }
    }

    pub fn write(&self, buf: &[u8]) -> IoResult<usize> {
        match self.kind() {
            IoKind::File(slot) => crate::fs::filesystem().write(slot, buf),
            IoKind::BlockDevice => VirtioDisk::shared().write(buf),
        }
    }

    pub fn ctl(&self, cmd: IoCtl) -> IoResult<u64> {
        match self.kind() {
            IoKind::File(slot) => crate::fs::filesystem().ctl(slot, cmd),
            IoKind::BlockDevice => VirtioDisk::shared().ctl(cmd),
        }
    }

    /// Decrements the reference count; releases the underlying resource
    /// and returns the slot to the pool once it reaches zero.
    pub fn close(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            match self.kind() {
                IoKind::File(slot) => crate::fs::filesystem().close(slot),
                IoKind::BlockDevice => VirtioDisk::shared().close(),
            }
        }
    }
}

/// One slot per concurrently open file plus headroom for the block device
/// and any handle briefly held outside a process's own fd table (e.g. the
/// boot-time filesystem image handle before `exec` takes it over).
const HANDLE_POOL_CAP: usize = FS_MAXOPEN + PROCESS_IOMAX + 1;

static HANDLE_POOL: [Handle; HANDLE_POOL_CAP] = array![_ => Handle::EMPTY; HANDLE_POOL_CAP];
static HANDLE_POOL_LOCK: Spinlock<()> = Spinlock::new("handle_pool", ());

fn alloc_slot(kind: IoKind) -> IoResult<&'static Handle> {
    let _guard = HANDLE_POOL_LOCK.lock();
    let slot = HANDLE_POOL
        .iter()
        .find(|h| h.refs.load(Ordering::Relaxed) == 0)
        .ok_or(SysError::TooManyOpenFiles)?;
    // SAFETY: still `refs == 0` under the pool lock, so no other holder
    // can be reading `kind` concurrently.
    unsafe { *slot.kind.get() = kind };
    slot.refs.store(1, Ordering::Release);
    Ok(slot)
}

impl Handle {
    /// Claims a pool slot wrapping an already-open filesystem slot.
    pub fn alloc_file(slot: usize) -> IoResult<&'static Handle> {
        alloc_slot(IoKind::File(slot))
    }

    /// Claims a pool slot wrapping the singleton block device.
    pub fn alloc_block_device() -> IoResult<&'static Handle> {
        alloc_slot(IoKind::BlockDevice)
    }
}

/// The `devopen` syscall's device registry. Only the VirtIO block device
/// is a named device in this kernel (the console and any other line
/// discipline are out of this crate's scope); `instno` is accepted but
/// unused since there is exactly one instance.
pub fn device_open(name: &[u8], _instno: u32) -> IoResult<&'static Handle> {
    if name != b"blk" {
        return Err(SysError::NotSupported);
    }
    crate::virtio::open()?;
    Handle::alloc_block_device()
}

/// Loops a handle's `read` until `buf` is full or the stream ends,
/// returning short only at end-of-stream.
pub fn read_fully(handle: &Handle, buf: &mut [u8]) -> IoResult<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = handle.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}
