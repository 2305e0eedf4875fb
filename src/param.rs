//! Compile-time kernel parameters.

/// Maximum number of processes.
pub const NPROC: usize = 16;

/// Open io interfaces per process.
pub const PROCESS_IOMAX: usize = 16;

/// Open files tracked by the filesystem at once.
pub const FS_MAXOPEN: usize = 32;

/// Number of signal numbers, including the unused slot 0.
pub const NSIG: usize = 10;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Block size used by the on-disk filesystem, in bytes.
pub const FS_BLKSZ: usize = 4096;

/// Maximum length of a file name in a directory entry, including the NUL.
pub const FS_NAMELEN: usize = 32;

/// Number of directory entries that fit in the boot block.
pub const FS_DIRENTS: usize = 63;

/// Number of direct data-block pointers an inode carries.
pub const FS_DIRECT_BLOCKS: usize = 1023;

/// Timer ticks per second, used to convert `usleep`'s microsecond argument
/// into a tick count for `Scheduler::alarm_sleep`.
pub const TIMER_FREQ: u64 = 10_000_000;

/// Process id of the process the kernel registers the boot thread as.
pub const MAIN_PID: usize = 0;
