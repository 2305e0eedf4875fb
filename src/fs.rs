//! The on-disk filesystem: a boot block of directory entries, an inode
//! table addressed by inode number, and a data-block region, all laid
//! out back-to-back on the block device. Reading and writing a file
//! means translating a file offset into a disk offset through the
//! file's inode and issuing seeks+reads/writes on the block handle (A).
//!
//! Deliberately simple, matching the Non-goals: no file creation,
//! deletion, rename, growth, or directories beyond the flat root the
//! boot block already describes.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::io::{read_fully, Handle, IoCtl, IoResult, SysError};
use crate::lock::Sleepablelock;
use crate::param::{FS_BLKSZ, FS_DIRECT_BLOCKS, FS_DIRENTS, FS_MAXOPEN, FS_NAMELEN};

#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Dentry {
    pub name: [u8; FS_NAMELEN],
    pub inode: u32,
    reserved: [u8; 28],
}

const_assert_eq!(core::mem::size_of::<Dentry>(), 64);

#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct BootBlock {
    pub num_dentry: u32,
    pub num_inodes: u32,
    pub num_data: u32,
    reserved: [u8; 52],
    pub dentries: [Dentry; FS_DIRENTS],
}

const_assert_eq!(core::mem::size_of::<BootBlock>(), FS_BLKSZ);

#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Inode {
    pub byte_len: u32,
    pub data_block_num: [u32; FS_DIRECT_BLOCKS],
}

const_assert_eq!(core::mem::size_of::<Inode>(), FS_BLKSZ);

impl Inode {
    /// Highest block index this inode layout can hold a pointer for.
    pub const DIRECT_BLOCKS: usize = FS_DIRECT_BLOCKS;
}

struct OpenFile {
    in_use: bool,
    inode_number: u32,
    file_position: u64,
    file_size: u64,
}

impl OpenFile {
    const EMPTY: Self = Self {
        in_use: false,
        inode_number: 0,
        file_position: 0,
        file_size: 0,
    };
}

struct FileSystemInner {
    blkio: Option<&'static Handle>,
    boot_block: BootBlock,
    open_files: [OpenFile; FS_MAXOPEN],
}

pub struct FileSystem {
    inner: Sleepablelock<FileSystemInner>,
}

static FS: spin::Once<FileSystem> = spin::Once::new();

pub fn filesystem() -> &'static FileSystem {
    FS.get().expect("filesystem not mounted")
}

impl FileSystem {
    /// Reads the boot block off `blkio` and installs the singleton.
    pub fn mount(blkio: &'static Handle) -> IoResult<()> {
        blkio.ctl(IoCtl::SetPos(0))?;
        let mut buf = [0u8; FS_BLKSZ];
        let n = read_fully(blkio, &mut buf)?;
        if n != FS_BLKSZ {
            return Err(SysError::InvalidArgument);
        }
        let boot_block = BootBlock::read_from(&buf[..]).ok_or(SysError::InvalidArgument)?;
        FS.call_once(|| FileSystem {
            inner: Sleepablelock::new(
                "filesystem",
                FileSystemInner {
                    blkio: Some(blkio),
                    boot_block,
                    open_files: [OpenFile::EMPTY; FS_MAXOPEN],
                },
            ),
        });
        Ok(())
    }

    fn inode_offset(inode_number: u32) -> u64 {
        FS_BLKSZ as u64 + inode_number as u64 * FS_BLKSZ as u64
    }

    fn data_offset(inner: &FileSystemInner, data_block_num: u32) -> u64 {
        FS_BLKSZ as u64
            + inner.boot_block.num_inodes as u64 * FS_BLKSZ as u64
            + data_block_num as u64 * FS_BLKSZ as u64
    }

    fn read_inode(inner: &FileSystemInner, inode_number: u32) -> IoResult<Inode> {
        let blkio = inner.blkio.ok_or(SysError::InvalidArgument)?;
        blkio.ctl(IoCtl::SetPos(Self::inode_offset(inode_number)))?;
        let mut buf = [0u8; FS_BLKSZ];
        let n = read_fully(blkio, &mut buf)?;
        if n != FS_BLKSZ {
            return Err(SysError::InvalidArgument);
        }
        Inode::read_from(&buf[..]).ok_or(SysError::InvalidArgument)
    }

    /// Finds `name` in the boot block's directory entries and allocates
    /// an open-file slot for it. Returns the slot index.
    pub fn open(&self, name: &[u8]) -> IoResult<usize> {
        let mut guard = self.inner.lock();

        let slot = guard
            .open_files
            .iter()
            .position(|f| !f.in_use)
            .ok_or(SysError::TooManyOpenFiles)?;

        let dentry = guard
            .boot_block
            .dentries
            .iter()
            .take(guard.boot_block.num_dentry as usize)
            .find(|d| {
                let len = d.name.iter().position(|&b| b == 0).unwrap_or(FS_NAMELEN);
                &d.name[..len] == name
            })
            .copied()
            .ok_or(SysError::InvalidArgument)?;

        let inode = Self::read_inode(&guard, dentry.inode)?;

        guard.open_files[slot] = OpenFile {
            in_use: true,
            inode_number: dentry.inode,
            file_position: 0,
            file_size: inode.byte_len as u64,
        };
        Ok(slot)
    }

    pub fn close(&self, slot: usize) {
        self.inner.lock().open_files[slot].in_use = false;
    }

    pub fn read(&self, slot: usize, buf: &mut [u8]) -> IoResult<usize> {
        let mut guard = self.inner.lock();
        if !guard.open_files[slot].in_use {
            return Err(SysError::BadFd);
        }
        let (inode_number, mut pos, size) = {
            let f = &guard.open_files[slot];
            (f.inode_number, f.file_position, f.file_size)
        };
        if pos >= size {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(size - pos) as usize;
        let inode = Self::read_inode(&guard, inode_number)?;

        let blkio = guard.blkio.ok_or(SysError::InvalidArgument)?;
        let mut total = 0usize;
        while total < n {
            let block_index = (pos / FS_BLKSZ as u64) as usize;
            let block_off = (pos % FS_BLKSZ as u64) as usize;
            if block_index >= Inode::DIRECT_BLOCKS {
                break;
            }
            let data_block_num = inode.data_block_num[block_index];
            let chunk = (FS_BLKSZ - block_off).min(n - total);

            blkio.ctl(IoCtl::SetPos(Self::data_offset(&guard, data_block_num)))?;
            let mut block = [0u8; FS_BLKSZ];
            let got = read_fully(blkio, &mut block)?;
            if got != FS_BLKSZ {
                return Err(SysError::InvalidArgument);
            }
            buf[total..total + chunk].copy_from_slice(&block[block_off..block_off + chunk]);

            total += chunk;
            pos += chunk as u64;
        }
        guard.open_files[slot].file_position = pos;
        Ok(total)
    }

    /// Writes into the file's existing data blocks; never grows the file
    /// past its recorded `byte_len`.
    pub fn write(&self, slot: usize, buf: &[u8]) -> IoResult<usize> {
        let mut guard = self.inner.lock();
        if !guard.open_files[slot].in_use {
            return Err(SysError::BadFd);
        }
        let (inode_number, mut pos, size) = {
            let f = &guard.open_files[slot];
            (f.inode_number, f.file_position, f.file_size)
        };
        if pos >= size {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(size - pos) as usize;
        let inode = Self::read_inode(&guard, inode_number)?;

        let blkio = guard.blkio.ok_or(SysError::InvalidArgument)?;
        let mut total = 0usize;
        while total < n {
            let block_index = (pos / FS_BLKSZ as u64) as usize;
            let block_off = (pos % FS_BLKSZ as u64) as usize;
            if block_index >= Inode::DIRECT_BLOCKS {
                break;
            }
            let data_block_num = inode.data_block_num[block_index];
            let chunk = (FS_BLKSZ - block_off).min(n - total);
            let data_off = Self::data_offset(&guard, data_block_num);

            let mut block = [0u8; FS_BLKSZ];
            blkio.ctl(IoCtl::SetPos(data_off))?;
            let got = read_fully(blkio, &mut block)?;
            if got != FS_BLKSZ {
                return Err(SysError::InvalidArgument);
            }
            block[block_off..block_off + chunk].copy_from_slice(&buf[total..total + chunk]);

            blkio.ctl(IoCtl::SetPos(data_off))?;
            let wrote = blkio.write(&block)?;
            if wrote != FS_BLKSZ {
                return Err(SysError::InvalidArgument);
            }

            total += chunk;
            pos += chunk as u64;
        }
        guard.open_files[slot].file_position = pos;
        Ok(total)
    }

    /// Number of loadable user programs the boot block describes, used by
    /// `numprogs`/`prognames` to let a shell list what's runnable.
    pub fn num_programs(&self) -> u32 {
        self.inner.lock().boot_block.num_dentry
    }

    /// The `i`th directory entry's name, zero-padded to `FS_NAMELEN`.
    pub fn program_name(&self, i: usize) -> Option<[u8; FS_NAMELEN]> {
        let guard = self.inner.lock();
        if i as u32 >= guard.boot_block.num_dentry {
            return None;
        }
        Some(guard.boot_block.dentries[i].name)
    }

    pub fn ctl(&self, slot: usize, cmd: IoCtl) -> IoResult<u64> {
        let mut guard = self.inner.lock();
        if !guard.open_files[slot].in_use {
            return Err(SysError::BadFd);
        }
        match cmd {
            IoCtl::GetLen => Ok(guard.open_files[slot].file_size),
            IoCtl::GetPos => Ok(guard.open_files[slot].file_position),
            IoCtl::SetPos(p) => {
                if p > guard.open_files[slot].file_size {
                    return Err(SysError::InvalidArgument);
                }
                guard.open_files[slot].file_position = p;
                Ok(0)
            }
            IoCtl::GetBlkSz => Ok(FS_BLKSZ as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_block_and_inode_are_exactly_one_block() {
        assert_eq!(core::mem::size_of::<BootBlock>(), FS_BLKSZ);
        assert_eq!(core::mem::size_of::<Inode>(), FS_BLKSZ);
        assert_eq!(core::mem::size_of::<Dentry>(), 64);
    }

    #[test]
    fn direct_blocks_matches_field_capacity() {
        assert_eq!(Inode::DIRECT_BLOCKS, FS_DIRECT_BLOCKS);
    }
}
