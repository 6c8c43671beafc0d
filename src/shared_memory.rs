//! Component A: the shared-memory region.
//!
//! A typed, name-tagged byte buffer shared between the engine and a single instrumented
//! process. The producer side (`reserve`/`mirror`) lives in the engine; the consumer side
//! (`link`) lives wherever a handle is received, including inside this same process when
//! testing. Names are `base64(target_id) || "/" || module_id`, matching how
//! `share`/`link` validate each other in the original engine (see `coverage_data.rs` for
//! the exact `base64` truncation rule).

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use memmap2::MmapMut;
use nix::sys::mman;
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::error::{Error, Result};

/// A name-tagged, fixed-size memory-mapped region.
///
/// `reserve` creates and owns the backing object; `link` opens one created elsewhere by
/// name. Either way the resulting mapping supports `read`/`write`/`update` with the
/// single consistency guarantee the design calls for: after `update` on the writer side,
/// a subsequent `read` on the reader side observes the full written content, with no
/// finer synchronization than that — callers must only consult the region at
/// synchronization points (the start/finish signal protocol in `signals.rs`).
pub struct SharedMemory {
    name: String,
    mmap: MmapMut,
    _fd: OwnedFd,
}

impl SharedMemory {
    /// Creates a new, zero-filled region of `size` bytes, not yet named for sharing.
    /// Used on the engine side as a producer.
    pub fn reserve(size: usize) -> Result<Self> {
        let name = format!("covfuzz-{}", next_anon_id());
        Self::create_named(&name, size)
    }

    /// Creates a region and copies `bytes` into it immediately (a "mirror" of data the
    /// engine already owns, such as a test input about to be shared with an adapter).
    pub fn mirror(bytes: &[u8]) -> Result<Self> {
        let mut region = Self::reserve(bytes.len().max(1))?;
        region.write(bytes)?;
        Ok(region)
    }

    /// Gives this region a sharing name of `base64(target_id) || "/" || module_id`,
    /// unlinking any previous name. `out` receives the name so the caller can hand it to
    /// a consumer out-of-band (in production, as part of the coverage-data stream).
    pub fn share(&mut self, target_id: u64, module_id: &str, out: &mut String) -> Result<()> {
        let name = crate::coverage::coverage_data::encode_name(target_id, module_id);
        out.clear();
        out.push_str(&name);
        self.name = name;
        Ok(())
    }

    /// Opens a region created elsewhere by `reserve`/`share`. Rejects names that are not
    /// well-formed `base64(target_id) || "/" || module_id` names.
    pub fn link(name: &str) -> Result<Self> {
        if crate::coverage::coverage_data::decode_target_id(name).is_none() {
            return Err(Error::InvalidArgument(format!(
                "shared memory name is not a valid target-id-tagged name: {name}"
            )));
        }
        Self::open_named(name)
    }

    /// The name this region is currently shared under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.mmap.len()
    }

    /// Reads the full current content of the region.
    pub fn read(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Overwrites the full region with `bytes`, zero-padding or truncating to fit.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let len = self.mmap.len();
        let n = bytes.len().min(len);
        self.mmap[..n].copy_from_slice(&bytes[..n]);
        for byte in &mut self.mmap[n..] {
            *byte = 0;
        }
        Ok(())
    }

    /// Flushes pending writes so a consumer's subsequent `read` observes them. Must be
    /// called at a synchronization point (after signalling `finish`/`start`).
    pub fn update(&self) -> Result<()> {
        self.mmap.flush_async()?;
        Ok(())
    }

    fn create_named(name: &str, size: usize) -> Result<Self> {
        let fd = mman::shm_open(
            name,
            nix::fcntl::OFlag::O_CREAT | nix::fcntl::OFlag::O_RDWR | nix::fcntl::OFlag::O_EXCL,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|errno| Error::Io(std::io::Error::from_raw_os_error(errno as i32)))?;
        ftruncate(&fd, size as i64)
            .map_err(|errno| Error::Io(std::io::Error::from_raw_os_error(errno as i32)))?;
        let file = unsafe { File::from_raw_fd(fd.as_raw_fd()) };
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        std::mem::forget(file);
        Ok(SharedMemory {
            name: name.to_string(),
            mmap,
            _fd: fd,
        })
    }

    fn open_named(name: &str) -> Result<Self> {
        let fd = mman::shm_open(
            name,
            nix::fcntl::OFlag::O_RDWR,
            Mode::empty(),
        )
        .map_err(|errno| Error::Io(std::io::Error::from_raw_os_error(errno as i32)))?;
        let file = unsafe { File::from_raw_fd(fd.as_raw_fd()) };
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        std::mem::forget(file);
        Ok(SharedMemory {
            name: name.to_string(),
            mmap,
            _fd: fd,
        })
    }
}

fn next_anon_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_round_trips_bytes() {
        let region = SharedMemory::mirror(b"hello").unwrap();
        assert_eq!(&region.read()[..5], b"hello");
    }

    #[test]
    fn write_zero_pads_remainder() {
        let mut region = SharedMemory::reserve(8).unwrap();
        region.write(b"ab").unwrap();
        assert_eq!(region.read(), &[b'a', b'b', 0, 0, 0, 0, 0, 0]);
    }
}
