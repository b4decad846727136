//! User-faultfd page population (§4.1.3). Receives the UFFD handle and
//! region descriptors over a cmsg-capable UDS (fd-passing), pre-maps the
//! snapshot's memory file, and serves page faults on demand by copying
//! 2 MiB-aligned chunks from the mmap into the guest's address space.
//!
//! Two strategies are selectable at runtime via `Strategy::from_env`
//! (§6.1's `DH_VM_NO_UFFD`/`DH_VM_EAGER_MB`/`DH_VM_EAGER_UFFD`): fully lazy
//! (default, every page served on first fault) and eager preload (copy the
//! first N MiB before the fault-serving loop starts, falling back to lazy
//! for the remainder).
//!
//! Hole strategy: a file mmap already returns zero for holes, so a plain
//! copy from the mmap is sufficient — no separate UFFD zero-page operation
//! is used (spec.md §4.1.3 edge-case note; this is the simpler of the two
//! documented strategies and is what this implementation takes).

use std::collections::HashSet;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Mutex;

use dh_types::DhError;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use std::io::IoSliceMut;
use userfaultfd::{Event, Uffd};

const CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Default eager-preload size when `DH_VM_EAGER_UFFD` is set without an
/// explicit `DH_VM_EAGER_MB` (§4.1.3).
pub const DEFAULT_EAGER_MB: usize = 256;

/// A registered memory region the UFFD handler is responsible for.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub base: usize,
    pub len: usize,
}

/// Selects how the handler populates guest memory.
#[derive(Debug, Clone, Copy)]
pub enum Strategy {
    /// Every page is served on first fault (default).
    Lazy,
    /// Copy the first `mb` MiB of each region before serving faults,
    /// falling back to lazy population for the remainder.
    Eager { mb: usize },
}

impl Strategy {
    /// Reads the VM-mode env knobs (§6.1). `DH_VM_NO_UFFD` disables UFFD
    /// outright and returns `None`, signalling the caller to load the
    /// snapshot with a plain file-backed memory backend instead of
    /// spawning this handler at all. Otherwise `DH_VM_EAGER_UFFD` selects
    /// `Eager`, sized by `DH_VM_EAGER_MB` (default
    /// [`DEFAULT_EAGER_MB`]); absent both, the default is `Lazy`.
    pub fn from_env() -> Option<Self> {
        if std::env::var_os("DH_VM_NO_UFFD").is_some() {
            return None;
        }
        if std::env::var_os("DH_VM_EAGER_UFFD").is_some() {
            let mb = std::env::var("DH_VM_EAGER_MB")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(DEFAULT_EAGER_MB);
            return Some(Strategy::Eager { mb });
        }
        Some(Strategy::Lazy)
    }
}

/// Tracks which 2 MiB chunks have already been copied into the guest, so
/// concurrent faults on the same chunk produce exactly one copy and any
/// number of benign "already mapped" no-ops (Testable Property 9).
struct PopulatedChunks {
    seen: Mutex<HashSet<usize>>,
}

impl PopulatedChunks {
    fn new() -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Returns true if this call is the one that should perform the copy.
    fn claim(&self, chunk_base: usize) -> bool {
        self.seen.lock().unwrap().insert(chunk_base)
    }
}

/// Accepts a UFFD file descriptor passed over `handoff_sock` (SCM_RIGHTS),
/// along with the region list, then serves page faults until the fd is
/// closed by the monitor at VM teardown.
///
/// `mem_file` is the snapshot's memory file, pre-mapped read-only; fault
/// handling copies directly out of this mapping.
pub async fn run(
    handoff_sock: &Path,
    mem_file: &Path,
    regions: Vec<Region>,
    strategy: Strategy,
) -> Result<(), DhError> {
    let uffd = accept_uffd_handle(handoff_sock).await?;
    for region in &regions {
        uffd.register(region.base as *mut libc::c_void, region.len)
            .map_err(|e| DhError::prereq_not_met(format!("uffd register failed: {e}")))?;
    }

    let file = std::fs::File::open(mem_file)
        .map_err(|e| DhError::prereq_not_met(format!("cannot open {}: {e}", mem_file.display())))?;
    let file_len = file
        .metadata()
        .map_err(|e| DhError::prereq_not_met(e.to_string()))?
        .len() as usize;
    let mapping = unsafe {
        memmap_readonly(&file, file_len)
            .map_err(|e| DhError::prereq_not_met(format!("mmap of snapshot memory file failed: {e}")))?
    };

    let populated = PopulatedChunks::new();
    if let Strategy::Eager { mb } = strategy {
        eager_preload(&uffd, &mapping, &regions, mb, &populated);
    }
    serve_faults(&uffd, &mapping, &populated).await
}

/// Copies the first `mb` MiB of each region (the whole mapping, treated as
/// one region, if `regions` is empty) into the guest's address space ahead
/// of the fault-serving loop. Chunks are claimed through the same
/// `PopulatedChunks` set `serve_faults` consults, so a subsequent fault in
/// the preloaded range is a no-op rather than a second copy.
fn eager_preload(uffd: &Uffd, mapping: &MappedFile, regions: &[Region], mb: usize, populated: &PopulatedChunks) {
    let preload_bytes = mb.saturating_mul(1024 * 1024);
    let spans: Vec<(usize, usize)> = if regions.is_empty() {
        vec![(0, mapping.len())]
    } else {
        regions.iter().map(|r| (r.base, r.len)).collect()
    };

    for (base, len) in spans {
        let preload_len = preload_bytes.min(len);
        let mut offset = 0usize;
        while offset < preload_len {
            let chunk_base = base + offset;
            offset += CHUNK_SIZE;
            if !populated.claim(chunk_base) {
                continue;
            }
            let copy_len = CHUNK_SIZE.min(mapping.len().saturating_sub(chunk_base));
            if copy_len == 0 {
                continue;
            }
            let src = unsafe { mapping.ptr.add(chunk_base) };
            let dst = chunk_base as *mut libc::c_void;
            let result = unsafe { uffd.copy(src as *const libc::c_void, dst, copy_len, true) };
            if let Err(e) = result {
                if !e.to_string().contains("EEXIST") {
                    tracing::warn!(chunk = chunk_base, error = %e, "eager uffd preload copy failed");
                }
            }
        }
    }
}

async fn serve_faults(uffd: &Uffd, mapping: &MappedFile, populated: &PopulatedChunks) -> Result<(), DhError> {
    let raw_fd = uffd.as_raw_fd();
    loop {
        wait_readable(raw_fd).await?;
        match uffd.read_event() {
            Ok(Some(Event::Pagefault { addr, .. })) => {
                let fault_addr = addr as usize;
                let chunk_base = fault_addr - (fault_addr % CHUNK_SIZE);
                if populated.claim(chunk_base) {
                    let len = CHUNK_SIZE.min(mapping.len.saturating_sub(chunk_base));
                    if len == 0 {
                        continue;
                    }
                    let src = unsafe { mapping.ptr.add(chunk_base) };
                    let dst = chunk_base as *mut libc::c_void;
                    let result = unsafe { uffd.copy(src as *const libc::c_void, dst, len, true) };
                    if let Err(e) = result {
                        // "destination already mapped" races against another
                        // handler instance or a prior copy are benign.
                        if !e.to_string().contains("EEXIST") {
                            tracing::warn!(chunk = chunk_base, error = %e, "uffd copy failed");
                        }
                    }
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => continue,
            Err(e) => {
                return Err(DhError::prereq_not_met(format!("uffd read_event failed: {e}")));
            }
        }
        // The handler exits when the fd is closed by the monitor on
        // instance teardown, surfacing as a read error above.
    }
}

async fn wait_readable(fd: RawFd) -> Result<(), DhError> {
    let async_fd = tokio::io::unix::AsyncFd::new(PollableFd(fd))
        .map_err(|e| DhError::prereq_not_met(e.to_string()))?;
    let mut guard = async_fd
        .readable()
        .await
        .map_err(|e| DhError::prereq_not_met(e.to_string()))?;
    guard.clear_ready();
    Ok(())
}

struct PollableFd(RawFd);

impl AsRawFd for PollableFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct MappedFile {
    ptr: *const u8,
    len: usize,
    _file: std::fs::File,
}

unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    fn len(&self) -> usize {
        self.len
    }
}

unsafe fn memmap_readonly(file: &std::fs::File, len: usize) -> std::io::Result<MappedFile> {
    let ptr = libc::mmap(
        std::ptr::null_mut(),
        len,
        libc::PROT_READ,
        libc::MAP_SHARED,
        file.as_raw_fd(),
        0,
    );
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    Ok(MappedFile {
        ptr: ptr as *const u8,
        len,
        _file: file.try_clone()?,
    })
}

/// Blocks on a single `recvmsg` with an `SCM_RIGHTS` ancillary payload
/// carrying the UFFD fd, as the monitor hands it off after creating the
/// userfaultfd object with `UFFDIO_API` negotiated.
async fn accept_uffd_handle(handoff_sock: &Path) -> Result<Uffd, DhError> {
    if handoff_sock.exists() {
        let _ = std::fs::remove_file(handoff_sock);
    }
    let listener = tokio::net::UnixListener::bind(handoff_sock)
        .map_err(|e| DhError::prereq_not_met(format!("cannot bind {}: {e}", handoff_sock.display())))?;
    let (stream, _) = listener
        .accept()
        .await
        .map_err(|e| DhError::prereq_not_met(e.to_string()))?;
    let std_stream = stream
        .into_std()
        .map_err(|e| DhError::prereq_not_met(e.to_string()))?;
    std_stream
        .set_nonblocking(false)
        .map_err(|e| DhError::prereq_not_met(e.to_string()))?;
    let raw = std_stream.as_raw_fd();

    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let mut io_buf = [0u8; 8];
    let mut iov = [IoSliceMut::new(&mut io_buf)];
    let msg = recvmsg::<()>(raw, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
        .map_err(|e| DhError::prereq_not_met(format!("recvmsg failed: {e}")))?;

    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(fd) = fds.into_iter().next() {
                let owned: OwnedFd = unsafe { OwnedFd::from_raw_fd(fd) };
                return Ok(unsafe { Uffd::from_raw_fd(owned.into_raw_fd()) });
            }
        }
    }
    Err(DhError::prereq_not_met(
        "no uffd file descriptor received over handoff socket",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populated_chunks_claims_once() {
        let p = PopulatedChunks::new();
        assert!(p.claim(0));
        assert!(!p.claim(0));
        assert!(p.claim(CHUNK_SIZE));
    }

    #[test]
    fn chunk_base_rounds_down_to_2mib() {
        let fault_addr = CHUNK_SIZE * 3 + 4096;
        let chunk_base = fault_addr - (fault_addr % CHUNK_SIZE);
        assert_eq!(chunk_base, CHUNK_SIZE * 3);
    }

    /// Serializes the env-var-dependent tests below; `std::env` is
    /// process-global so concurrent test threads would otherwise race.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn strategy_from_env_defaults_to_lazy() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("DH_VM_NO_UFFD");
        std::env::remove_var("DH_VM_EAGER_UFFD");
        std::env::remove_var("DH_VM_EAGER_MB");
        assert!(matches!(Strategy::from_env(), Some(Strategy::Lazy)));
    }

    #[test]
    fn strategy_from_env_no_uffd_disables_the_handler() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("DH_VM_NO_UFFD", "1");
        assert!(Strategy::from_env().is_none());
        std::env::remove_var("DH_VM_NO_UFFD");
    }

    #[test]
    fn strategy_from_env_eager_defaults_mb() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("DH_VM_NO_UFFD");
        std::env::remove_var("DH_VM_EAGER_MB");
        std::env::set_var("DH_VM_EAGER_UFFD", "1");
        assert!(matches!(Strategy::from_env(), Some(Strategy::Eager { mb }) if mb == DEFAULT_EAGER_MB));
        std::env::remove_var("DH_VM_EAGER_UFFD");
    }

    #[test]
    fn strategy_from_env_eager_respects_explicit_mb() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("DH_VM_NO_UFFD");
        std::env::set_var("DH_VM_EAGER_UFFD", "1");
        std::env::set_var("DH_VM_EAGER_MB", "64");
        assert!(matches!(Strategy::from_env(), Some(Strategy::Eager { mb }) if mb == 64));
        std::env::remove_var("DH_VM_EAGER_UFFD");
        std::env::remove_var("DH_VM_EAGER_MB");
    }

    #[test]
    fn eager_preload_claims_only_the_requested_prefix() {
        let populated = PopulatedChunks::new();
        // Exercise the chunk-claiming math `eager_preload` uses without a
        // real UFFD handle: two chunks' worth of "mb" should claim exactly
        // two chunk bases out of a four-chunk region.
        let region_len = CHUNK_SIZE * 4;
        let preload_len = (2 * CHUNK_SIZE).min(region_len);
        let mut offset = 0usize;
        let mut claimed = Vec::new();
        while offset < preload_len {
            if populated.claim(offset) {
                claimed.push(offset);
            }
            offset += CHUNK_SIZE;
        }
        assert_eq!(claimed, vec![0, CHUNK_SIZE]);
        assert!(!populated.claim(0));
        assert!(populated.claim(CHUNK_SIZE * 2));
    }
}
