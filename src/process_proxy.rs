//! Component D: the engine's handle onto one instrumented target process.
//!
//! Mirrors `original_source/.../realmfuzzer/engine/process-proxy.{h,cc}`: tracks the
//! LLVM modules an instrumented process has mapped, synchronizes each fuzzing run with it
//! over an [`AsyncEventPair`], and watches for it to crash or exit abnormally. Ownership
//! of the OS process itself is abstracted behind [`ProcessHandle`] so the same state
//! machine drives both a real child process and an in-process fake used by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::coverage::module_proxy::ModuleId;
use crate::coverage::ModulePool;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::shared_memory::SharedMemory;
use crate::signals::{AsyncEventPair, Signals};

/// The terminal disposition of one fuzzing run, reported to the runner. Variant names and
/// exit-code mapping follow the options table in the external interfaces design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzResult {
    NoErrors,
    BadMalloc,
    Crash,
    Death,
    Exit,
    Leak,
    Oom,
    Timeout,
}

impl FuzzResult {
    /// Maps a child process's exit code to a result, per `Options`' configured exit-code
    /// table, falling back to `Exit` (if `detect_exits`) or `NoErrors` for an unmapped
    /// non-zero code.
    pub fn from_exit_code(code: i32, options: &Options) -> FuzzResult {
        if code == options.malloc_exitcode {
            FuzzResult::BadMalloc
        } else if code == options.death_exitcode {
            FuzzResult::Death
        } else if code == options.leak_exitcode {
            FuzzResult::Leak
        } else if code == options.oom_exitcode {
            FuzzResult::Oom
        } else if code != 0 && options.detect_exits {
            FuzzResult::Exit
        } else {
            FuzzResult::NoErrors
        }
    }

    /// Maps a fatal signal (e.g. `SIGSEGV`, `SIGABRT`) to `Crash`. Any signal termination
    /// not explicitly distinguished elsewhere is a crash.
    pub fn from_signal(_signum: i32) -> FuzzResult {
        FuzzResult::Crash
    }
}

/// Memory and scheduling statistics for one instrumented process, collected on request.
/// Field set matches what the runner's `collect_status` reports per process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub target_id: u64,
    pub mem_private_bytes: u64,
    pub mem_shared_bytes: u64,
    pub num_threads: u64,
}

/// How an instrumented process terminated, abstracted away from the OS-specific wait API
/// so fakes can drive the same state machine as a real child.
#[derive(Debug, Clone, Copy)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
}

/// Abstraction over an OS process, implemented for a real `tokio::process::Child` in
/// production and for an in-process fake under `testing`.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> u64;
    async fn wait(&mut self) -> std::io::Result<Termination>;
    fn stats(&self) -> ProcessStats;
    /// Writes a human-readable thread dump into `out`, returning the number of bytes
    /// written. A fake may simply report zero.
    fn dump(&self, out: &mut Vec<u8>) -> usize;
}

/// A real instrumented process, spawned and reaped via `tokio::process`. `target_id` is
/// realized as the child's PID (there is no koid equivalent on Linux, per the design
/// notes). Exit status is decoded via `std`'s `ExitStatusExt`; forcible teardown (when a
/// `Runner` drops a proxy whose process never acked `finish`) reuses the teacher's own
/// `kill_signal` pattern from its forkserver executor, sent via `nix::sys::signal::kill`.
pub struct ChildProcessHandle {
    pid: u64,
    child: tokio::process::Child,
    kill_signal: nix::sys::signal::Signal,
}

impl ChildProcessHandle {
    /// Wraps an already-spawned child. The caller is responsible for having connected
    /// the child's end of the event-pair and shared memory before handing it to
    /// [`ProcessProxy::connect`]. Defaults to `SIGKILL` for forced teardown, same as the
    /// teacher's forkserver executor defaults to `SIGTERM` for a graceful one and falls
    /// back to `SIGKILL` if the process outlives it.
    pub fn new(child: tokio::process::Child) -> Self {
        let pid = child.id().expect("spawned child has a pid") as u64;
        ChildProcessHandle {
            pid,
            child,
            kill_signal: nix::sys::signal::Signal::SIGKILL,
        }
    }

    /// Sends this handle's configured kill signal to the child, used by a `Runner` that
    /// needs to tear down a process stuck mid-run (e.g. after a `run_limit` timeout).
    pub fn kill(&self) -> std::io::Result<()> {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(self.pid as i32), self.kill_signal)
            .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
    }
}

#[async_trait]
impl ProcessHandle for ChildProcessHandle {
    fn pid(&self) -> u64 {
        self.pid
    }

    async fn wait(&mut self) -> std::io::Result<Termination> {
        use std::os::unix::process::ExitStatusExt;
        let status = self.child.wait().await?;
        Ok(match status.signal() {
            Some(signal) => Termination::Signaled(signal),
            None => Termination::Exited(status.code().unwrap_or(0)),
        })
    }

    fn stats(&self) -> ProcessStats {
        read_proc_stats(self.pid)
    }

    fn dump(&self, out: &mut Vec<u8>) -> usize {
        let dump = format!("pid {} has no attached debugger in this build\n", self.pid);
        out.extend_from_slice(dump.as_bytes());
        dump.len()
    }
}

/// Reads `/proc/<pid>/status` for the subset of fields `ProcessStats` reports. Returns a
/// zeroed snapshot if the process has already exited or `/proc` is unavailable (e.g. in
/// a sandboxed test environment), rather than failing `get_stats`, since stats are
/// diagnostic only.
fn read_proc_stats(pid: u64) -> ProcessStats {
    let mut stats = ProcessStats {
        target_id: pid,
        ..Default::default()
    };
    let Ok(text) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
        return stats;
    };
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("VmRSS:") {
            stats.mem_private_bytes = parse_kb_field(value);
        } else if let Some(value) = line.strip_prefix("RssShmem:") {
            stats.mem_shared_bytes = parse_kb_field(value);
        } else if let Some(value) = line.strip_prefix("Threads:") {
            stats.num_threads = value.trim().parse().unwrap_or(0);
        }
    }
    stats
}

fn parse_kb_field(value: &str) -> u64 {
    value
        .trim()
        .trim_end_matches(" kB")
        .trim()
        .parse::<u64>()
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a target id distinct from `INVALID_TARGET_ID`/`TIMEOUT_TARGET_ID`.
pub fn next_target_id() -> u64 {
    NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed)
}

/// The engine's per-process coverage and lifecycle tracker.
pub struct ProcessProxy {
    target_id: u64,
    options: Mutex<Arc<Options>>,
    eventpair: AsyncEventPair,
    pool: Arc<ModulePool>,
    modules: Mutex<HashMap<ModuleId, SharedMemory>>,
    process: Mutex<Box<dyn ProcessHandle>>,
    result: Mutex<FuzzResult>,
}

impl ProcessProxy {
    /// Connects a newly-instrumented process: takes ownership of its event-pair endpoint
    /// and process handle, assigning it a fresh target id.
    pub fn connect(
        options: Arc<Options>,
        pool: Arc<ModulePool>,
        eventpair: AsyncEventPair,
        process: Box<dyn ProcessHandle>,
    ) -> Self {
        ProcessProxy {
            target_id: next_target_id(),
            options: Mutex::new(options),
            eventpair,
            pool,
            modules: Mutex::new(HashMap::new()),
            process: Mutex::new(process),
            result: Mutex::new(FuzzResult::NoErrors),
        }
    }

    pub fn target_id(&self) -> u64 {
        self.target_id
    }

    /// Installs a (possibly updated) fault-exit-code table, per `Runner::configure`
    /// propagating fresh options to every already-connected proxy.
    pub fn configure(&self, options: Arc<Options>) {
        *self.options.lock().unwrap() = options;
    }

    /// Registers a module's counters, obtaining or creating the module-wide proxy for its
    /// identity and handing it this process's live counter buffer.
    pub fn add_module(&self, id: ModuleId, shared_memory: SharedMemory) -> Result<()> {
        self.add_module_with_pc_table(id, shared_memory, None)
    }

    /// Like [`Self::add_module`], but also registers the module's PC table (the
    /// `(pc, flags)` array an instrumentation pass produced alongside the counters, per
    /// `spec.md` §3) if the caller has one. Out of scope consumers of the coverage-data
    /// stream defined in `spec.md` §6 never carry a PC table over that channel, so
    /// production callers that have one (e.g. a future symbolizing dump) reach this
    /// directly instead of through `Runner::ingest_inline_8bit_counters`.
    pub fn add_module_with_pc_table(
        &self,
        id: ModuleId,
        shared_memory: SharedMemory,
        pc_table: Option<Vec<crate::coverage::module_proxy::PcEntry>>,
    ) -> Result<()> {
        let proxy = self.pool.get(id, shared_memory.size())?;
        {
            let guard = proxy.lock().unwrap();
            guard.add(shared_memory.read());
            if let Some(table) = pc_table {
                guard.set_pc_table(table)?;
            }
        }
        self.modules.lock().unwrap().insert(id, shared_memory);
        Ok(())
    }

    /// Signals the process that a run is starting, optionally requesting leak detection,
    /// and waits for its acknowledgement.
    pub async fn start(&self, detect_leaks: bool) -> Result<()> {
        let signal = if detect_leaks {
            Signals::START_LEAK_CHECK
        } else {
            Signals::START
        };
        self.eventpair.signal_peer(signal);
        self.eventpair.wait_for(Signals::SYNC, self.target_id).await?;
        self.eventpair.clear(Signals::SYNC);
        Ok(())
    }

    /// Signals the process that the current run is finishing.
    pub fn finish(&self) -> Result<()> {
        self.eventpair.signal_peer(Signals::FINISH);
        Ok(())
    }

    /// Waits for the process to acknowledge `finish` (possibly reporting suspected
    /// leaks), or for it to terminate abnormally first.
    pub async fn await_finish(&self) -> Result<bool> {
        let observed = self
            .eventpair
            .wait_for(Signals::FINISH | Signals::FINISH_WITH_LEAKS, self.target_id)
            .await?;
        let leak_suspected = observed.contains(Signals::FINISH_WITH_LEAKS);
        self.eventpair.clear(Signals::FINISH | Signals::FINISH_WITH_LEAKS);
        Ok(leak_suspected)
    }

    /// Waits for the process to terminate after a fatal error and returns the resulting
    /// `FuzzResult`. Callers only invoke this after `start`/`await_finish` has already
    /// observed the peer disappear, so the process handle is not contended here; this
    /// crate's runner drives every proxy from a single-threaded executor.
    pub async fn get_result(&self) -> Result<FuzzResult> {
        {
            let cached = *self.result.lock().unwrap();
            if cached != FuzzResult::NoErrors {
                return Ok(cached);
            }
        }
        let mut guard = self.process.lock().unwrap();
        let termination = guard.wait().await.map_err(Error::Io)?;
        drop(guard);
        let result = match termination {
            Termination::Exited(code) => {
                FuzzResult::from_exit_code(code, &self.options.lock().unwrap())
            }
            Termination::Signaled(sig) => FuzzResult::from_signal(sig),
        };
        *self.result.lock().unwrap() = result;
        Ok(result)
    }

    pub fn get_stats(&self) -> ProcessStats {
        self.process.lock().unwrap().stats()
    }

    pub fn dump(&self, out: &mut Vec<u8>) -> usize {
        self.process.lock().unwrap().dump(out)
    }
}

impl Drop for ProcessProxy {
    /// Deregisters every counter array this process ever registered from the module
    /// pool, per `spec.md` §3's process-proxy invariant ("every registered counter
    /// region is deregistered from its pool on destruction") — otherwise a crashed or
    /// reaped process would leave a dangling buffer registered against a module other
    /// processes still share.
    fn drop(&mut self) {
        let modules = std::mem::take(&mut *self.modules.lock().unwrap());
        for (id, shared_memory) in modules {
            if let Ok(proxy) = self.pool.get(id, shared_memory.size()) {
                proxy.lock().unwrap().remove(shared_memory.read());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FakeProcess {
        pid: u64,
        exit_code: i32,
        waited: AtomicBool,
    }

    #[async_trait]
    impl ProcessHandle for FakeProcess {
        fn pid(&self) -> u64 {
            self.pid
        }
        async fn wait(&mut self) -> std::io::Result<Termination> {
            self.waited.store(true, Ordering::SeqCst);
            Ok(Termination::Exited(self.exit_code))
        }
        fn stats(&self) -> ProcessStats {
            ProcessStats {
                target_id: self.pid,
                ..Default::default()
            }
        }
        fn dump(&self, _out: &mut Vec<u8>) -> usize {
            0
        }
    }

    fn make_proxy(exit_code: i32) -> (ProcessProxy, AsyncEventPair) {
        let options = Arc::new(Options::default());
        let pool = Arc::new(ModulePool::new());
        let (engine_end, process_end) = AsyncEventPair::new_pair();
        let process = Box::new(FakeProcess {
            pid: 42,
            exit_code,
            waited: AtomicBool::new(false),
        });
        (
            ProcessProxy::connect(options, pool, engine_end, process),
            process_end,
        )
    }

    #[tokio::test]
    async fn start_completes_after_peer_acks_sync() {
        let (proxy, peer) = make_proxy(0);
        let peer_task = tokio::spawn(async move {
            peer.wait_for(Signals::START, 0).await.unwrap();
            peer.signal_peer(Signals::SYNC);
        });
        proxy.start(false).await.unwrap();
        peer_task.await.unwrap();
    }

    #[tokio::test]
    async fn exit_code_maps_to_configured_fault() {
        let options = Options {
            death_exitcode: 77,
            ..Options::default()
        };
        assert_eq!(FuzzResult::from_exit_code(77, &options), FuzzResult::Death);
        assert_eq!(FuzzResult::from_exit_code(0, &options), FuzzResult::NoErrors);
    }

    #[test]
    fn dropping_proxy_deregisters_its_counter_arrays() {
        let options = Arc::new(Options::default());
        let pool = Arc::new(ModulePool::new());
        let (engine_end, _process_end) = AsyncEventPair::new_pair();
        let process = Box::new(FakeProcess {
            pid: 99,
            exit_code: 0,
            waited: AtomicBool::new(false),
        });
        let proxy = ProcessProxy::connect(options, Arc::clone(&pool), engine_end, process);

        let mut shared_memory = crate::shared_memory::SharedMemory::reserve(8).unwrap();
        shared_memory.write(&[5, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        proxy.add_module([1, 1], shared_memory).unwrap();

        let module = pool.get([1, 1], 8).unwrap();
        assert_eq!(module.lock().unwrap().measure(), 1);

        drop(proxy);
        assert_eq!(module.lock().unwrap().measure(), 0);
    }

    #[test]
    fn target_ids_are_unique() {
        let a = next_target_id();
        let b = next_target_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn child_process_handle_reports_clean_exit() {
        let child = tokio::process::Command::new("true")
            .kill_on_drop(true)
            .spawn()
            .expect("spawn /bin/true");
        let mut handle = ChildProcessHandle::new(child);
        let termination = handle.wait().await.unwrap();
        assert!(matches!(termination, Termination::Exited(0)));
    }

    #[tokio::test]
    async fn child_process_handle_reports_signal_termination() {
        let child = tokio::process::Command::new("sh")
            .args(["-c", "kill -SEGV $$"])
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sh");
        let mut handle = ChildProcessHandle::new(child);
        let termination = handle.wait().await.unwrap();
        assert!(matches!(
            termination,
            Termination::Signaled(sig) if sig == nix::sys::signal::Signal::SIGSEGV as i32
        ));
    }
}
