//! In-process fakes standing in for a real instrumented process and a real
//! target-adapter FIDL connection, grounded in
//! `original_source/src/sys/fuzzing/realmfuzzer/testing/{adapter.h,process.h}` and
//! `common/testing/` -- those exist specifically so the original's own
//! `runner-unittest.cc`/`runner-test.cc` can drive the workflow engine without a real OS
//! process. Not part of the production API surface; used by this crate's own tests and
//! by `tests/workflows.rs`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::Result;
use crate::process_proxy::{FuzzResult, ProcessHandle, ProcessProxy, ProcessStats, Termination};
use crate::signals::{AsyncEventPair, Signals};
use crate::target_adapter::TargetAdapter;

/// A process handle whose termination is driven by a shared cell instead of a real OS
/// wait, set by [`FakeTarget`]'s background loop once it decides a run is fatal.
struct FakeProcessHandle {
    pid: u64,
    termination: Arc<tokio::sync::Notify>,
    outcome: Arc<Mutex<Option<Termination>>>,
}

#[async_trait]
impl ProcessHandle for FakeProcessHandle {
    fn pid(&self) -> u64 {
        self.pid
    }

    async fn wait(&mut self) -> std::io::Result<Termination> {
        loop {
            if let Some(termination) = *self.outcome.lock().unwrap() {
                return Ok(termination);
            }
            self.termination.notified().await;
        }
    }

    fn stats(&self) -> ProcessStats {
        ProcessStats {
            target_id: self.pid,
            ..Default::default()
        }
    }

    fn dump(&self, out: &mut Vec<u8>) -> usize {
        out.extend_from_slice(b"<fake thread dump>");
        19
    }
}

/// Drives one fake instrumented process plus its target adapter from a single
/// caller-supplied feedback function `Fn(&[u8]) -> FuzzResult`, exactly standing in for
/// the pair "real harness process" + "LLVMFuzzerTestOneInput" that a real target
/// provides. `FuzzResult::Timeout` is handled specially: the fake simply never acks,
/// letting the runner's own `run_limit` race declare the timeout, the same way a real
/// hung process would.
pub struct FakeTarget {
    eventpair: AsyncEventPair,
    outcome: Arc<Mutex<Option<Termination>>>,
    notify: Arc<tokio::sync::Notify>,
    pending_fault: Mutex<FuzzResult>,
    malloc_exitcode: i32,
    death_exitcode: i32,
    leak_exitcode: i32,
    oom_exitcode: i32,
}

impl FakeTarget {
    /// Spawns a fake process wired to a fresh [`ProcessProxy`] and returns both the proxy
    /// (to register with a runner) and a [`TargetAdapter`] the runner should drive
    /// `test_one_input` calls through.
    pub fn spawn<F>(
        options: Arc<crate::options::Options>,
        pool: Arc<crate::coverage::ModulePool>,
        feedback: F,
    ) -> (Arc<ProcessProxy>, Arc<dyn TargetAdapter>)
    where
        F: Fn(&[u8]) -> FuzzResult + Send + Sync + 'static,
    {
        let (engine_end, process_end) = AsyncEventPair::new_pair();
        let outcome = Arc::new(Mutex::new(None));
        let notify = Arc::new(tokio::sync::Notify::new());

        let handle = Box::new(FakeProcessHandle {
            pid: crate::process_proxy::next_target_id(),
            termination: Arc::clone(&notify),
            outcome: Arc::clone(&outcome),
        });

        let target = Arc::new(FakeTarget {
            eventpair: process_end,
            outcome: Arc::clone(&outcome),
            notify: Arc::clone(&notify),
            pending_fault: Mutex::new(FuzzResult::NoErrors),
            malloc_exitcode: options.malloc_exitcode,
            death_exitcode: options.death_exitcode,
            leak_exitcode: options.leak_exitcode,
            oom_exitcode: options.oom_exitcode,
        });

        let proxy = Arc::new(ProcessProxy::connect(options, pool, engine_end, handle));

        let loop_target = Arc::clone(&target);
        tokio::spawn(async move { loop_target.run_process_loop().await });

        let adapter: Arc<dyn TargetAdapter> = Arc::new(FakeAdapter {
            target: Arc::clone(&target),
            feedback: Box::new(feedback),
        });

        (proxy, adapter)
    }

    /// The process-side half of the start/finish handshake: acknowledge `start`
    /// immediately, then on `finish` either ack normally or, if the run in progress was
    /// fatal, terminate instead of acking -- matching how a real crashing process never
    /// reaches its own `kFinish` signal.
    async fn run_process_loop(self: Arc<Self>) {
        loop {
            let start = match self
                .eventpair
                .wait_for(Signals::START | Signals::START_LEAK_CHECK, 0)
                .await
            {
                Ok(signals) => signals,
                Err(_) => return,
            };
            let leak_check = start.contains(Signals::START_LEAK_CHECK);
            self.eventpair
                .clear(Signals::START | Signals::START_LEAK_CHECK);
            self.eventpair.signal_peer(Signals::SYNC);

            if self.eventpair.wait_for(Signals::FINISH, 0).await.is_err() {
                return;
            }
            self.eventpair.clear(Signals::FINISH);

            let fault = *self.pending_fault.lock().unwrap();
            match fault {
                FuzzResult::NoErrors => {
                    self.eventpair.signal_peer(Signals::FINISH);
                }
                // A malloc/free imbalance is only a *suspicion* until retested under a
                // full leak check; an ordinary run just flags it and continues.
                FuzzResult::Leak if !leak_check => {
                    self.eventpair.signal_peer(Signals::FINISH_WITH_LEAKS);
                }
                FuzzResult::Timeout => {
                    // Never acks or terminates; the runner's run_limit races this out.
                    std::future::pending::<()>().await;
                }
                _ => {
                    let code = self.exit_code_for(fault);
                    *self.outcome.lock().unwrap() = Some(Termination::Exited(code));
                    self.notify.notify_waiters();
                    self.eventpair.close(0);
                    return;
                }
            }
        }
    }

    fn exit_code_for(&self, fault: FuzzResult) -> i32 {
        match fault {
            FuzzResult::BadMalloc => self.malloc_exitcode,
            FuzzResult::Death | FuzzResult::Crash => self.death_exitcode,
            FuzzResult::Leak => self.leak_exitcode,
            FuzzResult::Oom => self.oom_exitcode,
            FuzzResult::Exit => 1,
            FuzzResult::NoErrors | FuzzResult::Timeout => 0,
        }
    }
}

struct FakeAdapter {
    target: Arc<FakeTarget>,
    feedback: Box<dyn Fn(&[u8]) -> FuzzResult + Send + Sync>,
}

#[async_trait]
impl TargetAdapter for FakeAdapter {
    async fn get_parameters(&self) -> Result<Vec<String>> {
        Ok(vec![])
    }

    async fn test_one_input(&self, input: &[u8]) -> Result<()> {
        let fault = (self.feedback)(input);
        *self.target.pending_fault.lock().unwrap() = fault;
        Ok(())
    }
}

/// A trivially-controllable [`ProcessHandle`] for tests that only need to assert on exit
/// code/signal mapping without a full [`FakeTarget`] handshake.
pub struct ScriptedProcess {
    pid: u64,
    termination: Termination,
    waited: AtomicBool,
}

impl ScriptedProcess {
    pub fn new(pid: u64, termination: Termination) -> Self {
        ScriptedProcess {
            pid,
            termination,
            waited: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ProcessHandle for ScriptedProcess {
    fn pid(&self) -> u64 {
        self.pid
    }

    async fn wait(&mut self) -> std::io::Result<Termination> {
        self.waited.store(true, Ordering::SeqCst);
        Ok(self.termination)
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
