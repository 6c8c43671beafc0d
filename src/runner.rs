//! Component G: the workflow engine itself.
//!
//! Mirrors `original_source/.../realmfuzzer/engine/runner.{h,cc}`: owns every other
//! component (the module pool, the process proxies, the target adapter, the seed/live
//! corpora, the dictionary, the mutagen) and exposes the seven workflow operations —
//! `configure`, `execute`, `minimize`, `cleanse`, `fuzz`, `merge`, `stop` — plus
//! `collect_status`. The original drives every proxy from a single-threaded dispatcher
//! loop; this port instead keeps each piece behind a short-lived `std::sync::Mutex` and
//! lets `tokio` interleave proxies concurrently, documented as a deliberate divergence in
//! the design notes rather than a literal port of that loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use libafl_bolts::rands::{Rand, StdRand};

use crate::corpus::{Corpus, Dictionary, Input};
use crate::coverage::module_proxy::ModuleId;
use crate::coverage::{coverage_data, ModulePool};
use crate::error::{Error, Result};
use crate::mutagen::Mutagen;
use crate::options::Options;
use crate::process_proxy::{FuzzResult, ProcessHandle, ProcessProxy};
use crate::shared_memory::SharedMemory;
use crate::signals::AsyncEventPair;
use crate::target_adapter::TargetAdapter;

/// The maximum number of times a leak-suspected input is rerun under a full leak check
/// before the runner gives up and treats it as clean, per `spec.md` §4.G.
pub const MAX_LEAK_DETECTION_ATTEMPTS: u32 = 1000;
/// The maximum number of full cleanse passes over an input, per `spec.md` §4.G.
pub const MAX_CLEANSE_PASSES: u32 = 5;
/// `collect_status` reports at most this many per-process entries.
pub const MAX_PROCESS_STATS: usize = 8;
/// `minimize`'s default total-time bound when neither `runs` nor `max_total_time_ns` is
/// set in `Options`.
pub const MINIMIZE_DEFAULT_MAX_TOTAL_TIME: Duration = Duration::from_secs(600);

/// The bytes and fault kind of a run that ended a workflow early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub fault: FuzzResult,
    pub input: Vec<u8>,
}

/// A point-in-time update a long-running workflow (`fuzz`) pushes to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The workflow has started.
    Init,
    /// A run grew the live corpus with new coverage.
    New,
    /// A periodic heartbeat, emitted on powers-of-two run counts once a second of
    /// inactivity has passed since the last `New`.
    Pulse,
    /// The workflow has ended.
    Done,
}

/// A snapshot of the runner's progress, matching what `collect_status` reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerStatus {
    pub running: bool,
    pub runs: u64,
    pub elapsed: Duration,
    pub covered_pcs: usize,
    pub covered_features: usize,
    pub corpus_num_inputs: usize,
    pub corpus_total_size: usize,
    pub process_stats: Vec<crate::process_proxy::ProcessStats>,
}

/// Whether and how a completed run's coverage should be folded into the module pool's
/// accumulated state and, if it grew, kept in the live corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PostProcessing {
    /// Don't touch the pool (`execute`).
    None,
    /// Fold into accumulated coverage; don't inspect growth (`merge` step 1).
    Accumulate,
}

/// One outcome of driving a single run to completion.
enum RunEvent {
    Completed { leak_suspected: bool },
    Faulted { target_id: u64, fault: FuzzResult },
    TimedOut,
}

type RespawnFn = dyn Fn(Arc<Options>) -> (Arc<ProcessProxy>, Arc<dyn TargetAdapter>) + Send + Sync;

/// The workflow engine: the single object a caller holds to drive one target under test.
pub struct Runner {
    options: Mutex<Arc<Options>>,
    pool: Arc<ModulePool>,
    proxies: Mutex<HashMap<u64, Arc<ProcessProxy>>>,
    adapter: Mutex<Arc<dyn TargetAdapter>>,
    /// Reconnects a fresh instrumented process whenever the proxy map runs dry (a process
    /// having died mid-workflow). Production callers wire this to whatever launches
    /// instrumented processes; that launcher is out of scope here (see `spec.md`'s
    /// scope table), so by default no reconnection happens and a dry proxy map just means
    /// every further run proceeds with zero registered processes.
    respawn: Mutex<Option<Box<RespawnFn>>>,
    seed_corpus: Mutex<Corpus>,
    live_corpus: Mutex<Corpus>,
    dictionary: Mutex<Dictionary>,
    mutagen: Mutex<Mutagen>,
    rand: Mutex<StdRand>,
    run_counter: AtomicU64,
    stopped: Arc<AtomicBool>,
    start_time: Mutex<Option<Instant>>,
}

impl Runner {
    /// Creates a runner bound to `adapter`, with default options and empty corpora.
    pub fn new(adapter: Arc<dyn TargetAdapter>) -> Self {
        Runner {
            options: Mutex::new(Arc::new(Options::default())),
            pool: Arc::new(ModulePool::new()),
            proxies: Mutex::new(HashMap::new()),
            adapter: Mutex::new(adapter),
            respawn: Mutex::new(None),
            seed_corpus: Mutex::new(Corpus::new()),
            live_corpus: Mutex::new(Corpus::new()),
            dictionary: Mutex::new(Dictionary::default()),
            mutagen: Mutex::new(Mutagen::new()),
            rand: Mutex::new(StdRand::with_seed(0)),
            run_counter: AtomicU64::new(0),
            stopped: Arc::new(AtomicBool::new(false)),
            start_time: Mutex::new(None),
        }
    }

    /// The module pool this runner analyses coverage through. Exposed so a caller that
    /// builds its own process proxies (chiefly tests) can register modules against the
    /// same pool the workflows read from, the way `register_process` does implicitly.
    pub fn pool(&self) -> Arc<ModulePool> {
        Arc::clone(&self.pool)
    }

    /// Installs a hook the runner calls whenever it needs a fresh instrumented process
    /// because the proxy map has run dry, e.g. after the previous one crashed.
    pub fn set_respawn(
        &self,
        f: impl Fn(Arc<Options>) -> (Arc<ProcessProxy>, Arc<dyn TargetAdapter>) + Send + Sync + 'static,
    ) {
        *self.respawn.lock().unwrap() = Some(Box::new(f));
    }

    /// Registers an already-connected process proxy, as the coverage-data provider would
    /// on observing a new `InstrumentedProcess` item.
    pub fn register_process(&self, eventpair: AsyncEventPair, process: Box<dyn ProcessHandle>) -> Arc<ProcessProxy> {
        let options = Arc::clone(&self.options.lock().unwrap());
        let proxy = Arc::new(ProcessProxy::connect(options, Arc::clone(&self.pool), eventpair, process));
        self.proxies.lock().unwrap().insert(proxy.target_id(), Arc::clone(&proxy));
        proxy
    }

    /// Registers an already-built process proxy directly, for callers (chiefly
    /// `testing::FakeTarget`) that construct their own `ProcessProxy` wired to a fake
    /// process loop instead of going through `register_process`'s eventpair/handle pair.
    pub fn register_process_proxy(&self, proxy: Arc<ProcessProxy>) {
        self.proxies.lock().unwrap().insert(proxy.target_id(), proxy);
    }

    /// Replaces the target-adapter client the runner drives `test_one_input` through.
    /// Production callers set this once, at construction; test harnesses that need the
    /// adapter wired to a process proxy built from the runner's own `pool()` (see
    /// `register_process_proxy`) swap it in afterward.
    pub fn set_adapter(&self, adapter: Arc<dyn TargetAdapter>) {
        *self.adapter.lock().unwrap() = adapter;
    }

    /// Routes a new `Inline8BitCounters` coverage-data item to the process proxy whose
    /// target id is encoded in the shared-memory name.
    pub fn ingest_inline_8bit_counters(&self, shared_memory_name: &str, shared_memory: SharedMemory) -> Result<()> {
        let target_id = coverage_data::decode_target_id(shared_memory_name).ok_or_else(|| {
            Error::InvalidArgument(format!("malformed coverage vmo name: {shared_memory_name}"))
        })?;
        let module_id_str = coverage_data::decode_module_id(shared_memory_name).ok_or_else(|| {
            Error::InvalidArgument(format!("malformed coverage vmo name: {shared_memory_name}"))
        })?;
        let module_id = parse_module_id(&module_id_str)?;
        let proxies = self.proxies.lock().unwrap();
        let proxy = proxies
            .get(&target_id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown target id {target_id:#x}")))?;
        proxy.add_module(module_id, shared_memory)
    }

    /// Copies `options` into every already-connected proxy, and resets every component
    /// that caches a derived value (corpora's size bound, the mutagen's depth/size
    /// bound, the PRNG seed).
    pub fn configure(&self, options: Options) {
        let options = Arc::new(options);
        *self.options.lock().unwrap() = Arc::clone(&options);
        self.seed_corpus.lock().unwrap().configure(options.max_input_size);
        self.live_corpus.lock().unwrap().configure(options.max_input_size);
        self.mutagen.lock().unwrap().configure(options.mutation_depth, options.max_input_size);
        *self.rand.lock().unwrap() = StdRand::with_seed(options.seed);
        for proxy in self.proxies.lock().unwrap().values() {
            proxy.configure(Arc::clone(&options));
        }
    }

    /// Loads every file under each of `dirs` as one seed-corpus input.
    pub async fn load_seed_corpus(&self, dirs: &[impl AsRef<std::path::Path>]) -> Result<()> {
        let mut corpus = std::mem::take(&mut *self.seed_corpus.lock().unwrap());
        let result = corpus.load(dirs).await;
        *self.seed_corpus.lock().unwrap() = corpus;
        result
    }

    /// Parses and installs a libFuzzer-style dictionary from `path`.
    pub async fn load_dictionary(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let dictionary = Dictionary::load(path).await?;
        *self.dictionary.lock().unwrap() = dictionary;
        Ok(())
    }

    /// Runs `inputs` in order, stopping at the first that faults. Returns `NoErrors` if
    /// every input ran clean.
    pub async fn execute(&self, inputs: Vec<Vec<u8>>) -> Result<FuzzResult> {
        let queue: VecDeque<Input> = inputs.into_iter().map(Input::new).collect();
        let detect_leaks = self.options.lock().unwrap().detect_leaks;
        match self.test_inputs(queue, detect_leaks, PostProcessing::None).await? {
            Some(artifact) => Ok(artifact.fault),
            None => Ok(FuzzResult::NoErrors),
        }
    }

    /// Repeatedly truncates one trailing byte from a faulting `input`, keeping each
    /// truncation that a bounded fuzz pass can still reproduce the same fault from, per
    /// `spec.md` §4.G.
    pub async fn minimize(&self, input: Vec<u8>) -> Result<Vec<u8>> {
        let target_fault = self.execute(vec![input.clone()]).await?;
        if target_fault == FuzzResult::NoErrors {
            return Err(Error::InvalidArgument(
                "minimize input does not trigger a fault".to_string(),
            ));
        }

        let (configured_runs, configured_time_ns) = {
            let options = self.options.lock().unwrap();
            (options.runs, options.max_total_time_ns)
        };
        let max_total_time = if configured_time_ns > 0 {
            Duration::from_nanos(configured_time_ns)
        } else {
            MINIMIZE_DEFAULT_MAX_TOTAL_TIME
        };

        self.run_counter.store(0, Ordering::SeqCst);
        let deadline = Instant::now() + max_total_time;

        let mut basis = input;
        while !basis.is_empty() {
            let truncated = basis[..basis.len() - 1].to_vec();
            self.pool.clear();
            match self
                .bounded_fuzz_pass(&truncated, configured_runs, deadline)
                .await?
            {
                Some(artifact) if artifact.fault == target_fault => {
                    basis = artifact.input;
                }
                _ => break,
            }
        }
        Ok(basis)
    }

    /// Replaces non-space, non-`0xff` bytes of a faulting `input` with `0x20` or `0xff`
    /// wherever doing so still reproduces the same fault, up to `MAX_CLEANSE_PASSES`
    /// passes, per `spec.md` §4.G.
    pub async fn cleanse(&self, input: Vec<u8>) -> Result<Vec<u8>> {
        let target_fault = self.execute(vec![input.clone()]).await?;
        if target_fault == FuzzResult::NoErrors {
            return Err(Error::InvalidArgument(
                "cleanse input does not trigger a fault".to_string(),
            ));
        }

        let mut current = input;
        for _pass in 0..MAX_CLEANSE_PASSES {
            let mut changed = false;
            for i in 0..current.len() {
                let original = current[i];
                if original == 0x20 || original == 0xff {
                    continue;
                }
                let mut space_variant = current.clone();
                space_variant[i] = 0x20;
                if self.probe_fault(&space_variant).await? == Some(target_fault) {
                    current = space_variant;
                    changed = true;
                    continue;
                }
                let mut ff_variant = current.clone();
                ff_variant[i] = 0xff;
                if self.probe_fault(&ff_variant).await? == Some(target_fault) {
                    current = ff_variant;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        Ok(current)
    }

    /// Runs the empty input, then the seed corpus, then mutated variants drawn from the
    /// live (and seed) corpus, until a runs/time bound is hit, `stop` is called, or a
    /// fault is found.
    pub async fn fuzz(
        &self,
        status_tx: Option<tokio::sync::mpsc::UnboundedSender<Status>>,
    ) -> Result<Option<Artifact>> {
        self.stopped.store(false, Ordering::SeqCst);
        self.run_counter.store(0, Ordering::SeqCst);
        *self.start_time.lock().unwrap() = Some(Instant::now());
        if let Some(tx) = &status_tx {
            let _ = tx.send(Status::Init);
        }

        let mut queue: VecDeque<Input> = VecDeque::new();
        queue.push_back(Input::empty());
        {
            let seed = self.seed_corpus.lock().unwrap();
            queue.extend(seed.iter().skip(1).cloned());
        }

        let detect_leaks = self.options.lock().unwrap().detect_leaks;
        let mut last_new = Instant::now();
        let settle = Duration::from_secs(1);
        let mut next_pulse: u64 = 1;

        let done = |tx: &Option<tokio::sync::mpsc::UnboundedSender<Status>>| {
            if let Some(tx) = tx {
                let _ = tx.send(Status::Done);
            }
        };

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                done(&status_tx);
                return Ok(None);
            }
            let (runs_bound, max_total_time_ns) = {
                let options = self.options.lock().unwrap();
                (options.runs, options.max_total_time_ns)
            };
            let elapsed = self
                .start_time
                .lock()
                .unwrap()
                .map(|t| t.elapsed())
                .unwrap_or_default();
            if max_total_time_ns > 0 && elapsed.as_nanos() as u64 >= max_total_time_ns {
                done(&status_tx);
                return Ok(None);
            }
            if runs_bound > 0 && self.run_counter.load(Ordering::SeqCst) >= runs_bound {
                done(&status_tx);
                return Ok(None);
            }

            let input = match queue.pop_front() {
                Some(input) => input,
                None => self.generate_mutation(),
            };

            match self.run_one(input.bytes(), detect_leaks).await? {
                RunEvent::TimedOut => {
                    done(&status_tx);
                    return Ok(Some(Artifact {
                        fault: FuzzResult::Timeout,
                        input: input.into_bytes(),
                    }));
                }
                RunEvent::Faulted { fault, .. } => {
                    self.proxies.lock().unwrap().clear();
                    done(&status_tx);
                    return Ok(Some(Artifact {
                        fault,
                        input: input.into_bytes(),
                    }));
                }
                RunEvent::Completed { .. } => {
                    let new_features = self.pool.accumulate_all();
                    if new_features > 0 {
                        let mut kept = input.clone();
                        kept.set_num_features(new_features);
                        self.live_corpus.lock().unwrap().add(kept)?;
                        last_new = Instant::now();
                        next_pulse = 1;
                        if let Some(tx) = &status_tx {
                            let _ = tx.send(Status::New);
                        }
                    }
                }
            }

            let runs = self.run_counter.load(Ordering::SeqCst);
            if last_new.elapsed() >= settle && runs >= next_pulse && (runs & runs.wrapping_sub(1)) == 0 {
                if let Some(tx) = &status_tx {
                    let _ = tx.send(Status::Pulse);
                }
                next_pulse = runs.saturating_mul(2).max(1);
            }
        }
    }

    /// Folds the seed corpus's coverage into the pool (aborting the whole merge if any
    /// seed input faults), then re-derives the live corpus from scratch in two passes:
    /// one that measures each live input's coverage against the seed baseline and keeps
    /// only those that grow it, and one that re-accumulates the survivors in corpus order
    /// so only inputs contributing genuinely new features over each other remain. Live
    /// inputs that fault are set aside rather than aborting the merge, and re-added to
    /// the final corpus verbatim, per `spec.md` §4.G and the worked example in §8.
    pub async fn merge(&self) -> Result<()> {
        self.pool.clear();

        let mut accumulate_inputs: VecDeque<Input> = VecDeque::new();
        accumulate_inputs.push_back(Input::empty());
        {
            let seed = self.seed_corpus.lock().unwrap();
            accumulate_inputs.extend(seed.iter().skip(1).cloned());
        }
        if let Some(artifact) = self
            .test_inputs(accumulate_inputs, false, PostProcessing::Accumulate)
            .await?
        {
            return Err(Error::InvalidArgument(format!(
                "seed corpus input triggers {:?}",
                artifact.fault
            )));
        }

        let (live_inputs, max_input_size) = {
            let mut live = self.live_corpus.lock().unwrap();
            let inputs: Vec<Input> = live.iter().skip(1).cloned().collect();
            let options = self.options.lock().unwrap();
            let max_input_size = options.max_input_size;
            *live = Corpus::new();
            live.configure(max_input_size);
            (inputs, max_input_size)
        };

        // Step 2: measure each live input's coverage against the seed baseline without
        // folding it in yet. Inputs that fault are set aside instead of aborting.
        let mut candidates: Vec<Input> = Vec::new();
        let mut set_aside: Vec<Input> = Vec::new();
        for input in live_inputs {
            match self.run_one(input.bytes(), false).await? {
                RunEvent::Completed { .. } => {
                    let new_features = self.pool.measure_all();
                    if new_features > 0 {
                        let mut kept = input.clone();
                        kept.set_num_features(new_features);
                        candidates.push(kept);
                    }
                }
                RunEvent::Faulted { .. } | RunEvent::TimedOut => {
                    set_aside.push(input);
                }
            }
        }

        // Step 3: re-run the survivors in (size, features, lex) order, accumulating and
        // keeping only those that still contribute new features over one another.
        let mut ordering = Corpus::new();
        ordering.configure(max_input_size);
        for input in candidates {
            ordering.add(input)?;
        }
        let ordered: Vec<Input> = ordering.iter().skip(1).cloned().collect();

        let mut final_live = Corpus::new();
        final_live.configure(max_input_size);
        for input in ordered {
            match self.run_one(input.bytes(), false).await? {
                RunEvent::Completed { .. } => {
                    let gained = self.pool.accumulate_all();
                    if gained > 0 {
                        final_live.add(input)?;
                    }
                }
                RunEvent::Faulted { .. } | RunEvent::TimedOut => {
                    set_aside.push(input);
                }
            }
        }

        for input in set_aside {
            final_live.add(input)?;
        }

        *self.live_corpus.lock().unwrap() = final_live;
        Ok(())
    }

    /// Requests the active workflow stop at its next opportunity. Idempotent; a no-op if
    /// nothing is running.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// A point-in-time snapshot of the runner's progress.
    pub fn collect_status(&self) -> RunnerStatus {
        let (covered_pcs, covered_features) = self.pool.get_coverage();
        let live = self.live_corpus.lock().unwrap();
        let mut process_stats: Vec<_> = self
            .proxies
            .lock()
            .unwrap()
            .values()
            .map(|p| p.get_stats())
            .collect();
        process_stats.truncate(MAX_PROCESS_STATS);
        let elapsed = self
            .start_time
            .lock()
            .unwrap()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        RunnerStatus {
            running: !self.stopped.load(Ordering::SeqCst),
            runs: self.run_counter.load(Ordering::SeqCst),
            elapsed,
            covered_pcs,
            covered_features,
            corpus_num_inputs: live.num_inputs(),
            corpus_total_size: live.total_size(),
            process_stats,
        }
    }

    // -- internals --------------------------------------------------------------------

    /// Drives `inputs` one at a time through `run_one`, applying `post` to every clean
    /// run's coverage, and stopping (dropping the proxy map) the moment one faults or
    /// times out. Used by the workflows that end their whole operation on first fault.
    async fn test_inputs(
        &self,
        mut inputs: VecDeque<Input>,
        detect_leaks: bool,
        post: PostProcessing,
    ) -> Result<Option<Artifact>> {
        self.pool.clear();
        let mut leak_queue: VecDeque<Input> = VecDeque::new();
        let mut leak_attempts: HashMap<Vec<u8>, u32> = HashMap::new();

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let input = match leak_queue.pop_front().or_else(|| inputs.pop_front()) {
                Some(input) => input,
                None => return Ok(None),
            };

            let use_leak_check =
                detect_leaks && leak_attempts.get(input.bytes()).copied().unwrap_or(0) > 0;

            match self.run_one(input.bytes(), use_leak_check).await? {
                RunEvent::TimedOut => {
                    self.proxies.lock().unwrap().clear();
                    return Ok(Some(Artifact {
                        fault: FuzzResult::Timeout,
                        input: input.into_bytes(),
                    }));
                }
                RunEvent::Faulted { fault, .. } => {
                    self.proxies.lock().unwrap().clear();
                    return Ok(Some(Artifact {
                        fault,
                        input: input.into_bytes(),
                    }));
                }
                RunEvent::Completed { leak_suspected } => {
                    match post {
                        PostProcessing::None => {}
                        PostProcessing::Accumulate => {
                            self.pool.accumulate_all();
                        }
                    }

                    if leak_suspected && detect_leaks {
                        let attempts = leak_attempts.entry(input.bytes().to_vec()).or_insert(0);
                        if *attempts < MAX_LEAK_DETECTION_ATTEMPTS {
                            *attempts += 1;
                            leak_queue.push_back(input);
                        }
                    }
                }
            }
        }
    }

    /// Drives one run of `input` against every registered process proxy plus the target
    /// adapter: signal every proxy to start, invoke the adapter, signal every proxy to
    /// finish, and race the whole thing against the configured per-run timeout.
    async fn run_one(&self, input: &[u8], detect_leaks: bool) -> Result<RunEvent> {
        self.run_counter.fetch_add(1, Ordering::SeqCst);
        self.maybe_respawn();

        let adapter = Arc::clone(&self.adapter.lock().unwrap());
        let proxies: Vec<Arc<ProcessProxy>> = self.proxies.lock().unwrap().values().cloned().collect();

        let mut start_handles = Vec::with_capacity(proxies.len());
        for proxy in &proxies {
            let proxy = Arc::clone(proxy);
            start_handles.push(tokio::spawn(async move { proxy.start(detect_leaks).await }));
        }
        for handle in start_handles {
            handle.await.map_err(Error::Join)??;
        }

        let run_limit_ns = self.options.lock().unwrap().run_limit_ns;
        let owned_input = input.to_vec();

        let mut finish_handles = Vec::with_capacity(proxies.len());
        for proxy in &proxies {
            let proxy = Arc::clone(proxy);
            finish_handles.push(tokio::spawn(async move {
                let outcome = proxy.await_finish().await;
                (proxy.target_id(), outcome)
            }));
        }

        let run_fut = async {
            let result = adapter.test_one_input(&owned_input).await;
            for proxy in &proxies {
                proxy.finish()?;
            }
            result
        };

        let completed = if run_limit_ns > 0 {
            tokio::time::timeout(Duration::from_nanos(run_limit_ns), run_fut)
                .await
                .ok()
        } else {
            Some(run_fut.await)
        };

        let Some(adapter_result) = completed else {
            for proxy in &proxies {
                let mut dump = Vec::new();
                proxy.dump(&mut dump);
            }
            for handle in finish_handles {
                handle.abort();
            }
            return Ok(RunEvent::TimedOut);
        };
        adapter_result?;

        let mut leak_suspected = false;
        for handle in finish_handles {
            let (target_id, outcome) = handle.await.map_err(Error::Join)?;
            match outcome {
                Ok(leak) => leak_suspected |= leak,
                Err(Error::PeerClosed(_)) => {
                    self.proxies.lock().unwrap().remove(&target_id);
                    let proxy = proxies.iter().find(|p| p.target_id() == target_id);
                    let fault = match proxy {
                        Some(proxy) => proxy.get_result().await?,
                        None => FuzzResult::Crash,
                    };
                    return Ok(RunEvent::Faulted { target_id, fault });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(RunEvent::Completed { leak_suspected })
    }

    /// Calls the installed respawn hook if the proxy map is empty, e.g. because the
    /// previously sole process crashed.
    fn maybe_respawn(&self) {
        let empty = self.proxies.lock().unwrap().is_empty();
        if !empty {
            return;
        }
        let hook = self.respawn.lock().unwrap();
        let Some(hook) = hook.as_ref() else { return };
        let options = Arc::clone(&self.options.lock().unwrap());
        let (proxy, adapter) = hook(options);
        self.proxies.lock().unwrap().insert(proxy.target_id(), proxy);
        *self.adapter.lock().unwrap() = adapter;
    }

    /// Runs one input and reports only the fault it triggered, if any, with `Timeout`
    /// folded in as a fault for callers that only care about "did this reproduce".
    async fn probe_fault(&self, input: &[u8]) -> Result<Option<FuzzResult>> {
        match self.run_one(input, false).await? {
            RunEvent::Completed { .. } => Ok(None),
            RunEvent::Faulted { fault, .. } => Ok(Some(fault)),
            RunEvent::TimedOut => Ok(Some(FuzzResult::Timeout)),
        }
    }

    /// Explores mutations of `seed` (a random walk seeded from `seed` itself, re-based
    /// from `seed` every `mutation_depth` steps) until one reproduces any fault, or the
    /// run/time bound elapses. Tries `seed` itself unmutated first.
    async fn bounded_fuzz_pass(
        &self,
        seed: &[u8],
        max_runs: u64,
        deadline: Instant,
    ) -> Result<Option<Artifact>> {
        if let Some(fault) = self.probe_fault(seed).await? {
            return Ok(Some(Artifact {
                fault,
                input: seed.to_vec(),
            }));
        }

        let (mutation_depth, max_input_size, prng_seed) = {
            let options = self.options.lock().unwrap();
            (options.mutation_depth, options.max_input_size, options.seed)
        };
        let mut mutagen = Mutagen::new();
        mutagen.configure(mutation_depth, max_input_size);
        mutagen.set_base(Input::new(seed.to_vec()));
        let dictionary = self.dictionary.lock().unwrap().entries().to_vec();
        let mut rand = StdRand::with_seed(prng_seed ^ 0x9E37_79B9_7F4A_7C15);
        let mut buf = Vec::new();

        loop {
            if (max_runs > 0 && self.run_counter.load(Ordering::SeqCst) >= max_runs)
                || Instant::now() >= deadline
            {
                return Ok(None);
            }
            if mutagen.exhausted() {
                mutagen.set_base(Input::new(seed.to_vec()));
            }
            mutagen.mutate(&mut |n| rand.below(n), &dictionary, &mut buf);
            if let Some(fault) = self.probe_fault(&buf).await? {
                return Ok(Some(Artifact {
                    fault,
                    input: buf.clone(),
                }));
            }
        }
    }

    /// Picks a base (and crossover) input from the live corpus, falling back to the seed
    /// corpus if the live corpus is still only the implicit empty input, and produces one
    /// mutated candidate.
    fn generate_mutation(&self) -> Input {
        let disable_entropic = self.options.lock().unwrap().disable_entropic;
        {
            let mut mutagen = self.mutagen.lock().unwrap();
            if mutagen.exhausted() {
                let mut rand = self.rand.lock().unwrap();
                let live = self.live_corpus.lock().unwrap();
                let seed = self.seed_corpus.lock().unwrap();
                let corpus = if live.num_inputs() > 1 { &*live } else { &*seed };
                let base = corpus.pick(&mut |n| rand.below(n), disable_entropic).clone();
                let crossover = corpus.pick(&mut |n| rand.below(n), disable_entropic).clone();
                drop(seed);
                drop(live);
                mutagen.set_base(base);
                mutagen.set_crossover(crossover);
            }
        }
        let dictionary = self.dictionary.lock().unwrap().entries().to_vec();
        let mut rand = self.rand.lock().unwrap();
        let mut mutagen = self.mutagen.lock().unwrap();
        let mut buf = Vec::new();
        mutagen.mutate(&mut |n| rand.below(n), &dictionary, &mut buf);
        Input::new(buf)
    }
}

/// Renders a module id as the opaque suffix `share`/`link` embed in a shared-memory name.
pub fn format_module_id(id: ModuleId) -> String {
    format!("{:016x}{:016x}", id[0], id[1])
}

/// Parses a module id previously rendered by `format_module_id`.
fn parse_module_id(s: &str) -> Result<ModuleId> {
    if s.len() != 32 {
        return Err(Error::InvalidArgument(format!("malformed module id: {s}")));
    }
    let hi = u64::from_str_radix(&s[..16], 16)
        .map_err(|_| Error::InvalidArgument(format!("malformed module id: {s}")))?;
    let lo = u64::from_str_radix(&s[16..], 16)
        .map_err(|_| Error::InvalidArgument(format!("malformed module id: {s}")))?;
    Ok([hi, lo])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTarget;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    /// A `TargetAdapter` that never runs anything, used only as `Runner::new`'s initial
    /// placeholder until a real one (wired to the runner's own pool) replaces it.
    struct NullAdapter;
    #[async_trait::async_trait]
    impl TargetAdapter for NullAdapter {
        async fn get_parameters(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn test_one_input(&self, _input: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn make_runner(options: Options, feedback: impl Fn(&[u8]) -> FuzzResult + Send + Sync + Clone + 'static) -> Runner {
        let options = Arc::new(options);
        let runner = Runner::new(Arc::new(NullAdapter));
        runner.configure((*options).clone());

        let feedback_for_spawn = feedback.clone();
        let (proxy, adapter) = FakeTarget::spawn(Arc::clone(&options), runner.pool(), feedback_for_spawn);
        runner.set_adapter(adapter);
        runner.proxies.lock().unwrap().insert(proxy.target_id(), proxy);

        let respawn_pool = runner.pool();
        runner.set_respawn(move |options| FakeTarget::spawn(options, Arc::clone(&respawn_pool), feedback.clone()));
        runner
    }

    #[tokio::test]
    async fn execute_reports_no_errors_for_clean_input() {
        let runner = make_runner(Options::default(), |input| {
            if input.len() > 3 {
                FuzzResult::Crash
            } else {
                FuzzResult::NoErrors
            }
        });
        let result = runner.execute(vec![vec![1, 2, 3]]).await.unwrap();
        assert_eq!(result, FuzzResult::NoErrors);
    }

    #[tokio::test]
    async fn execute_reports_fault_for_crashing_input() {
        let runner = make_runner(Options::default(), |input| {
            if input.len() > 3 {
                FuzzResult::Crash
            } else {
                FuzzResult::NoErrors
            }
        });
        let result = runner.execute(vec![vec![1, 2, 3, 4]]).await.unwrap();
        assert_eq!(result, FuzzResult::Crash);
    }

    #[tokio::test]
    async fn minimize_shrinks_a_length_triggered_crash() {
        let options = Options {
            runs: 0x40,
            ..Options::default()
        };
        let runner = make_runner(options, |input| {
            if input.len() > 3 {
                FuzzResult::Crash
            } else {
                FuzzResult::NoErrors
            }
        });
        let minimized = runner
            .minimize(vec![0x51, 0x52, 0x53, 0x54, 0x55, 0x56])
            .await
            .unwrap();
        assert!(minimized.len() <= 4, "expected a shrunk input, got {minimized:?}");
    }

    #[tokio::test]
    async fn cleanse_replaces_irrelevant_bytes() {
        let counter = Arc::new(StdAtomicU64::new(0));
        let marker = Arc::clone(&counter);
        let runner = make_runner(Options::default(), move |input| {
            marker.fetch_add(1, Ordering::SeqCst);
            if input.first() == Some(&0xAB) {
                FuzzResult::Crash
            } else {
                FuzzResult::NoErrors
            }
        });
        let cleansed = runner.cleanse(vec![0xAB, 0x11, 0x22]).await.unwrap();
        assert_eq!(cleansed[0], 0xAB);
        assert!(cleansed[1] == 0x20 || cleansed[1] == 0xff);
        assert!(cleansed[2] == 0x20 || cleansed[2] == 0xff);
    }

    #[tokio::test]
    async fn fuzz_stops_on_stop_request() {
        let runner = Arc::new(make_runner(Options::default(), |_| FuzzResult::NoErrors));
        let stopper = Arc::clone(&runner);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.stop();
        });
        let artifact = runner.fuzz(None).await.unwrap();
        assert!(artifact.is_none());
    }

    #[tokio::test]
    async fn malformed_coverage_name_is_rejected() {
        let runner = make_runner(Options::default(), |_| FuzzResult::NoErrors);
        let shm = SharedMemory::reserve(8).unwrap();
        let err = runner
            .ingest_inline_8bit_counters("not-a-valid-name", shm)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    /// Wraps a fake target's adapter, writing caller-supplied coverage counters into a
    /// directly pool-registered buffer ahead of every run, so a test can drive exact
    /// feature tuples without a real instrumented process.
    struct CoverageAdapter {
        inner: Arc<dyn TargetAdapter>,
        write_counters: Box<dyn Fn(&[u8]) + Send + Sync>,
    }

    #[async_trait::async_trait]
    impl TargetAdapter for CoverageAdapter {
        async fn get_parameters(&self) -> Result<Vec<String>> {
            self.inner.get_parameters().await
        }

        async fn test_one_input(&self, input: &[u8]) -> Result<()> {
            (self.write_counters)(input);
            self.inner.test_one_input(input).await
        }
    }

    #[tokio::test]
    async fn merge_keeps_new_coverage_and_sets_aside_faulting_live_inputs() {
        // Mirrors the worked example in `spec.md` §8 scenario 5: a one-byte seed input
        // claims three features; of six live-corpus inputs, one OOMs (set aside
        // untouched), one contributes nothing beyond the seed and one another's already-
        // kept coverage (both dropped), and two contribute genuinely new features and
        // survive.
        let runner = make_runner(Options::default(), |input| {
            if input == [0x0b] {
                FuzzResult::Oom
            } else {
                FuzzResult::NoErrors
            }
        });

        let counters = Arc::new(Mutex::new(vec![0u8; 8]));
        let module = runner.pool().get([0, 0], 8).unwrap();
        module.lock().unwrap().add(&counters.lock().unwrap());

        let counters_for_write = Arc::clone(&counters);
        let write_counters = move |input: &[u8]| {
            let mut buf = counters_for_write.lock().unwrap();
            buf.iter_mut().for_each(|b| *b = 0);
            match input {
                [0x0a] => {
                    buf[0] = 1;
                    buf[1] = 2;
                    buf[2] = 3;
                }
                [0x0c, 0x0c] => {
                    buf[0] = 2;
                    buf[2] = 2;
                }
                [0x0d, 0x0d, 0x0d] => {
                    buf[0] = 2;
                    buf[1] = 1;
                }
                [0x0e, 0x0e] => {
                    buf[0] = 2;
                    buf[2] = 3;
                }
                [0x0f] => {
                    buf[0] = 1;
                    buf[2] = 3;
                }
                [0x10, 0x10, 0x10, 0x10] => {
                    buf[0] = 2;
                    buf[1] = 1;
                    buf[2] = 2;
                }
                _ => {}
            }
        };

        let inner_adapter = Arc::clone(&*runner.adapter.lock().unwrap());
        let wrapped: Arc<dyn TargetAdapter> = Arc::new(CoverageAdapter {
            inner: inner_adapter,
            write_counters: Box::new(write_counters),
        });
        runner.set_adapter(wrapped);

        runner
            .seed_corpus
            .lock()
            .unwrap()
            .add(Input::new(vec![0x0a]))
            .unwrap();
        for bytes in [
            vec![0x0bu8],
            vec![0x0c, 0x0c],
            vec![0x0d, 0x0d, 0x0d],
            vec![0x0e, 0x0e],
            vec![0x0f],
            vec![0x10, 0x10, 0x10, 0x10],
        ] {
            runner.live_corpus.lock().unwrap().add(Input::new(bytes)).unwrap();
        }

        runner.merge().await.unwrap();

        let live = runner.live_corpus.lock().unwrap();
        let bytes: Vec<Vec<u8>> = live.iter().map(|i| i.bytes().to_vec()).collect();
        assert_eq!(
            bytes,
            vec![
                Vec::<u8>::new(),
                vec![0x0b],
                vec![0x0c, 0x0c],
                vec![0x0d, 0x0d, 0x0d],
            ]
        );
    }
}
