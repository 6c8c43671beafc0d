//! Component C: the per-module coverage accumulator.
//!
//! Aggregates every live counter array registered for one `(module_id, size)` pair
//! across however many instrumented processes currently have that module loaded, turns
//! their summed counters into AFL-style "features", and tracks which features have ever
//! been accumulated. The summation and bucketing algorithm is lifted byte-for-byte from
//! `original_source/.../framework/engine/module-proxy.cc`: counters are folded eight
//! bytes at a time through a `u64`, with the high bit of each byte OR'd (saturation) and
//! the low seven bits added (no cross-byte carry), then each summed byte is mapped to a
//! single one-hot bit via `to_feature`.

use std::sync::Mutex;

use crate::error::{Error, Result};

/// 128-bit module identity, matching the original's `Identifier = array<uint64_t, 2>`.
pub type ModuleId = [u64; 2];

/// One `(pc, flags)` entry of a module's PC table, per `spec.md` §3: a fixed-length array
/// aligned 1-to-1 with the counter array, immutable after registration. The engine itself
/// never reads `pc`/`flags` (no symbolization consumer exists here — see `spec.md`'s
/// Non-goals), but the table is still a real part of the data model, not a future
/// placeholder, so it is stored and validated rather than merely declared.
pub type PcEntry = (u64, u8);

/// High bit of every byte in a `u64`, used to carry-avoid the per-byte saturating sum.
const HI_BITS_MASK: u64 = 0x8080_8080_8080_8080;

fn to_feature_byte(counter: u8) -> u8 {
    match counter {
        0 => 0,
        1 => 1 << 0,
        2 => 1 << 1,
        3 => 1 << 2,
        4..=7 => 1 << 3,
        8..=15 => 1 << 4,
        16..=31 => 1 << 5,
        32..=127 => 1 << 6,
        _ => 1 << 7,
    }
}

/// A registered counter buffer, identified by pointer for `remove`. Ownership stays with
/// the caller (typically a `ProcessProxy`); this proxy only ever reads it, and only
/// between `start`/`finish` synchronization points. The buffer is re-read live on every
/// `measure`/`accumulate` rather than snapshotted at registration time, since the target
/// process keeps writing into it between runs and the engine only consults it at the
/// `finish` synchronization point (`spec.md` §4.A/§5).
struct Registered {
    ptr: *const u8,
    num_words: usize,
}

impl Registered {
    /// # Safety
    /// `ptr` must still point at a live, `num_words * 8`-byte, 8-byte-aligned buffer; the
    /// caller (`ModuleProxy::add`) upholds this until a matching `remove`.
    unsafe fn words(&self) -> &[u64] {
        std::slice::from_raw_parts(self.ptr as *const u64, self.num_words)
    }
}

// SAFETY: `Registered` is only ever read through the buffer the caller guarantees
// remains valid for as long as it stays registered; the pointer itself is never
// dereferenced concurrently with a `remove` of the same entry because both happen on the
// single-threaded runner executor. The one cross-thread access (a process proxy's
// teardown racing the pool's iteration) is guarded by `counters`'s own `Mutex`.
unsafe impl Send for Registered {}

/// Aggregates counters for one logical module across every process that currently has it
/// mapped.
pub struct ModuleProxy {
    id: ModuleId,
    num_words: usize,
    counters: Mutex<Vec<Registered>>,
    features: Vec<u64>,
    accumulated: Vec<u64>,
    pc_table: Mutex<Option<Vec<PcEntry>>>,
}

impl ModuleProxy {
    /// Creates a proxy for a module of `size` bytes (must be a multiple of 8).
    pub fn new(id: ModuleId, size: usize) -> Self {
        assert_eq!(size % 8, 0, "counter arrays must be 8-byte aligned");
        let num_words = size / 8;
        ModuleProxy {
            id,
            num_words,
            counters: Mutex::new(Vec::new()),
            features: vec![0; num_words],
            accumulated: vec![0; num_words],
            pc_table: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.num_words * 8
    }

    /// Registers a counter array. `counters` must be `size()` bytes, 8-byte aligned, and
    /// must outlive the registration (the caller removes it before freeing the backing
    /// buffer).
    pub fn add(&self, counters: &[u8]) {
        assert_eq!(counters.len(), self.size());
        assert_eq!(counters.as_ptr() as usize % 8, 0, "counters must be 8-byte aligned");
        self.counters.lock().unwrap().push(Registered {
            ptr: counters.as_ptr(),
            num_words: self.num_words,
        });
    }

    /// Deregisters a previously-registered counter array, matched by pointer identity.
    pub fn remove(&self, counters: &[u8]) {
        let ptr = counters.as_ptr();
        self.counters.lock().unwrap().retain(|r| r.ptr != ptr);
    }

    /// Registers this module's PC table, one `(pc, flags)` entry per instrumented byte
    /// in the counter array. The first registration wins; a later call with a table of
    /// the wrong length is rejected, and a later call with a table of the right length is
    /// treated as the same logical table re-arriving from another process and ignored —
    /// the table is immutable after module registration, per `spec.md` §3.
    pub fn set_pc_table(&self, table: Vec<PcEntry>) -> Result<()> {
        if table.len() != self.num_words * 8 {
            return Err(Error::InvalidArgument(format!(
                "pc table has {} entries, expected {} for module {:?}",
                table.len(),
                self.num_words * 8,
                self.id
            )));
        }
        let mut slot = self.pc_table.lock().unwrap();
        if slot.is_none() {
            *slot = Some(table);
        }
        Ok(())
    }

    /// The module's PC table, if a process has registered one yet.
    pub fn pc_table(&self) -> Option<Vec<PcEntry>> {
        self.pc_table.lock().unwrap().clone()
    }

    /// Computes features from the current sum of all registered counters and returns the
    /// number of features not already in `accumulated`, without recording them.
    pub fn measure(&mut self) -> usize {
        self.measure_impl(false)
    }

    /// Like `measure`, but also ORs the new features into `accumulated`.
    pub fn accumulate(&mut self) -> usize {
        self.measure_impl(true)
    }

    fn measure_impl(&mut self, accumulate: bool) -> usize {
        self.features.iter_mut().for_each(|w| *w = 0);
        let guard = self.counters.lock().unwrap();
        for reg in guard.iter() {
            // SAFETY: the buffer backing `reg` is guaranteed live until a matching
            // `remove`, which would have dropped this entry from `guard` first.
            let words = unsafe { reg.words() };
            for i in 0..self.num_words {
                let counters = words[i];
                if counters == 0 {
                    continue;
                }
                let hi_bits = (counters | self.features[i]) & HI_BITS_MASK;
                let lo_sum = (self.features[i] & !HI_BITS_MASK).wrapping_add(counters & !HI_BITS_MASK);
                self.features[i] = lo_sum | hi_bits;
            }
        }
        drop(guard);

        let mut num_new_features = 0usize;
        for i in 0..self.num_words {
            if self.features[i] == 0 {
                continue;
            }
            let summed = self.features[i].to_le_bytes();
            let mut feature_word = 0u64;
            for (lane, &byte) in summed.iter().enumerate() {
                let feature_bit = to_feature_byte(byte);
                feature_word |= (feature_bit as u64) << (lane * 8);
            }
            self.features[i] = feature_word;
            num_new_features += (!self.accumulated[i] & feature_word).count_ones() as usize;
            if accumulate {
                self.accumulated[i] |= feature_word;
            }
        }
        num_new_features
    }

    /// Returns how many PCs (bytes, not bits) have accumulated at least one feature; if
    /// requested, also returns the total feature-bit popcount. These two numbers are
    /// deliberately not the same quantity — see the design notes' Open Question — and
    /// this crate preserves that distinction rather than conflating "PC" with "feature".
    pub fn get_coverage(&self) -> (usize, usize) {
        let mut num_pcs = 0usize;
        let mut num_features = 0usize;
        for &word in &self.accumulated {
            if word == 0 {
                continue;
            }
            num_features += word.count_ones() as usize;
            let mut remaining = word;
            while remaining != 0 {
                if remaining & 0xff != 0 {
                    num_pcs += 1;
                }
                remaining >>= 8;
            }
        }
        (num_pcs, num_features)
    }

    /// Resets the recorded accumulated features.
    pub fn clear(&mut self) {
        self.accumulated.iter_mut().for_each(|w| *w = 0);
    }
}
