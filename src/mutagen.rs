//! Component F (part two): the byte-level input mutation engine.
//!
//! No `original_source` mutagen file was retrieved with this pack; the mutator set and
//! the "mutation depth before re-picking a base" behavior follow `spec.md` §4.F directly.
//! Byte-level mutators (erase/insert/duplicate/replace/shuffle/crossover/bit-flip/
//! arithmetic) mirror libFuzzer's well-known `FuzzerMutate.cpp` repertoire, which is the
//! technique `spec.md` explicitly compares itself to ("libFuzzer's 'entropic' heuristic").

use crate::corpus::Input;

/// One of the fixed mutator kinds named in `spec.md` §4.F. Exposed so tests (and status
/// reporting, should a caller want it) can name which mutator produced a given output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutatorKind {
    Erase,
    Insert,
    Duplicate,
    Replace,
    Shuffle,
    Crossover,
    DictionaryInsert,
    DictionaryOverwrite,
    BitFlip,
    ArithmeticIncrement,
    ArithmeticDecrement,
}

const ALL_KINDS: [MutatorKind; 11] = [
    MutatorKind::Erase,
    MutatorKind::Insert,
    MutatorKind::Duplicate,
    MutatorKind::Replace,
    MutatorKind::Shuffle,
    MutatorKind::Crossover,
    MutatorKind::DictionaryInsert,
    MutatorKind::DictionaryOverwrite,
    MutatorKind::BitFlip,
    MutatorKind::ArithmeticIncrement,
    MutatorKind::ArithmeticDecrement,
];

/// Holds the base and crossover inputs a sequence of mutations is derived from, plus how
/// many mutations have been applied to the current base. Each `mutate` call chains onto
/// the previous output -- `base` advances to the freshly mutated bytes -- so that `depth`
/// chained mutations form one random walk away from the originally-picked base, the same
/// way libFuzzer's own multi-pass mutator composes. Once `depth` reaches the configured
/// `mutation_depth`, the runner is expected to call `set_base`/`set_crossover` again with
/// a freshly-picked pair -- `Mutagen` itself never re-picks from a corpus, to keep this
/// module free of corpus-selection policy.
pub struct Mutagen {
    base: Input,
    crossover: Option<Input>,
    depth: u32,
    max_depth: u32,
    max_size: usize,
}

impl Mutagen {
    pub fn new() -> Self {
        Mutagen {
            base: Input::empty(),
            crossover: None,
            depth: 0,
            max_depth: 5,
            max_size: 1 << 20,
        }
    }

    pub fn configure(&mut self, mutation_depth: u32, max_input_size: usize) {
        self.max_depth = mutation_depth.max(1);
        self.max_size = max_input_size.max(1);
    }

    pub fn set_base(&mut self, base: Input) {
        self.base = base;
        self.depth = 0;
    }

    pub fn set_crossover(&mut self, crossover: Input) {
        self.crossover = Some(crossover);
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Whether `mutation_depth` mutations have already been applied to the current base,
    /// i.e. the runner should pick a fresh base/crossover pair before calling `mutate`
    /// again.
    pub fn exhausted(&self) -> bool {
        self.depth >= self.max_depth
    }

    /// Applies one randomly-chosen mutator to the current base, writing the result into
    /// `out`. `rand_below(n)` must return a uniform value in `[0, n)`; `dictionary` may
    /// be empty, in which case the two dictionary mutators are skipped in favor of
    /// bit-flip.
    pub fn mutate(
        &mut self,
        rand_below: &mut impl FnMut(u64) -> u64,
        dictionary: &[Vec<u8>],
        out: &mut Vec<u8>,
    ) -> MutatorKind {
        out.clear();
        out.extend_from_slice(self.base.bytes());

        let mut kind = ALL_KINDS[rand_below(ALL_KINDS.len() as u64) as usize];
        if dictionary.is_empty()
            && matches!(kind, MutatorKind::DictionaryInsert | MutatorKind::DictionaryOverwrite)
        {
            kind = MutatorKind::BitFlip;
        }
        if out.is_empty() && matches!(kind, MutatorKind::Erase | MutatorKind::Replace | MutatorKind::Shuffle | MutatorKind::BitFlip | MutatorKind::ArithmeticIncrement | MutatorKind::ArithmeticDecrement | MutatorKind::DictionaryOverwrite) {
            kind = MutatorKind::Insert;
        }

        match kind {
            MutatorKind::Erase => erase(out, rand_below),
            MutatorKind::Insert => insert(out, rand_below, self.max_size),
            MutatorKind::Duplicate => duplicate(out, rand_below, self.max_size),
            MutatorKind::Replace => replace(out, rand_below),
            MutatorKind::Shuffle => shuffle(out, rand_below),
            MutatorKind::Crossover => crossover(out, self.crossover.as_ref(), rand_below, self.max_size),
            MutatorKind::DictionaryInsert => dictionary_insert(out, dictionary, rand_below, self.max_size),
            MutatorKind::DictionaryOverwrite => dictionary_overwrite(out, dictionary, rand_below),
            MutatorKind::BitFlip => bit_flip(out, rand_below),
            MutatorKind::ArithmeticIncrement => arithmetic(out, rand_below, 1),
            MutatorKind::ArithmeticDecrement => arithmetic(out, rand_below, -1),
        }

        out.truncate(self.max_size);
        self.base = Input::new(out.clone());
        self.depth += 1;
        kind
    }
}

impl Default for Mutagen {
    fn default() -> Self {
        Mutagen::new()
    }
}

fn index(rand_below: &mut impl FnMut(u64) -> u64, len: usize) -> usize {
    rand_below(len as u64) as usize
}

fn erase(buf: &mut Vec<u8>, rand_below: &mut impl FnMut(u64) -> u64) {
    if buf.is_empty() {
        return;
    }
    let i = index(rand_below, buf.len());
    buf.remove(i);
}

fn insert(buf: &mut Vec<u8>, rand_below: &mut impl FnMut(u64) -> u64, max_size: usize) {
    if buf.len() >= max_size {
        return;
    }
    let i = rand_below((buf.len() + 1) as u64) as usize;
    let byte = rand_below(256) as u8;
    buf.insert(i, byte);
}

fn duplicate(buf: &mut Vec<u8>, rand_below: &mut impl FnMut(u64) -> u64, max_size: usize) {
    if buf.is_empty() || buf.len() >= max_size {
        return;
    }
    let i = index(rand_below, buf.len());
    let byte = buf[i];
    let dest = rand_below((buf.len() + 1) as u64) as usize;
    buf.insert(dest, byte);
}

fn replace(buf: &mut Vec<u8>, rand_below: &mut impl FnMut(u64) -> u64) {
    if buf.is_empty() {
        return;
    }
    let i = index(rand_below, buf.len());
    buf[i] = rand_below(256) as u8;
}

fn shuffle(buf: &mut Vec<u8>, rand_below: &mut impl FnMut(u64) -> u64) {
    if buf.len() < 2 {
        return;
    }
    let i = index(rand_below, buf.len());
    let j = index(rand_below, buf.len());
    buf.swap(i, j);
}

fn crossover(
    buf: &mut Vec<u8>,
    other: Option<&Input>,
    rand_below: &mut impl FnMut(u64) -> u64,
    max_size: usize,
) {
    let Some(other) = other else { return };
    if other.is_empty() || buf.len() >= max_size {
        return;
    }
    let src = index(rand_below, other.len());
    let dest = rand_below((buf.len() + 1) as u64) as usize;
    buf.insert(dest, other.bytes()[src]);
}

fn dictionary_insert(
    buf: &mut Vec<u8>,
    dictionary: &[Vec<u8>],
    rand_below: &mut impl FnMut(u64) -> u64,
    max_size: usize,
) {
    if dictionary.is_empty() || buf.len() >= max_size {
        return;
    }
    let entry = &dictionary[index(rand_below, dictionary.len())];
    let dest = rand_below((buf.len() + 1) as u64) as usize;
    buf.splice(dest..dest, entry.iter().copied());
}

fn dictionary_overwrite(
    buf: &mut Vec<u8>,
    dictionary: &[Vec<u8>],
    rand_below: &mut impl FnMut(u64) -> u64,
) {
    if dictionary.is_empty() || buf.is_empty() {
        return;
    }
    let entry = &dictionary[index(rand_below, dictionary.len())];
    let dest = index(rand_below, buf.len());
    for (offset, &byte) in entry.iter().enumerate() {
        let pos = dest + offset;
        if pos >= buf.len() {
            break;
        }
        buf[pos] = byte;
    }
}

fn bit_flip(buf: &mut Vec<u8>, rand_below: &mut impl FnMut(u64) -> u64) {
    if buf.is_empty() {
        return;
    }
    let i = index(rand_below, buf.len());
    let bit = rand_below(8) as u8;
    buf[i] ^= 1 << bit;
}

fn arithmetic(buf: &mut Vec<u8>, rand_below: &mut impl FnMut(u64) -> u64, delta: i16) {
    if buf.is_empty() {
        return;
    }
    let i = index(rand_below, buf.len());
    buf[i] = (buf[i] as i16 + delta).rem_euclid(256) as u8;
}
