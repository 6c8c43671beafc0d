//! Component F (part one): seed/live corpora and the input value type.
//!
//! No `original_source` file for this component was retrieved alongside the rest of the
//! pack (corpus on-disk I/O is explicitly out of scope per the design's scope table), so
//! this module follows `spec.md` §3/§4.F directly: an ordered set of inputs with an
//! implicit empty input at index 0, sorted by `(length asc, features desc, lexicographic)`,
//! with no duplicates.

mod dictionary;

pub use dictionary::Dictionary;

use std::cmp::Ordering;
use std::path::Path;

use crate::error::{Error, Result};

/// A test input: a byte buffer plus the feature count it was tagged with when kept.
/// Immutable once enqueued for a run, per the data model — callers clone to mutate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    bytes: Vec<u8>,
    num_features: usize,
}

impl Input {
    pub fn new(bytes: Vec<u8>) -> Self {
        Input {
            bytes,
            num_features: 0,
        }
    }

    pub fn empty() -> Self {
        Input::new(Vec::new())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn with_num_features(mut self, num_features: usize) -> Self {
        self.num_features = num_features;
        self
    }

    pub fn set_num_features(&mut self, num_features: usize) {
        self.num_features = num_features;
    }
}

impl From<Vec<u8>> for Input {
    fn from(bytes: Vec<u8>) -> Self {
        Input::new(bytes)
    }
}

/// Orders entries by `(length asc, num_features desc, lexicographic)`, per the corpus
/// invariant in `spec.md` §3.
fn cmp_entries(a: &Input, b: &Input) -> Ordering {
    a.bytes
        .len()
        .cmp(&b.bytes.len())
        .then_with(|| b.num_features.cmp(&a.num_features))
        .then_with(|| a.bytes.cmp(&b.bytes))
}

/// An ordered, duplicate-free set of inputs. Position 0 is always the empty input.
#[derive(Debug, Clone)]
pub struct Corpus {
    entries: Vec<Input>,
    max_input_size: usize,
}

impl Corpus {
    /// Creates a corpus pre-seeded with the implicit empty input at index 0, per
    /// `spec.md` §3 and the `original_source` construction-time behavior noted in
    /// `SPEC_FULL.md` §4.F.
    pub fn new() -> Self {
        Corpus {
            entries: vec![Input::empty()],
            max_input_size: usize::MAX,
        }
    }

    /// Applies the options' `max_input_size` bound to subsequent `add`s.
    pub fn configure(&mut self, max_input_size: usize) {
        self.max_input_size = max_input_size;
    }

    /// Inserts `input` in sorted position. Returns `Ok(false)` without modifying the
    /// corpus if an input with identical bytes is already present (idempotent), and
    /// `Err(InvalidArgument)` if `input` exceeds `max_input_size`.
    pub fn add(&mut self, input: Input) -> Result<bool> {
        if input.bytes.len() > self.max_input_size {
            return Err(Error::InvalidArgument(format!(
                "input of {} bytes exceeds max_input_size {}",
                input.bytes.len(),
                self.max_input_size
            )));
        }
        let pos = self.entries.partition_point(|e| cmp_entries(e, &input) == Ordering::Less);
        if self.entries[pos..]
            .iter()
            .take_while(|e| e.bytes.len() == input.bytes.len())
            .any(|e| e.bytes == input.bytes)
        {
            return Ok(false);
        }
        self.entries.insert(pos, input);
        Ok(true)
    }

    /// Copies the input at `index` into `in_out_input`, overwriting its previous
    /// contents, so callers can reuse one buffer across repeated lookups.
    pub fn at(&self, index: usize, in_out_input: &mut Input) -> Result<()> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| Error::InvalidArgument(format!("corpus index {index} out of range")))?;
        in_out_input.bytes.clear();
        in_out_input.bytes.extend_from_slice(&entry.bytes);
        in_out_input.num_features = entry.num_features;
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&Input> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Input> {
        self.entries.iter()
    }

    pub fn num_inputs(&self) -> usize {
        self.entries.len()
    }

    pub fn total_size(&self) -> usize {
        self.entries.iter().map(Input::len).sum()
    }

    /// Selects an input with weighted randomness favoring smaller inputs carrying more
    /// features -- libFuzzer's "entropic" heuristic -- unless `disable_entropic` asks
    /// for uniform random choice instead (see the Open Question in the design notes on
    /// why both need to stay selectable).
    pub fn pick(&self, rand: &mut impl FnMut(u64) -> u64, disable_entropic: bool) -> &Input {
        assert!(!self.entries.is_empty(), "corpus always has the empty input");
        if disable_entropic || self.entries.len() == 1 {
            let index = rand(self.entries.len() as u64) as usize;
            return &self.entries[index];
        }
        let weights: Vec<f64> = self
            .entries
            .iter()
            .map(|e| (e.num_features as f64 + 1.0) / (e.bytes.len() as f64 + 1.0))
            .collect();
        let total: f64 = weights.iter().sum();
        let mut threshold = (rand(1_000_000) as f64 / 1_000_000.0) * total;
        for (entry, weight) in self.entries.iter().zip(weights.iter()) {
            if threshold < *weight {
                return entry;
            }
            threshold -= weight;
        }
        self.entries.last().unwrap()
    }

    /// Reads every regular file under each directory in `paths` as one input and `add`s
    /// it. Ordering on disk is immaterial -- the corpus is already kept sorted.
    pub async fn load(&mut self, paths: &[impl AsRef<Path>]) -> Result<()> {
        for dir in paths {
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                let bytes = tokio::fs::read(entry.path()).await?;
                self.add(Input::new(bytes))?;
            }
        }
        Ok(())
    }
}

impl Default for Corpus {
    fn default() -> Self {
        Corpus::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_always_index_zero() {
        let corpus = Corpus::new();
        assert_eq!(corpus.num_inputs(), 1);
        assert_eq!(corpus.get(0).unwrap().bytes(), b"");
    }

    #[test]
    fn add_is_idempotent_and_keeps_sort_order() {
        let mut corpus = Corpus::new();
        assert!(corpus.add(Input::new(b"bb".to_vec())).unwrap());
        assert!(corpus.add(Input::new(b"a".to_vec())).unwrap());
        assert!(!corpus.add(Input::new(b"bb".to_vec())).unwrap());
        assert_eq!(corpus.num_inputs(), 3);
        let lengths: Vec<usize> = corpus.iter().map(Input::len).collect();
        assert_eq!(lengths, vec![0, 1, 2]);
    }

    #[test]
    fn add_rejects_oversize_input() {
        let mut corpus = Corpus::new();
        corpus.configure(1);
        let err = corpus.add(Input::new(vec![0, 1])).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn sort_breaks_length_ties_by_features_desc_then_lex() {
        let mut corpus = Corpus::new();
        corpus.add(Input::new(b"bb".to_vec()).with_num_features(1)).unwrap();
        corpus.add(Input::new(b"aa".to_vec()).with_num_features(2)).unwrap();
        let bytes: Vec<&[u8]> = corpus.iter().skip(1).map(Input::bytes).collect();
        assert_eq!(bytes, vec![b"aa".as_slice(), b"bb".as_slice()]);
    }

    #[test]
    fn at_reuses_provided_buffer() {
        let mut corpus = Corpus::new();
        corpus.add(Input::new(b"hi".to_vec())).unwrap();
        let mut buf = Input::new(vec![9, 9, 9, 9, 9]);
        corpus.at(1, &mut buf).unwrap();
        assert_eq!(buf.bytes(), b"hi");
    }

    #[test]
    fn pick_with_entropic_disabled_is_uniform_over_indices() {
        let mut corpus = Corpus::new();
        corpus.add(Input::new(b"a".to_vec())).unwrap();
        corpus.add(Input::new(b"b".to_vec())).unwrap();
        let picked = corpus.pick(&mut |_n| 1, true);
        assert_eq!(picked.bytes(), b"a");
    }
}
