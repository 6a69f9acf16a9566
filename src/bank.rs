//! Input banks: FASTA files (possibly compressed), iterated once per pass.
//!
//! The engine only needs sequential record access and a cheap volume
//! estimate; everything else about input formats stays outside.

use crate::error::Error;
use crate::kmer::SEQ_NT4_TABLE;
use crate::Result;
use regex::bytes::{Regex, RegexBuilder};
use seq_io::fasta::Reader;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const ESTIMATION_RECORDS: u64 = 50_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct BankEstimate {
    pub sequences: u64,
    pub bases: u64,
}

pub struct Bank {
    path: PathBuf,
}

struct CountingReader<R> {
    inner: R,
    consumed: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

impl Bank {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(Error::Configuration(format!(
                "input bank {} does not exist",
                path.display()
            )));
        }
        Ok(Bank { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fresh decompressing reader over the whole bank.
    pub fn reader(&self) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path).map_err(|e| Error::fs(&self.path, e))?;
        let (reader, _format) = niffler::send::get_reader(Box::new(file))
            .map_err(|e| Error::codec(&self.path, format!("cannot open: {e}")))?;
        Ok(reader)
    }

    /// Estimate record and base counts by sampling the head of the file and
    /// extrapolating from the compressed bytes consumed.
    pub fn estimate(&self) -> Result<BankEstimate> {
        let file_size = std::fs::metadata(&self.path)
            .map_err(|e| Error::fs(&self.path, e))?
            .len();
        let consumed = Arc::new(AtomicU64::new(0));
        let file = File::open(&self.path).map_err(|e| Error::fs(&self.path, e))?;
        let counting = CountingReader {
            inner: file,
            consumed: consumed.clone(),
        };
        let (reader, _format) = niffler::send::get_reader(Box::new(counting))
            .map_err(|e| Error::codec(&self.path, format!("cannot open: {e}")))?;
        let mut reader = Reader::new(reader);

        let mut sequences = 0u64;
        let mut bases = 0u64;
        while let Some(record) = reader.next() {
            let record = record.map_err(|e| Error::codec(&self.path, e.to_string()))?;
            sequences += 1;
            bases += record
                .seq_lines()
                .map(|line| line.len() as u64)
                .sum::<u64>();
            if sequences >= ESTIMATION_RECORDS {
                break;
            }
        }
        if sequences == 0 {
            return Err(Error::Configuration(format!(
                "empty input bank {}",
                self.path.display()
            )));
        }
        let seen = consumed.load(Ordering::Relaxed).max(1);
        if sequences < ESTIMATION_RECORDS || seen >= file_size {
            return Ok(BankEstimate { sequences, bases });
        }
        let ratio = file_size as f64 / seen as f64;
        Ok(BankEstimate {
            sequences: (sequences as f64 * ratio) as u64,
            bases: (bases as f64 * ratio) as u64,
        })
    }

    /// Sequential iteration over raw records.
    pub fn for_each_record(&self, mut f: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
        let mut reader = Reader::new(self.reader()?);
        let mut seq = Vec::new();
        while let Some(record) = reader.next() {
            let record = record.map_err(|e| Error::codec(&self.path, e.to_string()))?;
            seq.clear();
            for line in record.seq_lines() {
                seq.extend_from_slice(line);
            }
            f(&seq)?;
        }
        Ok(())
    }
}

/// An album of banks, one per input file; bank ids follow input order.
pub struct BankAlbum {
    pub banks: Vec<Bank>,
}

impl BankAlbum {
    pub fn open(paths: &[PathBuf]) -> Result<Self> {
        if paths.is_empty() {
            return Err(Error::Configuration("no input bank given".into()));
        }
        let banks = paths.iter().map(Bank::open).collect::<Result<Vec<_>>>()?;
        Ok(BankAlbum { banks })
    }

    pub fn nb_banks(&self) -> usize {
        self.banks.len()
    }

    pub fn estimate(&self) -> Result<BankEstimate> {
        let mut total = BankEstimate::default();
        for bank in &self.banks {
            let e = bank.estimate()?;
            total.sequences += e.sequences;
            total.bases += e.bases;
        }
        Ok(total)
    }
}

/// Splits read sequences on N runs and strips line breaks, producing 2-bit
/// code chunks. Any character outside ACGTN is a codec error.
pub struct SeqSplitter {
    match_invalid: Regex,
    match_n: Regex,
}

impl Clone for SeqSplitter {
    fn clone(&self) -> Self {
        SeqSplitter::new()
    }
}

impl Default for SeqSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl SeqSplitter {
    pub fn new() -> Self {
        let match_invalid = RegexBuilder::new(r"[^ACGTN\r\n]")
            .case_insensitive(true)
            .unicode(false)
            .build()
            .unwrap();
        let match_n = RegexBuilder::new(r"[N\r\n]+")
            .case_insensitive(true)
            .unicode(false)
            .build()
            .unwrap();
        SeqSplitter {
            match_invalid,
            match_n,
        }
    }

    /// Calls `f` with each chunk of 2-bit codes at least `min_len` long.
    pub fn chunks(
        &self,
        seq: &[u8],
        min_len: usize,
        path: &Path,
        mut f: impl FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        if let Some(m) = self.match_invalid.find(seq) {
            return Err(Error::codec(
                path,
                format!("invalid character {:?} in sequence", seq[m.start()] as char),
            ));
        }
        let mut codes = Vec::with_capacity(seq.len());
        for frag in self.match_n.split(seq) {
            if frag.len() < min_len {
                continue;
            }
            codes.clear();
            codes.extend(frag.iter().map(|&b| SEQ_NT4_TABLE[b as usize]));
            debug_assert!(codes.iter().all(|&c| c < 4));
            f(&codes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fasta(records: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for (i, seq) in records.iter().enumerate() {
            writeln!(f, ">{i}\n{seq}").unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn exact_estimate_for_small_banks() {
        let f = write_fasta(&["ACGTACGT", "GGGG"]);
        let bank = Bank::open(f.path()).unwrap();
        let e = bank.estimate().unwrap();
        assert_eq!(e.sequences, 2);
        assert_eq!(e.bases, 12);
    }

    #[test]
    fn splitter_breaks_on_n_runs() {
        let s = SeqSplitter::new();
        let mut chunks = Vec::new();
        s.chunks(b"ACGTNNNGGTT", 2, Path::new("x"), |c| {
            chunks.push(c.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(chunks, vec![vec![0, 1, 2, 3], vec![2, 2, 3, 3]]);
    }

    #[test]
    fn splitter_rejects_garbage() {
        let s = SeqSplitter::new();
        let err = s
            .chunks(b"ACXGT", 1, Path::new("reads.fa"), |_| Ok(()))
            .unwrap_err();
        assert!(err.to_string().contains("reads.fa"));
    }

    #[test]
    fn empty_bank_is_a_configuration_error() {
        let f = write_fasta(&[]);
        let bank = Bank::open(f.path()).unwrap();
        assert!(matches!(
            bank.estimate(),
            Err(Error::Configuration(_))
        ));
    }
}
