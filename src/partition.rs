//! Read streaming: slide a k-mer model over every read and append
//! super-k-mers to on-disk partition files keyed by minimizer repartition.
//!
//! A record is two words: the super-k-mer word (run length in the high
//! byte, 2-bit extension nucleotides below) followed by the seed k-mer
//! (first k-mer of the run, forward strand). Each worker owns one write
//! cache per partition, flushed under that partition's mutex.

use crate::bank::{BankAlbum, SeqSplitter};
use crate::config::{EngineConfig, Layout};
use crate::container::Container;
use crate::error::Error;
use crate::kmer::{wang_hash64, KmerWord};
use crate::minimizer::{split_superkmers, MinimizerModel, Repartition};
use crate::Result;
use seq_io_parallel::{MinimalRefRecord, ParallelProcessor, ParallelReader};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const CACHE_FLUSH_BYTES: usize = 1 << 16;

pub struct PartFile {
    writer: BufWriter<File>,
    bytes: u64,
}

/// Output of one partitioning pass.
pub struct PassOutput {
    pub files: Vec<PathBuf>,
    /// records_per_bank[bank][partition]
    pub records_per_bank: Vec<Vec<u64>>,
    pub nb_superkmers: u64,
}

pub fn superkmer_file(container: &Container, pass: usize, part: usize) -> PathBuf {
    container.dataset_path(&format!("tmp/superkmers.{pass}.{part}"))
}

/// Longest run one record can carry for span `W`.
pub fn superkmer_capacity<W: KmerWord>() -> usize {
    (((W::BITS - 8) / 2) as usize + 1).min(255)
}

struct Shared<'a> {
    files: &'a [Mutex<PartFile>],
    records: &'a [AtomicU64],
    superkmers: &'a AtomicU64,
    budget: Option<u64>,
    error: &'a Mutex<Option<Error>>,
}

struct SuperkmerPartitioner<'a, W: KmerWord> {
    k: usize,
    pass: usize,
    nb_passes: usize,
    model: &'a MinimizerModel,
    repart: &'a Repartition,
    shared: &'a Shared<'a>,
    splitter: SeqSplitter,
    path: PathBuf,
    caches: Vec<Vec<u8>>,
    cached_records: Vec<u64>,
    _span: PhantomData<W>,
}

impl<W: KmerWord> Clone for SuperkmerPartitioner<'_, W> {
    fn clone(&self) -> Self {
        SuperkmerPartitioner {
            k: self.k,
            pass: self.pass,
            nb_passes: self.nb_passes,
            model: self.model,
            repart: self.repart,
            shared: self.shared,
            splitter: SeqSplitter::new(),
            path: self.path.clone(),
            caches: vec![Vec::new(); self.caches.len()],
            cached_records: vec![0; self.cached_records.len()],
            _span: PhantomData,
        }
    }
}

impl<W: KmerWord> SuperkmerPartitioner<'_, W> {
    fn encode_record(&self, codes: &[u8], start: usize, nb: usize, out: &mut Vec<u8>) {
        let mut superk = W::from_u64(nb as u64).shl(W::BITS - 8);
        for j in 0..nb - 1 {
            let nt = codes[start + self.k + j];
            superk = superk.bitor(W::from_u64(nt as u64).shl(2 * (nb - 2 - j) as u32));
        }
        let mut seed = W::zero();
        for &nt in &codes[start..start + self.k] {
            seed = seed.shl(2).bitor(W::from_u64(nt as u64));
        }
        superk.write_le(out);
        seed.write_le(out);
    }

    fn flush_partition(&mut self, p: usize) -> Result<()> {
        if self.caches[p].is_empty() {
            return Ok(());
        }
        let mut file = self.shared.files[p].lock().unwrap();
        file.bytes += self.caches[p].len() as u64;
        if let Some(budget) = self.shared.budget {
            if file.bytes > budget {
                return Err(Error::PartitionOverflow {
                    partition: p,
                    written: file.bytes,
                    budget,
                });
            }
        }
        file.writer
            .write_all(&self.caches[p])
            .map_err(|e| Error::fs(&self.path, e))?;
        drop(file);
        self.caches[p].clear();
        self.shared.records[p].fetch_add(self.cached_records[p], Ordering::Relaxed);
        self.cached_records[p] = 0;
        Ok(())
    }

    fn flush_all(&mut self) -> Result<()> {
        for p in 0..self.caches.len() {
            self.flush_partition(p)?;
        }
        Ok(())
    }

    fn fail(&self, e: Error) {
        let mut slot = self.shared.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        }
    }
}

impl<W: KmerWord> ParallelProcessor for SuperkmerPartitioner<'_, W> {
    fn process_record<'a, Rf: MinimalRefRecord<'a>>(&mut self, record: Rf) -> anyhow::Result<()> {
        if self.shared.error.lock().unwrap().is_some() {
            anyhow::bail!("partitioning aborted");
        }
        let k = self.k;
        let cap = superkmer_capacity::<W>();
        let mut local_superkmers = 0u64;
        let mut to_flush: Vec<usize> = Vec::new();

        let splitter = std::mem::take(&mut self.splitter);
        let path = self.path.clone();
        let res = splitter.chunks(record.ref_seq(), k, &path, |codes| {
            let mut runs = Vec::new();
            split_superkmers(codes, k, self.model, |sk| runs.push(sk));
            for sk in runs {
                if self.nb_passes > 1
                    && wang_hash64(sk.minimizer as u64) % self.nb_passes as u64
                        != self.pass as u64
                {
                    continue;
                }
                let p = self.repart.get(sk.minimizer) as usize;
                // long runs are split to fit the span carrier
                let mut start = sk.start;
                let mut left = sk.nb_kmers;
                while left > 0 {
                    let nb = left.min(cap);
                    let cache = &mut self.caches[p];
                    // borrow dance: encode into a scratch through self
                    let mut scratch = std::mem::take(cache);
                    self.encode_record(codes, start, nb, &mut scratch);
                    self.caches[p] = scratch;
                    self.cached_records[p] += 1;
                    local_superkmers += 1;
                    start += nb;
                    left -= nb;
                }
                if self.caches[p].len() >= CACHE_FLUSH_BYTES {
                    to_flush.push(p);
                }
            }
            Ok(())
        });
        self.splitter = splitter;
        if let Err(e) = res {
            self.fail(e);
            anyhow::bail!("partitioning aborted");
        }
        for p in to_flush {
            if let Err(e) = self.flush_partition(p) {
                self.fail(e);
                anyhow::bail!("partitioning aborted");
            }
        }
        self.shared
            .superkmers
            .fetch_add(local_superkmers, Ordering::Relaxed);
        Ok(())
    }
}

impl<W: KmerWord> Drop for SuperkmerPartitioner<'_, W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all() {
            self.fail(e);
        }
    }
}

/// Run one pass: stream every bank once, appending matching super-k-mers
/// to the pass's partition files. Banks are processed one after another so
/// per-bank record ranges stay contiguous in each file.
pub fn partition_pass<W: KmerWord>(
    album: &BankAlbum,
    cfg: &EngineConfig,
    layout: Layout,
    pass: usize,
    model: &MinimizerModel,
    repart: &Repartition,
    container: &Container,
    nb_threads: usize,
) -> Result<PassOutput> {
    let q = layout.nb_partitions;
    let files_paths: Vec<PathBuf> = (0..q).map(|p| superkmer_file(container, pass, p)).collect();
    let files: Vec<Mutex<PartFile>> = files_paths
        .iter()
        .map(|path| {
            let f = File::create(path).map_err(|e| Error::fs(path, e))?;
            Ok(Mutex::new(PartFile {
                writer: BufWriter::new(f),
                bytes: 0,
            }))
        })
        .collect::<Result<Vec<_>>>()?;

    let superkmers = AtomicU64::new(0);
    let error = Mutex::new(None);
    let record_counters: Vec<AtomicU64> = (0..q).map(|_| AtomicU64::new(0)).collect();
    let shared = Shared {
        files: &files,
        records: &record_counters,
        superkmers: &superkmers,
        budget: layout.partition_budget(cfg),
        error: &error,
    };
    let mut records_per_bank = Vec::with_capacity(album.nb_banks());

    for bank in &album.banks {
        let processor = SuperkmerPartitioner::<W> {
            k: cfg.kmer_size,
            pass,
            nb_passes: layout.nb_passes,
            model,
            repart,
            shared: &shared,
            splitter: SeqSplitter::new(),
            path: bank.path().to_path_buf(),
            caches: vec![Vec::new(); q],
            cached_records: vec![0; q],
            _span: PhantomData,
        };
        let reader = seq_io::fasta::Reader::new(bank.reader()?);
        let outcome = reader.process_parallel(processor, nb_threads);
        // a recorded engine error (overflow, codec) wins over the pool's
        // generic abort error
        if let Some(e) = error.lock().unwrap().take() {
            return Err(e);
        }
        outcome.map_err(|e| Error::codec(bank.path(), e.to_string()))?;
        records_per_bank.push(
            record_counters
                .iter()
                .map(|c| c.swap(0, Ordering::Relaxed))
                .collect(),
        );
    }

    for (path, file) in files_paths.iter().zip(files) {
        let mut file = file.into_inner().unwrap();
        file.writer.flush().map_err(|e| Error::fs(path, e))?;
    }

    Ok(PassOutput {
        files: files_paths,
        records_per_bank,
        nb_superkmers: superkmers.load(Ordering::Relaxed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_respects_the_span() {
        assert_eq!(superkmer_capacity::<u64>(), 29);
        assert_eq!(superkmer_capacity::<u128>(), 61);
        assert_eq!(superkmer_capacity::<crate::kmer::W192>(), 93);
    }

    #[test]
    fn record_layout_matches_the_reader_side() {
        // encode by hand what encode_record produces for ACGTAC, k=4
        let codes = [0u8, 1, 2, 3, 0, 1]; // ACGTAC -> 3 kmers
        let k = 4;
        let nb = 3usize;
        let mut superk: u64 = (nb as u64) << (64 - 8);
        // extensions: codes[4]=A at shift 2*(3-2-0)=2, codes[5]=C at shift 0
        superk |= (codes[k] as u64) << 2;
        superk |= codes[k + 1] as u64;
        let seed: u64 = crate::kmer::encode::<u64>(b"ACGT").unwrap();

        let nbk = (superk >> (64 - 8)) & 255;
        assert_eq!(nbk, 3);
        // walk the extensions the way the counter does
        let mut rem = nbk;
        let mut got = Vec::new();
        for _ in 0..nbk {
            if rem < 2 {
                break;
            }
            got.push(((superk >> (2 * (rem - 2))) & 3) as u8);
            rem -= 1;
        }
        assert_eq!(got, vec![0, 1]);
        assert_eq!(seed, 0b00_01_10_11);
    }
}
