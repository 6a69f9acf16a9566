//! Bucket fill: group the solid k-mers of one partition by end-minimizer,
//! replicating "traveller" k-mers whose two (k-1)-mer ends repartition to
//! different partitions.
//!
//! Partitions are processed in increasing id order and the repartition is
//! monotone in minimizer order, so a traveller written while processing
//! partition p always lands in a partition >= p and is consumed there.

use crate::container::Container;
use crate::count::read_solid;
use crate::error::Error;
use crate::kmer::{decode, encode, KmerWord};
use crate::minimizer::{MinimizerModel, Repartition};
use crate::Result;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use seq_io::fasta::{Reader, Record};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A solid k-mer queued for compaction, with the minimizers of its two
/// (k-1)-mer ends.
#[derive(Copy, Clone, Debug)]
pub struct BucketEntry<W> {
    pub kmer: W,
    pub abundance: u32,
    pub left_min: u32,
    pub right_min: u32,
}

pub struct Buckets<W> {
    pub queues: Vec<Mutex<Vec<BucketEntry<W>>>>,
    /// Minimizers with a non-empty queue, in increasing value order.
    pub active: Vec<u32>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BucketStats {
    pub nb_kmers: u64,
    pub nb_doubled: u64,
    pub nb_travellers_written: u64,
    pub nb_travellers_loaded: u64,
}

/// One traveller file per partition, each guarded by its own mutex; the
/// writer appends one FASTA record (`>abundance`) per traveller and
/// flushes before releasing the lock.
pub struct TravellerFiles {
    paths: Vec<PathBuf>,
    files: Vec<Mutex<Option<BufWriter<File>>>>,
    pub written: AtomicU64,
    /// Fault-injection knob for tests: drop traveller records entirely.
    pub disabled: bool,
}

impl TravellerFiles {
    pub fn new(container: &Container, nb_partitions: usize) -> Self {
        let paths = (0..nb_partitions)
            .map(|p| container.dataset_path(&format!("tmp/travellers.{p}")))
            .collect::<Vec<_>>();
        let files = (0..nb_partitions).map(|_| Mutex::new(None)).collect();
        TravellerFiles {
            paths,
            files,
            written: AtomicU64::new(0),
            disabled: false,
        }
    }

    fn write(&self, part: usize, seq: &[u8], abundance: u32) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        let mut guard = self.files[part].lock().unwrap();
        if guard.is_none() {
            let f = File::create(&self.paths[part]).map_err(|e| Error::fs(&self.paths[part], e))?;
            *guard = Some(BufWriter::new(f));
        }
        let w = guard.as_mut().unwrap();
        w.write_all(format!(">{abundance}\n").as_bytes())
            .and_then(|_| w.write_all(seq))
            .and_then(|_| w.write_all(b"\n"))
            .and_then(|_| w.flush())
            .map_err(|e| Error::fs(&self.paths[part], e))?;
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Close, read back and delete the traveller file of one partition.
    fn drain(&self, part: usize) -> Result<Vec<(Vec<u8>, u32)>> {
        let mut guard = self.files[part].lock().unwrap();
        if let Some(mut w) = guard.take() {
            w.flush().map_err(|e| Error::fs(&self.paths[part], e))?;
        }
        drop(guard);
        let path = &self.paths[part];
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut reader = Reader::new(File::open(path).map_err(|e| Error::fs(path, e))?);
        while let Some(record) = reader.next() {
            let record = record.map_err(|e| Error::codec(path, e.to_string()))?;
            let head = std::str::from_utf8(record.head())
                .map_err(|_| Error::codec(path, "non-utf8 traveller header"))?;
            let abundance: u32 = head
                .trim()
                .parse()
                .map_err(|_| Error::codec(path, "bad traveller abundance"))?;
            let mut seq = Vec::new();
            for line in record.seq_lines() {
                seq.extend_from_slice(line);
            }
            out.push((seq, abundance));
        }
        std::fs::remove_file(path).map_err(|e| Error::fs(path, e))?;
        Ok(out)
    }
}

/// End minimizers of a canonical k-mer.
#[inline]
pub fn end_minimizers<W: KmerWord>(w: W, k: usize, model: &MinimizerModel) -> (u32, u32) {
    let left = w.shr(2);
    let right = w.bitand(W::low_mask(2 * (k as u32 - 1)));
    (
        model.minimizer_of_word(left, k - 1),
        model.minimizer_of_word(right, k - 1),
    )
}

/// Fill the buckets of partition `part` from its solid cells (all passes),
/// then absorb the travellers earlier partitions sent here.
#[allow(clippy::too_many_arguments)]
pub fn fill_partition<W: KmerWord>(
    container: &Container,
    part: usize,
    nb_passes: usize,
    k: usize,
    model: &MinimizerModel,
    repart: &Repartition,
    abundance_threshold: u32,
    travellers: &TravellerFiles,
) -> Result<(Buckets<W>, BucketStats)> {
    let nb_minimizers = 1usize << (2 * model.m());
    let queues: Vec<Mutex<Vec<BucketEntry<W>>>> =
        (0..nb_minimizers).map(|_| Mutex::new(Vec::new())).collect();
    let active: Mutex<FxHashSet<u32>> = Mutex::new(FxHashSet::default());
    let nb_kmers = AtomicU64::new(0);
    let nb_doubled = AtomicU64::new(0);
    let travellers_before = travellers.written.load(Ordering::Relaxed);

    let enqueue = |minimizer: u32, entry: BucketEntry<W>| {
        queues[minimizer as usize].lock().unwrap().push(entry);
        active.lock().unwrap().insert(minimizer);
    };

    for pass in 0..nb_passes {
        let mut cell: Vec<(W, u32)> = Vec::new();
        read_solid::<W>(container, pass, part, |c| {
            cell.push((c.value, c.abundance as u32))
        })?;
        cell.par_iter()
            .map(|&(w, abundance)| -> Result<()> {
                if abundance < abundance_threshold {
                    return Ok(());
                }
                let (left_min, right_min) = end_minimizers(w, k, model);
                let entry = BucketEntry {
                    kmer: w,
                    abundance,
                    left_min,
                    right_min,
                };
                nb_kmers.fetch_add(1, Ordering::Relaxed);
                let p = part as u32;
                if repart.get(left_min) != p && repart.get(right_min) != p {
                    return Err(Error::CompactionInvariant {
                        partition: part,
                        reason: format!(
                            "k-mer {} repartitions to neither end partition",
                            String::from_utf8_lossy(&decode(w, k))
                        ),
                    });
                }
                if repart.get(left_min) == p {
                    enqueue(left_min, entry);
                }
                if left_min != right_min {
                    nb_doubled.fetch_add(1, Ordering::Relaxed);
                    if repart.get(right_min) == p {
                        enqueue(right_min, entry);
                    }
                    let max_min = model.max_of(left_min, right_min);
                    let min_min = model.min_of(left_min, right_min);
                    if repart.get(max_min) != repart.get(min_min) {
                        if repart.get(max_min) < repart.get(min_min) {
                            return Err(Error::CompactionInvariant {
                                partition: part,
                                reason: "repartition is not monotone in minimizer order".into(),
                            });
                        }
                        travellers.write(
                            repart.get(max_min) as usize,
                            &decode(w, k),
                            abundance,
                        )?;
                    }
                }
                Ok(())
            })
            .collect::<Result<()>>()?;
    }

    // travellers sent to this partition by earlier ones
    let loaded = travellers.drain(part)?;
    let nb_loaded = loaded.len() as u64;
    for (seq, abundance) in loaded {
        let w: W = encode(&seq).ok_or_else(|| {
            Error::codec(&travellers.paths[part], "non-ACGT traveller sequence")
        })?;
        let (left_min, right_min) = end_minimizers(w, k, model);
        let max_min = model.max_of(left_min, right_min);
        enqueue(
            max_min,
            BucketEntry {
                kmer: w,
                abundance,
                left_min,
                right_min,
            },
        );
    }

    let mut active: Vec<u32> = active.into_inner().unwrap().into_iter().collect();
    active.sort_unstable();
    let stats = BucketStats {
        nb_kmers: nb_kmers.load(Ordering::Relaxed),
        nb_doubled: nb_doubled.load(Ordering::Relaxed),
        nb_travellers_written: travellers.written.load(Ordering::Relaxed) - travellers_before,
        nb_travellers_loaded: nb_loaded,
    };
    Ok((
        Buckets {
            queues,
            active,
        },
        stats,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minimizer::MinimizerOrder;

    #[test]
    fn end_minimizers_come_from_the_two_k1_mers() {
        let model = MinimizerModel::new(3, MinimizerOrder::Lex);
        let w: u64 = crate::kmer::encode(b"AGGCGTT").unwrap();
        let (l, r) = end_minimizers(w, 7, &model);
        // left (k-1)-mer AGGCGT, right GGCGTT
        assert_eq!(l, model.minimizer_of_word(crate::kmer::encode::<u64>(b"AGGCGT").unwrap(), 6));
        assert_eq!(r, model.minimizer_of_word(crate::kmer::encode::<u64>(b"GGCGTT").unwrap(), 6));
    }

    #[test]
    fn traveller_files_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let container = Container::open(dir.path().join("t.store")).unwrap();
        let tf = TravellerFiles::new(&container, 3);
        tf.write(2, b"ACGTACG", 7).unwrap();
        tf.write(2, b"TTTTAAA", 9).unwrap();
        assert_eq!(tf.written.load(Ordering::Relaxed), 2);
        let drained = tf.drain(2).unwrap();
        assert_eq!(
            drained,
            vec![(b"ACGTACG".to_vec(), 7), (b"TTTTAAA".to_vec(), 9)]
        );
        // consumed and deleted
        assert!(tf.drain(2).unwrap().is_empty());
    }
}
