//! Per-bucket compaction: build the local graph on (k-1)-mer junctions and
//! walk maximal non-branching paths into unitig fragments.
//!
//! Two k-mers are joined only at a junction whose minimizer is the bucket
//! minimizer; a junction owned by another bucket leaves the end marked for
//! the glue phase. Fragments from two buckets overlap by one full k-mer at
//! marked ends, which is what glue later collapses.

use crate::bucket::{BucketEntry, Buckets};
use crate::container::Container;
use crate::error::Error;
use crate::kmer::{canonical, decode, revcomp, KmerWord, NT_CHARS};
use crate::Result;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const LEFT: usize = 0;
const RIGHT: usize = 1;

/// A compacted path with its glue marks and per-k-mer abundances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub seq: Vec<u8>,
    pub abundances: Vec<u32>,
    pub lmark: bool,
    pub rmark: bool,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Orient {
    Fwd,
    Rc,
}

fn oriented<W: KmerWord>(e: &BucketEntry<W>, o: Orient, k: usize) -> W {
    match o {
        Orient::Fwd => e.kmer,
        Orient::Rc => revcomp(e.kmer, k),
    }
}

/// Compact one minimizer bucket into unitig fragments.
pub fn compact_bucket<W: KmerWord>(
    entries: &[BucketEntry<W>],
    bucket_min: u32,
    k: usize,
    part: usize,
) -> Result<Vec<Fragment>> {
    let n = entries.len();
    let k1_mask = W::low_mask(2 * (k as u32 - 1));

    // index every k-mer end owned by this bucket, keyed by the canonical
    // junction (k-1)-mer
    let mut junctions: FxHashMap<W, SmallVec<[(u32, usize); 4]>> = FxHashMap::default();
    for (i, e) in entries.iter().enumerate() {
        if e.left_min == bucket_min {
            let left = e.kmer.shr(2);
            junctions
                .entry(canonical(left, k - 1))
                .or_default()
                .push((i as u32, LEFT));
        }
        if e.right_min == bucket_min {
            let right = e.kmer.bitand(k1_mask);
            junctions
                .entry(canonical(right, k - 1))
                .or_default()
                .push((i as u32, RIGHT));
        }
    }

    // polarity: does this end read the junction representative when the
    // junction is placed on its right side?
    let polarity = |i: u32, end: usize, rep: W| -> bool {
        let e = &entries[i as usize];
        match end {
            RIGHT => e.kmer.bitand(k1_mask) == rep,
            _ => revcomp(e.kmer.shr(2), k - 1) == rep,
        }
    };

    let mut links: Vec<[Option<(u32, usize)>; 2]> = vec![[None, None]; n];
    for (&rep, incidences) in &junctions {
        if incidences.len() != 2 {
            continue; // dead end or true branching: the path stops here
        }
        let (i, ei) = incidences[0];
        let (j, ej) = incidences[1];
        if i == j {
            continue; // single-k-mer loop
        }
        if rep == revcomp(rep, k - 1) {
            continue; // self-reverse junction cannot be walked through
        }
        if polarity(i, ei, rep) == polarity(j, ej, rep) {
            continue; // both ends converge into the junction: branching
        }
        links[i as usize][ei] = Some((j, ej));
        links[j as usize][ej] = Some((i, ei));
    }

    let mut visited = vec![false; n];
    let mut fragments = Vec::new();

    let mut walk = |start: usize,
                    start_slot: usize,
                    links: &[[Option<(u32, usize)>; 2]],
                    visited: &mut [bool]|
     -> Result<()> {
        let mut cur = start;
        let mut orient = if start_slot == LEFT {
            Orient::Fwd
        } else {
            Orient::Rc
        };
        let mut seq = decode(oriented(&entries[cur], orient, k), k);
        let mut abundances = vec![entries[cur].abundance];
        let first_orient = orient;
        loop {
            if visited[cur] {
                return Err(Error::CompactionInvariant {
                    partition: part,
                    reason: format!("bucket {bucket_min} walked a k-mer twice"),
                });
            }
            visited[cur] = true;
            let exit_slot = if orient == Orient::Fwd { RIGHT } else { LEFT };
            let Some((next, enter_slot)) = links[cur][exit_slot] else {
                break;
            };
            let next = next as usize;
            let next_orient = if enter_slot == LEFT {
                Orient::Fwd
            } else {
                Orient::Rc
            };
            let w = oriented(&entries[next], next_orient, k);
            debug_assert_eq!(
                oriented(&entries[cur], orient, k).bitand(k1_mask),
                w.shr(2),
                "joined k-mers do not overlap"
            );
            seq.push(NT_CHARS[w.low2() as usize]);
            abundances.push(entries[next].abundance);
            cur = next;
            orient = next_orient;
        }
        // terminal minimizers are strand-independent, so the oriented ends
        // map back to the recorded left/right minimizers
        let first = &entries[start];
        let last = &entries[cur];
        let left_end_min = if first_orient == Orient::Fwd {
            first.left_min
        } else {
            first.right_min
        };
        let right_end_min = if orient == Orient::Fwd {
            last.right_min
        } else {
            last.left_min
        };
        fragments.push(Fragment {
            seq,
            abundances,
            lmark: left_end_min != bucket_min,
            rmark: right_end_min != bucket_min,
        });
        Ok(())
    };

    for i in 0..n {
        if visited[i] {
            continue;
        }
        let start_slot = if links[i][LEFT].is_none() {
            LEFT
        } else if links[i][RIGHT].is_none() {
            RIGHT
        } else {
            continue; // part of a cycle, handled below
        };
        walk(i, start_slot, &links, &mut visited)?;
    }

    // circular components: cut one link and emit the linear remainder
    for i in 0..n {
        if visited[i] {
            continue;
        }
        let Some((j, ej)) = links[i][RIGHT] else {
            return Err(Error::CompactionInvariant {
                partition: part,
                reason: format!("bucket {bucket_min} has a half-linked leftover k-mer"),
            });
        };
        let mut links = links.clone();
        links[i][RIGHT] = None;
        links[j as usize][ej] = None;
        walk(i, RIGHT, &links, &mut visited)?;
    }

    if visited.iter().any(|v| !v) {
        return Err(Error::CompactionInvariant {
            partition: part,
            reason: format!("bucket {bucket_min} still has unprocessed k-mers"),
        });
    }
    Ok(fragments)
}

/// Per-worker glue output files, written in plain FASTA with a
/// `lmark rmark a1 a2 ... an` header.
pub struct GlueFiles {
    paths: Vec<PathBuf>,
    writers: Vec<Mutex<BufWriter<File>>>,
    counts: Vec<AtomicU64>,
}

impl GlueFiles {
    pub fn create(container: &Container, nb_workers: usize) -> Result<Self> {
        let mut paths = Vec::new();
        let mut writers = Vec::new();
        for i in 0..nb_workers.max(1) {
            let path = container.dataset_path(&format!("tmp/glue.{i}"));
            let f = File::create(&path).map_err(|e| Error::fs(&path, e))?;
            paths.push(path);
            writers.push(Mutex::new(BufWriter::new(f)));
        }
        let counts = (0..nb_workers.max(1)).map(|_| AtomicU64::new(0)).collect();
        Ok(GlueFiles {
            paths,
            writers,
            counts,
        })
    }

    pub fn append(&self, fragment: &Fragment) -> Result<()> {
        let slot = rayon::current_thread_index().unwrap_or(0) % self.writers.len();
        let mut header = String::with_capacity(4 + 4 * fragment.abundances.len());
        header.push(if fragment.lmark { '1' } else { '0' });
        header.push(if fragment.rmark { '1' } else { '0' });
        for a in &fragment.abundances {
            header.push(' ');
            header.push_str(&a.to_string());
        }
        let mut w = self.writers[slot].lock().unwrap();
        w.write_all(b">")
            .and_then(|_| w.write_all(header.as_bytes()))
            .and_then(|_| w.write_all(b"\n"))
            .and_then(|_| w.write_all(&fragment.seq))
            .and_then(|_| w.write_all(b"\n"))
            .map_err(|e| Error::fs(&self.paths[slot], e))?;
        self.counts[slot].fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flush everything and return the non-empty glue files, also recording
    /// the list in the container for inspection.
    pub fn finish(self, container: &Container) -> Result<Vec<PathBuf>> {
        let mut non_empty = Vec::new();
        let mut list = String::new();
        for ((path, writer), count) in self.paths.into_iter().zip(self.writers).zip(self.counts) {
            let mut w = writer.into_inner().unwrap();
            w.flush().map_err(|e| Error::fs(&path, e))?;
            if count.load(Ordering::Relaxed) > 0 {
                list.push_str(&path.to_string_lossy());
                list.push('\n');
                non_empty.push(path);
            } else {
                std::fs::remove_file(&path).map_err(|e| Error::fs(&path, e))?;
            }
        }
        container.write_dataset("tmp/glue.list", list.as_bytes())?;
        Ok(non_empty)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CompactStats {
    pub nb_buckets: u64,
    pub nb_fragments: u64,
    pub max_bucket: u64,
}

/// Compact every active bucket of a partition on the worker pool, writing
/// fragments to the per-worker glue files.
pub fn compact_partition<W: KmerWord>(
    buckets: &Buckets<W>,
    k: usize,
    part: usize,
    glue: &GlueFiles,
) -> Result<CompactStats> {
    let nb_fragments = AtomicU64::new(0);
    let max_bucket = AtomicU64::new(0);
    buckets
        .active
        .par_iter()
        .map(|&minimizer| -> Result<()> {
            let entries = std::mem::take(&mut *buckets.queues[minimizer as usize].lock().unwrap());
            if entries.is_empty() {
                return Ok(());
            }
            max_bucket.fetch_max(entries.len() as u64, Ordering::Relaxed);
            let fragments = compact_bucket(&entries, minimizer, k, part)?;
            for f in &fragments {
                glue.append(f)?;
            }
            nb_fragments.fetch_add(fragments.len() as u64, Ordering::Relaxed);
            Ok(())
        })
        .collect::<Result<()>>()?;
    Ok(CompactStats {
        nb_buckets: buckets.active.len() as u64,
        nb_fragments: nb_fragments.load(Ordering::Relaxed),
        max_bucket: max_bucket.load(Ordering::Relaxed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::end_minimizers;
    use crate::kmer::encode;
    use crate::minimizer::{MinimizerModel, MinimizerOrder};

    fn entry(seq: &[u8], k: usize, model: &MinimizerModel) -> BucketEntry<u64> {
        let w = canonical(encode::<u64>(seq).unwrap(), k);
        let (left_min, right_min) = end_minimizers(w, k, model);
        BucketEntry {
            kmer: w,
            abundance: 1,
            left_min,
            right_min,
        }
    }

    /// All k-mers of a read, bucketed under a single minimizer: the bucket
    /// owning every junction must rebuild the read.
    #[test]
    fn a_linear_chain_compacts_back_into_its_read() {
        let k = 5;
        let model = MinimizerModel::new(3, MinimizerOrder::Lex);
        let read = b"ATCAGCGTT";
        let entries: Vec<_> = (0..read.len() - k + 1)
            .map(|i| entry(&read[i..i + k], k, &model))
            .collect();
        // force single ownership: every junction belongs to this bucket
        let min = entries[0].left_min;
        let entries: Vec<_> = entries
            .into_iter()
            .map(|mut e| {
                e.left_min = min;
                e.right_min = min;
                e
            })
            .collect();
        let frags = compact_bucket(&entries, min, k, 0).unwrap();
        assert_eq!(frags.len(), 1);
        let f = &frags[0];
        assert!(
            f.seq == read.to_vec() || f.seq == crate::kmer::decode(
                revcomp(encode::<u64>(read).unwrap(), read.len()),
                read.len()
            )
        );
        assert_eq!(f.abundances.len(), read.len() - k + 1);
        assert!(!f.lmark && !f.rmark);
    }

    #[test]
    fn foreign_junctions_leave_marked_ends() {
        let k = 5;
        let model = MinimizerModel::new(3, MinimizerOrder::Lex);
        let read = b"ATCAGCGTT";
        let mut entries: Vec<_> = (0..read.len() - k + 1)
            .map(|i| entry(&read[i..i + k], k, &model))
            .collect();
        let min = 1u32;
        for e in &mut entries {
            e.left_min = min;
            e.right_min = min;
        }
        // the last k-mer's right end belongs to another bucket
        entries.last_mut().unwrap().right_min = min + 1;
        let frags = compact_bucket(&entries, min, k, 0).unwrap();
        assert_eq!(frags.len(), 1);
        let f = &frags[0];
        // one of the two fragment ends carries the mark, depending on the
        // walk orientation
        assert!(f.lmark ^ f.rmark);
    }

    #[test]
    fn branching_junction_splits_the_path() {
        let k = 5;
        let model = MinimizerModel::new(3, MinimizerOrder::Lex);
        // ATCAG -> TCAGC and TCAGA: out-branching after ATCAG
        let mut entries = vec![
            entry(b"ATCAG", k, &model),
            entry(b"TCAGC", k, &model),
            entry(b"TCAGA", k, &model),
        ];
        for e in &mut entries {
            e.left_min = 0;
            e.right_min = 0;
        }
        let frags = compact_bucket(&entries, 0, k, 0).unwrap();
        assert_eq!(frags.len(), 3); // nothing joined across the branch
        assert!(frags.iter().all(|f| !f.lmark && !f.rmark));
    }

    #[test]
    fn cycles_are_cut_and_fully_consumed() {
        let k = 5;
        let model = MinimizerModel::new(3, MinimizerOrder::Lex);
        // circular sequence ATCAGATCAG: kmers wrap around
        let circ = b"ATCAGATCA";
        let mut entries: Vec<_> = (0..circ.len() - k + 1)
            .map(|i| entry(&circ[i..i + k], k, &model))
            .collect();
        entries.dedup_by_key(|e| e.kmer);
        for e in &mut entries {
            e.left_min = 0;
            e.right_min = 0;
        }
        let frags = compact_bucket(&entries, 0, k, 0).unwrap();
        let total: usize = frags.iter().map(|f| f.abundances.len()).sum();
        assert_eq!(total, entries.len());
    }
}
