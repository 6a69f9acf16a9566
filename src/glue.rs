//! Glue phase: stitch fragments whose marked extremities share a
//! canonical k-mer.
//!
//! Marked extremity k-mers are hashed and collected into sharded vectors,
//! deduplicated into a sorted rank table (a minimal perfect hash over
//! exactly that set), unioned with a union-find, and the fragments are
//! scattered into glue partitions by union root. Each partition is then
//! chained independently: start from an unmarked extremity and follow the
//! unique successor, reverse-complementing fragments so the shared k-mer
//! agrees, dropping the k-prefix of every continuation.

use crate::container::Container;
use crate::error::Error;
use crate::kmer::{canonical, encode, revcomp, KmerWord};
use crate::Result;
use log::{debug, warn};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use seq_io::fasta::{Reader, Record};
use smallvec::SmallVec;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub const NB_GLUE_PARTITIONS: usize = 200;
const NB_HASH_SHARDS: usize = 1000;

/// A fragment during glue, with the canonical k-mers of its two ends and
/// the raw (as-read) end k-mers used to orient the chain.
#[derive(Clone, Debug)]
struct MarkedSeq<W> {
    seq: Vec<u8>,
    abundances: Vec<u32>,
    lmark: bool,
    rmark: bool,
    ks: W,
    ke: W,
    raw_start: W,
    raw_end: W,
}

impl<W: KmerWord> MarkedSeq<W> {
    fn parse(seq: Vec<u8>, header: &str, k: usize, path: &Path) -> Result<Self> {
        if seq.len() < k {
            return Err(Error::codec(
                path,
                format!("glue fragment shorter than k ({} < {k})", seq.len()),
            ));
        }
        let mut parts = header.split_whitespace();
        let marks = parts
            .next()
            .ok_or_else(|| Error::codec(path, "missing glue marks"))?;
        if marks.len() != 2 || !marks.bytes().all(|b| b == b'0' || b == b'1') {
            return Err(Error::codec(path, format!("bad glue marks '{marks}'")));
        }
        let lmark = marks.as_bytes()[0] == b'1';
        let rmark = marks.as_bytes()[1] == b'1';
        let abundances = parts
            .map(|a| {
                a.parse::<u32>()
                    .map_err(|_| Error::codec(path, format!("bad abundance '{a}'")))
            })
            .collect::<Result<Vec<_>>>()?;
        if abundances.len() != seq.len() - k + 1 {
            return Err(Error::codec(
                path,
                format!(
                    "fragment of {} bases carries {} abundances",
                    seq.len(),
                    abundances.len()
                ),
            ));
        }
        let raw_start: W = encode(&seq[..k])
            .ok_or_else(|| Error::codec(path, "non-ACGT glue fragment"))?;
        let raw_end: W = encode(&seq[seq.len() - k..])
            .ok_or_else(|| Error::codec(path, "non-ACGT glue fragment"))?;
        Ok(MarkedSeq {
            seq,
            abundances,
            lmark,
            rmark,
            ks: canonical(raw_start, k),
            ke: canonical(raw_end, k),
            raw_start,
            raw_end,
        })
    }

    fn revcomp_in_place(&mut self, k: usize) {
        let n = self.seq.len();
        let mut rc = Vec::with_capacity(n);
        for &b in self.seq.iter().rev() {
            rc.push(match b {
                b'A' => b'T',
                b'C' => b'G',
                b'G' => b'C',
                b'T' => b'A',
                other => other,
            });
        }
        self.seq = rc;
        self.abundances.reverse();
        std::mem::swap(&mut self.lmark, &mut self.rmark);
        std::mem::swap(&mut self.ks, &mut self.ke);
        let new_start = revcomp(self.raw_end, k);
        let new_end = revcomp(self.raw_start, k);
        self.raw_start = new_start;
        self.raw_end = new_end;
    }

    fn marked(&self) -> bool {
        self.lmark || self.rmark
    }
}

fn for_each_fragment<W: KmerWord>(
    path: &Path,
    k: usize,
    mut f: impl FnMut(MarkedSeq<W>) -> Result<()>,
) -> Result<()> {
    let file = File::open(path).map_err(|e| Error::fs(path, e))?;
    let mut reader = Reader::new(file);
    while let Some(record) = reader.next() {
        let record = record.map_err(|e| Error::codec(path, e.to_string()))?;
        let header = std::str::from_utf8(record.head())
            .map_err(|_| Error::codec(path, "non-utf8 glue header"))?
            .to_owned();
        let mut seq = Vec::new();
        for line in record.seq_lines() {
            seq.extend_from_slice(line);
        }
        f(MarkedSeq::parse(seq, &header, k, path)?)?;
    }
    Ok(())
}

struct UnionFind {
    parent: Vec<u32>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        UnionFind {
            parent: (0..n as u32).collect(),
        }
    }

    fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            let up = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = up;
            x = up;
        }
        x
    }

    fn union(&mut self, a: u32, b: u32) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra.max(rb) as usize] = ra.min(rb);
        }
    }
}

/// Shared buffered unitig output; one sequence per line.
pub struct UnitigWriter {
    path: PathBuf,
    inner: Mutex<BufWriter<File>>,
    next_id: AtomicU64,
}

impl UnitigWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let f = File::create(path).map_err(|e| Error::fs(path, e))?;
        Ok(UnitigWriter {
            path: path.to_path_buf(),
            inner: Mutex::new(BufWriter::new(f)),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn emit(&self, seq: &[u8], abundances: &[u32]) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sum: u64 = abundances.iter().map(|&a| a as u64).sum();
        let mean = sum as f64 / abundances.len().max(1) as f64;
        let header = format!(">{id} LN:i:{} KC:i:{sum} KM:f:{mean:.1}\n", seq.len());
        let mut w = self.inner.lock().unwrap();
        w.write_all(header.as_bytes())
            .and_then(|_| w.write_all(seq))
            .and_then(|_| w.write_all(b"\n"))
            .map_err(|e| Error::fs(&self.path, e))?;
        Ok(id)
    }

    pub fn finish(self) -> Result<u64> {
        let mut w = self.inner.into_inner().unwrap();
        w.flush().map_err(|e| Error::fs(&self.path, e))?;
        Ok(self.next_id.into_inner())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GlueStats {
    pub nb_extremities: u64,
    pub nb_uf_keys: u64,
    pub nb_unitigs: u64,
    pub nb_unchained: u64,
    pub nb_skipped_buckets: u64,
}

/// Chains of (fragment index, needs reverse-complement), each chain one
/// output unitig.
fn determine_order<W: KmerWord>(
    sequences: &[MarkedSeq<W>],
    k: usize,
) -> std::result::Result<(Vec<Vec<(u32, bool)>>, u64), String> {
    let mut index: FxHashMap<W, SmallVec<[u32; 2]>> = FxHashMap::default();
    for (i, ms) in sequences.iter().enumerate() {
        // a single-k-mer fragment has ks == ke and must be indexed once
        for key in [ms.ks, ms.ke] {
            let slot = index.entry(key).or_default();
            if !slot.contains(&(i as u32)) {
                slot.push(i as u32);
            }
        }
    }

    let mut used = vec![false; sequences.len()];
    let mut chains = Vec::new();
    let mut nb_chained = 0u64;

    for i in 0..sequences.len() {
        if used[i] {
            continue;
        }
        let mut current = sequences[i].clone();
        if current.lmark && current.rmark {
            continue; // not the extremity of a chain
        }
        let mut rev = false;
        if current.lmark {
            current.revcomp_in_place(k);
            rev = true;
        }
        let mut chain = vec![(i as u32, rev)];
        used[i] = true;
        let mut current_index = i as u32;

        while current.rmark {
            let candidates = index.get(&current.ke).map(|v| v.as_slice()).unwrap_or(&[]);
            let successors: SmallVec<[u32; 2]> = candidates
                .iter()
                .copied()
                .filter(|&c| c != current_index)
                .collect();
            if successors.len() != 1 {
                return Err(format!(
                    "marked extremity has {} successors instead of one",
                    successors.len()
                ));
            }
            let succ_index = successors[0];
            if used[succ_index as usize] {
                return Err("chain loops back on an already glued fragment".into());
            }
            let mut succ = sequences[succ_index as usize].clone();
            // orient the successor so the shared k-mer agrees with the raw
            // end of the chain so far
            let mut succ_rev = false;
            if succ.raw_start != current.raw_end || !succ.lmark {
                succ.revcomp_in_place(k);
                succ_rev = true;
            }
            if succ.raw_start != current.raw_end || !succ.lmark {
                return Err("successor does not overlap the chain end".into());
            }
            used[succ_index as usize] = true;
            chain.push((succ_index, succ_rev));
            current_index = succ_index;
            current = succ;
        }
        nb_chained += chain.len() as u64;
        chains.push(chain);
    }
    Ok((chains, sequences.len() as u64 - nb_chained))
}

fn glue_chain<W: KmerWord>(
    chain: &[(u32, bool)],
    sequences: &[MarkedSeq<W>],
    k: usize,
) -> (Vec<u8>, Vec<u32>) {
    let mut seq = Vec::new();
    let mut abundances = Vec::new();
    for (pos, &(idx, rev)) in chain.iter().enumerate() {
        let mut ms = sequences[idx as usize].clone();
        if rev {
            ms.revcomp_in_place(k);
        }
        if pos == 0 {
            seq.extend_from_slice(&ms.seq);
            abundances.extend_from_slice(&ms.abundances);
        } else {
            debug_assert_eq!(&seq[seq.len() - k..], &ms.seq[..k]);
            seq.extend_from_slice(&ms.seq[k..]);
            abundances.extend_from_slice(&ms.abundances[1..]);
        }
    }
    (seq, abundances)
}

/// Run the whole glue phase over the per-worker glue files, producing the
/// final unitig FASTA.
pub fn glue_all<W: KmerWord>(
    container: &Container,
    glue_files: &[PathBuf],
    k: usize,
    out_path: &Path,
) -> Result<GlueStats> {
    let mut stats = GlueStats::default();

    // collect marked extremity hashes into sharded append-only vectors
    let shards: Vec<boxcar::Vec<u64>> =
        (0..NB_HASH_SHARDS).map(|_| boxcar::Vec::new()).collect();
    let nb_extremities = AtomicU64::new(0);
    glue_files
        .par_iter()
        .map(|path| {
            for_each_fragment::<W>(path, k, |ms| {
                if !ms.marked() {
                    return Ok(());
                }
                for h in [ms.ks.hash64(), ms.ke.hash64()] {
                    shards[(h % NB_HASH_SHARDS as u64) as usize].push(h);
                }
                nb_extremities.fetch_add(2, Ordering::Relaxed);
                Ok(())
            })
        })
        .collect::<Result<()>>()?;
    stats.nb_extremities = nb_extremities.load(Ordering::Relaxed);

    // sorted unique rank table over the hash set
    let mut shards: Vec<Vec<u64>> = shards
        .into_iter()
        .map(|s| s.into_iter().collect())
        .collect();
    shards.par_iter_mut().for_each(|s| {
        s.sort_unstable();
        s.dedup();
    });
    let mut keys: Vec<u64> = shards.into_iter().flatten().collect();
    keys.par_sort_unstable();
    stats.nb_uf_keys = keys.len() as u64;
    debug!("glue rank table holds {} extremity hashes", keys.len());
    let rank = |h: u64| -> u32 { keys.binary_search(&h).unwrap_or(0) as u32 };

    // union both extremities of every marked fragment
    let mut uf = UnionFind::new(keys.len().max(1));
    for path in glue_files {
        for_each_fragment::<W>(path, k, |ms| {
            if ms.marked() {
                uf.union(rank(ms.ks.hash64()), rank(ms.ke.hash64()));
            }
            Ok(())
        })?;
    }
    let roots: Vec<u32> = (0..keys.len().max(1) as u32).map(|i| uf.find(i)).collect();
    drop(uf);

    let out = UnitigWriter::create(out_path)?;

    // scatter fragments: finished ones straight to the output, marked ones
    // into their glue partition
    let part_paths: Vec<PathBuf> = (0..NB_GLUE_PARTITIONS)
        .map(|i| container.dataset_path(&format!("tmp/gluepart.{i}")))
        .collect();
    let part_writers: Vec<Mutex<BufWriter<File>>> = part_paths
        .iter()
        .map(|p| {
            let f = File::create(p).map_err(|e| Error::fs(p, e))?;
            Ok(Mutex::new(BufWriter::new(f)))
        })
        .collect::<Result<Vec<_>>>()?;
    let nb_in_partition: Vec<AtomicU64> = (0..NB_GLUE_PARTITIONS).map(|_| AtomicU64::new(0)).collect();

    let fragment_root = |ms: &MarkedSeq<W>| -> u32 {
        let h = if ms.lmark {
            ms.ks.hash64()
        } else {
            ms.ke.hash64()
        };
        roots[rank(h) as usize]
    };

    glue_files
        .par_iter()
        .map(|path| {
            for_each_fragment::<W>(path, k, |ms| {
                if !ms.marked() {
                    out.emit(&ms.seq, &ms.abundances)?;
                    return Ok(());
                }
                let p = (fragment_root(&ms) as usize) % NB_GLUE_PARTITIONS;
                let mut header = String::new();
                header.push(if ms.lmark { '1' } else { '0' });
                header.push(if ms.rmark { '1' } else { '0' });
                for a in &ms.abundances {
                    header.push(' ');
                    header.push_str(&a.to_string());
                }
                let mut w = part_writers[p].lock().unwrap();
                w.write_all(b">")
                    .and_then(|_| w.write_all(header.as_bytes()))
                    .and_then(|_| w.write_all(b"\n"))
                    .and_then(|_| w.write_all(&ms.seq))
                    .and_then(|_| w.write_all(b"\n"))
                    .map_err(|e| Error::fs(&part_paths[p], e))?;
                nb_in_partition[p].fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        })
        .collect::<Result<()>>()?;
    for (p, w) in part_paths.iter().zip(&part_writers) {
        w.lock().unwrap().flush().map_err(|e| Error::fs(p, e))?;
    }
    drop(part_writers);

    if log::log_enabled!(log::Level::Debug) {
        let mut sizes: Vec<(u64, usize)> = nb_in_partition
            .iter()
            .enumerate()
            .map(|(i, n)| (n.load(Ordering::Relaxed), i))
            .collect();
        sizes.sort_unstable_by(|a, b| b.cmp(a));
        for &(n, i) in sizes.iter().take(10).filter(|&&(n, _)| n > 0) {
            debug!("glue partition {i} has {n} sequences");
        }
    }

    // chain every glue partition independently
    let unchained = AtomicU64::new(0);
    let skipped = AtomicU64::new(0);
    part_paths
        .par_iter()
        .enumerate()
        .map(|(pid, path)| -> Result<()> {
            let mut by_root: FxHashMap<u32, Vec<MarkedSeq<W>>> = FxHashMap::default();
            for_each_fragment::<W>(path, k, |ms| {
                by_root.entry(fragment_root(&ms)).or_default().push(ms);
                Ok(())
            })?;
            for (root, sequences) in by_root {
                match determine_order(&sequences, k) {
                    Ok((chains, nb_unchained)) => {
                        if nb_unchained > 0 {
                            warn!(
                                "{nb_unchained} fragments of glue class {root} not chained \
                                 (likely small circular contigs)"
                            );
                            unchained.fetch_add(nb_unchained, Ordering::Relaxed);
                        }
                        for chain in chains {
                            let (seq, abundances) = glue_chain(&chain, &sequences, k);
                            out.emit(&seq, &abundances)?;
                        }
                    }
                    Err(reason) => {
                        log::error!(
                            "skipping glue class {root} in partition {pid}: {reason}"
                        );
                        skipped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            std::fs::remove_file(path).map_err(|e| Error::fs(path, e))?;
            Ok(())
        })
        .collect::<Result<()>>()?;

    stats.nb_unchained = unchained.load(Ordering::Relaxed);
    stats.nb_skipped_buckets = skipped.load(Ordering::Relaxed);
    stats.nb_unitigs = out.finish()?;

    for path in glue_files {
        std::fs::remove_file(path).map_err(|e| Error::fs(path, e))?;
    }
    container.remove_dataset("tmp/glue.list")?;
    Ok(stats)
}
