//! The queryable unitig graph: extremity canonical k-mers indexed to a
//! packed entry (unitig id, deleted flag, position), unitig sequences and
//! mean abundances in parallel vectors.
//!
//! Neighbors are computed on demand from the extremity hash: either the
//! single step into the unitig body, or the four nucleotide extensions
//! looked up among other extremities.

use crate::error::Error;
use crate::kmer::{canonical, encode, revcomp, KmerWord};
use crate::Result;
use rustc_hash::FxHashMap;
use seq_io::fasta::{Reader, Record};
use smallvec::SmallVec;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

pub const POS_BEGIN: u8 = 1;
pub const POS_END: u8 = 2;
pub const POS_BOTH: u8 = 3;

const UNITIG_BITS: u32 = 29;

/// Packed per-extremity entry: 29 bits of unitig id, a deleted flag and
/// the 2-bit position.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExtremityInfo {
    pub unitig: u32,
    pub deleted: bool,
    pub pos: u8,
}

impl ExtremityInfo {
    pub fn pack(self) -> u32 {
        debug_assert!(self.unitig < (1 << UNITIG_BITS));
        self.unitig | ((self.deleted as u32) << UNITIG_BITS) | ((self.pos as u32) << (UNITIG_BITS + 1))
    }

    pub fn unpack(v: u32) -> Self {
        ExtremityInfo {
            unitig: v & ((1 << UNITIG_BITS) - 1),
            deleted: (v >> UNITIG_BITS) & 1 == 1,
            pos: (v >> (UNITIG_BITS + 1)) as u8 & 3,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Strand {
    Forward,
    Revcomp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dir {
    Outgoing,
    Incoming,
}

impl Dir {
    pub fn reverse(self) -> Dir {
        match self {
            Dir::Outgoing => Dir::Incoming,
            Dir::Incoming => Dir::Outgoing,
        }
    }
}

/// A node handle: canonical extremity k-mer plus the strand it is being
/// looked at from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NodeRef<W> {
    pub kmer: W,
    pub strand: Strand,
}

impl<W: KmerWord> NodeRef<W> {
    pub fn reverse(self) -> Self {
        NodeRef {
            kmer: self.kmer,
            strand: match self.strand {
                Strand::Forward => Strand::Revcomp,
                Strand::Revcomp => Strand::Forward,
            },
        }
    }
}

pub struct UnitigGraph<W> {
    k: usize,
    map: FxHashMap<W, u32>,
    unitigs: Vec<Box<[u8]>>,
    mean_abundance: Vec<f32>,
    traversed: Vec<AtomicBool>,
}

impl<W: KmerWord> UnitigGraph<W> {
    /// Load the unitig FASTA produced by the glue phase (`LN/KC/KM` tags).
    pub fn load(path: &Path, k: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::fs(path, e))?;
        let mut reader = Reader::new(file);
        let mut graph = UnitigGraph {
            k,
            map: FxHashMap::default(),
            unitigs: Vec::new(),
            mean_abundance: Vec::new(),
            traversed: Vec::new(),
        };
        while let Some(record) = reader.next() {
            let record = record.map_err(|e| Error::codec(path, e.to_string()))?;
            let header = String::from_utf8_lossy(record.head()).into_owned();
            let mut seq = Vec::new();
            for line in record.seq_lines() {
                seq.extend_from_slice(line);
            }
            if seq.len() < k {
                return Err(Error::codec(
                    path,
                    format!("unitig shorter than k: {}", String::from_utf8_lossy(&seq)),
                ));
            }
            let mean = header
                .split_whitespace()
                .find_map(|t| t.strip_prefix("KM:f:"))
                .and_then(|v| v.parse::<f32>().ok())
                .unwrap_or(1.0);
            graph.push_unitig(seq, mean, path)?;
        }
        Ok(graph)
    }

    fn push_unitig(&mut self, seq: Vec<u8>, mean: f32, path: &Path) -> Result<()> {
        let k = self.k;
        let id = self.unitigs.len() as u32;
        if id >= (1 << UNITIG_BITS) {
            return Err(Error::Resource(format!(
                "more than {} unitigs cannot be indexed",
                1u32 << UNITIG_BITS
            )));
        }
        let begin: W = encode(&seq[..k]).ok_or_else(|| Error::codec(path, "non-ACGT unitig"))?;
        if seq.len() > k {
            let end: W =
                encode(&seq[seq.len() - k..]).ok_or_else(|| Error::codec(path, "non-ACGT unitig"))?;
            self.map.insert(
                canonical(begin, k),
                ExtremityInfo {
                    unitig: id,
                    deleted: false,
                    pos: POS_BEGIN,
                }
                .pack(),
            );
            self.map.insert(
                canonical(end, k),
                ExtremityInfo {
                    unitig: id,
                    deleted: false,
                    pos: POS_END,
                }
                .pack(),
            );
        } else {
            self.map.insert(
                canonical(begin, k),
                ExtremityInfo {
                    unitig: id,
                    deleted: false,
                    pos: POS_BOTH,
                }
                .pack(),
            );
        }
        self.unitigs.push(seq.into_boxed_slice());
        self.mean_abundance.push(mean);
        self.traversed.push(AtomicBool::new(false));
        Ok(())
    }

    #[inline]
    pub fn kmer_size(&self) -> usize {
        self.k
    }

    pub fn nb_unitigs(&self) -> usize {
        self.unitigs.len()
    }

    pub fn nb_live_unitigs(&self) -> usize {
        (0..self.unitigs.len())
            .filter(|&u| !self.unitig_is_deleted(u as u32))
            .count()
    }

    pub fn total_live_bases(&self) -> u64 {
        (0..self.unitigs.len())
            .filter(|&u| !self.unitig_is_deleted(u as u32))
            .map(|u| self.unitigs[u].len() as u64)
            .sum()
    }

    pub fn unitig_seq(&self, id: u32) -> &[u8] {
        &self.unitigs[id as usize]
    }

    #[inline]
    fn entry(&self, kmer: W) -> ExtremityInfo {
        ExtremityInfo::unpack(self.map[&kmer])
    }

    pub fn lookup(&self, kmer: W) -> Option<ExtremityInfo> {
        self.map.get(&kmer).map(|&v| ExtremityInfo::unpack(v))
    }

    /// Node handle from raw sequence bytes.
    pub fn node_from_seq(&self, seq: &[u8]) -> NodeRef<W> {
        let w: W = encode(seq).expect("nodes are built from ACGT sequence");
        let c = canonical(w, self.k);
        NodeRef {
            kmer: c,
            strand: if c == w {
                Strand::Forward
            } else {
                Strand::Revcomp
            },
        }
    }

    fn oriented(&self, node: NodeRef<W>) -> W {
        match node.strand {
            Strand::Forward => node.kmer,
            Strand::Revcomp => revcomp(node.kmer, self.k),
        }
    }

    /// Does the node read the unitig's terminal k-mer as written?
    fn same_orientation(&self, node: NodeRef<W>, e: ExtremityInfo) -> bool {
        let seq = &self.unitigs[e.unitig as usize];
        let k = self.k;
        let terminal: W = if e.pos == POS_END {
            encode(&seq[seq.len() - k..]).unwrap()
        } else {
            encode(&seq[..k]).unwrap()
        };
        self.oriented(node) == terminal
    }

    pub fn unitig_of(&self, node: NodeRef<W>) -> u32 {
        self.entry(node.kmer).unitig
    }

    pub fn is_deleted(&self, node: NodeRef<W>) -> bool {
        self.entry(node.kmer).deleted
    }

    pub fn unitig_is_deleted(&self, id: u32) -> bool {
        let seq = &self.unitigs[id as usize];
        let begin: W = encode(&seq[..self.k]).unwrap();
        self.entry(canonical(begin, self.k)).deleted
    }

    pub fn unitig_mean_abundance(&self, node: NodeRef<W>) -> f64 {
        self.mean_abundance[self.unitig_of(node) as usize] as f64
    }

    /// Up to four neighbors: one body step when the node faces the inside
    /// of its unitig, nucleotide extensions otherwise.
    pub fn neighbors(&self, node: NodeRef<W>, dir: Dir) -> SmallVec<[NodeRef<W>; 4]> {
        let k = self.k;
        let e = self.entry(node.kmer);
        let seq = &self.unitigs[e.unitig as usize];
        let same = self.same_orientation(node, e);
        let mut res = SmallVec::new();

        if seq.len() > k {
            // step into the unitig body
            let begin_side = e.pos & POS_BEGIN != 0;
            let end_side = e.pos & POS_END != 0;
            if begin_side
                && ((same && dir == Dir::Outgoing) || (!same && dir == Dir::Incoming))
            {
                let mut dest = self.node_from_seq(&seq[1..k + 1]);
                if !same {
                    dest = dest.reverse();
                }
                res.push(dest);
            }
            if end_side
                && ((same && dir == Dir::Incoming) || (!same && dir == Dir::Outgoing))
            {
                let mut dest = self.node_from_seq(&seq[seq.len() - k - 1..seq.len() - 1]);
                if !same {
                    dest = dest.reverse();
                }
                res.push(dest);
            }
        }

        // nucleotide extensions out of the unitig
        let outward_out = (same && e.pos & POS_END != 0) || (!same && e.pos & POS_BEGIN != 0);
        let outward_in = (same && e.pos & POS_BEGIN != 0) || (!same && e.pos & POS_END != 0);
        let kmask = W::low_mask(2 * k as u32);
        let oriented = self.oriented(node);
        if dir == Dir::Outgoing && outward_out {
            for nt in 0..4u64 {
                let next = oriented.shl(2).bitor(W::from_u64(nt)).bitand(kmask);
                self.push_if_extremity(next, &mut res);
            }
        }
        if dir == Dir::Incoming && outward_in {
            let rev = revcomp(oriented, k);
            for nt in 0..4u64 {
                let next = rev.shl(2).bitor(W::from_u64(nt)).bitand(kmask);
                self.push_if_extremity(revcomp(next, k), &mut res);
            }
        }
        res
    }

    fn push_if_extremity(&self, raw: W, res: &mut SmallVec<[NodeRef<W>; 4]>) {
        let c = canonical(raw, self.k);
        if let Some(e) = self.lookup(c) {
            if e.deleted {
                return;
            }
            res.push(NodeRef {
                kmer: c,
                strand: if c == raw {
                    Strand::Forward
                } else {
                    Strand::Revcomp
                },
            });
        }
    }

    pub fn degree(&self, node: NodeRef<W>, dir: Dir) -> usize {
        self.neighbors(node, dir).len()
    }

    pub fn indegree(&self, node: NodeRef<W>) -> usize {
        self.degree(node, Dir::Incoming)
    }

    pub fn outdegree(&self, node: NodeRef<W>) -> usize {
        self.degree(node, Dir::Outgoing)
    }

    pub fn is_branching(&self, node: NodeRef<W>) -> bool {
        !(self.indegree(node) == 1 && self.outdegree(node) == 1)
    }

    /// Following the unitig in `dir`, is the node already at the far end?
    pub fn is_last_node(&self, node: NodeRef<W>, dir: Dir) -> bool {
        let e = self.entry(node.kmer);
        let same = self.same_orientation(node, e);
        (same && e.pos & POS_END != 0 && dir == Dir::Outgoing)
            || (same && e.pos & POS_BEGIN != 0 && dir == Dir::Incoming)
            || (!same && e.pos & POS_END != 0 && dir == Dir::Incoming)
            || (!same && e.pos & POS_BEGIN != 0 && dir == Dir::Outgoing)
    }

    pub fn is_first_node(&self, node: NodeRef<W>, dir: Dir) -> bool {
        !self.is_last_node(node, dir)
    }

    /// Canonical node at the far end of the host unitig.
    pub fn unitig_last_node(&self, node: NodeRef<W>, dir: Dir) -> NodeRef<W> {
        if self.is_last_node(node, dir) {
            return node;
        }
        let e = self.entry(node.kmer);
        let seq = &self.unitigs[e.unitig as usize];
        let k = self.k;
        let mut res = if e.pos & POS_BEGIN != 0 {
            self.node_from_seq(&seq[seq.len() - k..])
        } else {
            self.node_from_seq(&seq[..k])
        };
        if !self.same_orientation(node, e) {
            res = res.reverse();
        }
        res
    }

    pub fn unitig_mark(&self, node: NodeRef<W>) {
        let u = self.unitig_of(node);
        self.traversed[u as usize].store(true, Ordering::Relaxed);
    }

    pub fn unitig_is_marked(&self, node: NodeRef<W>) -> bool {
        let u = self.unitig_of(node);
        self.traversed[u as usize].load(Ordering::Relaxed)
    }

    pub fn clear_marks(&self) {
        for t in &self.traversed {
            t.store(false, Ordering::Relaxed);
        }
    }

    /// Mark both extremities of the host unitig deleted. Idempotent.
    pub fn unitig_delete(&mut self, node: NodeRef<W>) {
        let mut e = self.entry(node.kmer);
        e.deleted = true;
        self.map.insert(node.kmer, e.pack());
        let seq = &self.unitigs[e.unitig as usize];
        let k = self.k;
        let other: W = if e.pos & POS_BEGIN != 0 {
            canonical(encode(&seq[seq.len() - k..]).unwrap(), k)
        } else {
            canonical(encode(&seq[..k]).unwrap(), k)
        };
        if let Some(&packed) = self.map.get(&other) {
            let mut e2 = ExtremityInfo::unpack(packed);
            e2.deleted = true;
            self.map.insert(other, e2.pack());
        }
    }

    /// All live extremity nodes, forward strand, one per map entry.
    pub fn iter_nodes(&self) -> Vec<NodeRef<W>> {
        self.map
            .iter()
            .filter(|(_, &v)| !ExtremityInfo::unpack(v).deleted)
            .map(|(&kmer, _)| NodeRef {
                kmer,
                strand: Strand::Forward,
            })
            .collect()
    }

    /// Keep traversing through concatenated unitigs while the path stays
    /// simple. Accumulates extension length and total coverage, optionally
    /// extending a sequence and recording traversed far-end nodes.
    pub fn simple_path_longest_avance(
        &self,
        node: NodeRef<W>,
        dir: Dir,
        mark: bool,
        mut seq: Option<&mut Vec<u8>>,
        mut nodes: Option<&mut Vec<NodeRef<W>>>,
    ) -> (usize, usize, f64) {
        let k = self.k;
        let mut length = 0usize;
        let mut coverage = 0f64;
        let mut end_degree = 0usize;
        let mut cur = node;

        if self.is_first_node(cur, dir) {
            let e = self.entry(cur.kmer);
            let useq = &self.unitigs[e.unitig as usize];
            let mut new_seq = useq.to_vec();
            if !self.same_orientation(cur, e) {
                new_seq = revcomp_bytes(&new_seq);
            }
            if let Some(s) = seq.as_mut() {
                append_overlapping(s, &new_seq, k, dir);
            }
            length += new_seq.len() - k;
            coverage += self.mean_abundance[e.unitig as usize] as f64
                * (new_seq.len() - k + 1) as f64;
            cur = self.unitig_last_node(node, dir);
            if let Some(ns) = nodes.as_mut() {
                ns.push(cur);
            }
        }
        if mark {
            self.unitig_mark(cur);
        }

        loop {
            let nexts = self.neighbors(cur, dir);
            end_degree = nexts.len();
            if end_degree != 1 {
                return (length, end_degree, coverage);
            }
            let next = nexts[0];
            let e = self.entry(next.kmer);
            let same = self.same_orientation(next, e);
            // entering a unitig not at its facing extremity means the
            // intermediate structure is inconsistent; stop here
            if e.pos != POS_BOTH {
                let consistent = match dir {
                    Dir::Incoming => {
                        (e.pos == POS_END && same) || (e.pos == POS_BEGIN && !same)
                    }
                    Dir::Outgoing => {
                        (e.pos == POS_BEGIN && same) || (e.pos == POS_END && !same)
                    }
                };
                if !consistent {
                    return (length, end_degree, coverage);
                }
            }
            if self.neighbors(next, dir.reverse()).len() > 1 {
                return (length, end_degree, coverage);
            }
            let useq = &self.unitigs[e.unitig as usize];
            let mut new_seq = useq.to_vec();
            if !same {
                new_seq = revcomp_bytes(&new_seq);
            }
            let last = self.unitig_last_node(next, dir);
            cur = last;
            if let Some(ns) = nodes.as_mut() {
                ns.push(cur);
            }
            if let Some(s) = seq.as_mut() {
                append_overlapping(s, &new_seq, k, dir);
            }
            length += new_seq.len() - (k - 1);
            coverage +=
                self.mean_abundance[e.unitig as usize] as f64 * (new_seq.len() - k + 1) as f64;
            if mark && self.unitig_is_marked(cur) {
                // perfect loop
                return (length, end_degree, coverage);
            }
            if mark {
                self.unitig_mark(cur);
            }
        }
    }

    /// Longest simple path through the node in both directions; returns the
    /// sequence, its mean coverage and whether each side dead-ends.
    pub fn simple_path_both_directions(
        &self,
        node: NodeRef<W>,
        mark: bool,
    ) -> (Vec<u8>, f64, bool, bool) {
        let k = self.k;
        let e = self.entry(node.kmer);
        let useq = &self.unitigs[e.unitig as usize];
        let mut seq = useq.to_vec();
        let mid_cov = self.mean_abundance[e.unitig as usize] as f64 * (seq.len() - k + 1) as f64;

        let left = self.node_from_seq(&seq[..k]);
        let right = self.node_from_seq(&seq[seq.len() - k..]);
        if mark {
            self.unitig_mark(left);
        }
        let mut right_ext = Vec::new();
        let mut left_ext = Vec::new();
        let (_, deg_right, cov_right) =
            self.simple_path_longest_avance(right, Dir::Outgoing, mark, Some(&mut right_ext), None);
        let (_, deg_left, cov_left) =
            self.simple_path_longest_avance(left, Dir::Incoming, mark, Some(&mut left_ext), None);
        let mut out = left_ext;
        out.append(&mut seq);
        out.extend_from_slice(&right_ext);
        let coverage = (cov_left + cov_right + mid_cov) / (out.len() - k + 1) as f64;
        (out, coverage, deg_left == 0, deg_right == 0)
    }

    /// Dump the surviving graph as contigs, merging chains of live unitigs.
    pub fn write_contigs(&self, path: &Path) -> Result<u64> {
        self.clear_marks();
        let f = File::create(path).map_err(|e| Error::fs(path, e))?;
        let mut w = BufWriter::new(f);
        let mut id = 0u64;
        for u in 0..self.unitigs.len() as u32 {
            if self.unitig_is_deleted(u) {
                continue;
            }
            let begin = self.node_from_seq(&self.unitigs[u as usize][..self.k]);
            if self.unitig_is_marked(begin) {
                continue;
            }
            let (seq, coverage, _, _) = self.simple_path_both_directions(begin, true);
            writeln!(
                w,
                ">{id} LN:i:{} KM:f:{coverage:.1}",
                seq.len()
            )
            .and_then(|_| w.write_all(&seq))
            .and_then(|_| w.write_all(b"\n"))
            .map_err(|e| Error::fs(path, e))?;
            id += 1;
        }
        w.flush().map_err(|e| Error::fs(path, e))?;
        Ok(id)
    }
}

pub fn revcomp_bytes(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|&b| match b {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            b'T' => b'A',
            other => other,
        })
        .collect()
}

fn append_overlapping(acc: &mut Vec<u8>, new_seq: &[u8], k: usize, dir: Dir) {
    match dir {
        Dir::Outgoing => acc.extend_from_slice(&new_seq[k - 1..]),
        Dir::Incoming => {
            let mut front = new_seq[..new_seq.len() - (k - 1)].to_vec();
            front.extend_from_slice(acc);
            *acc = front;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn graph_from(unitigs: &[(&str, f32)], k: usize) -> UnitigGraph<u64> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unitigs.fa");
        let mut f = File::create(&path).unwrap();
        for (i, (seq, km)) in unitigs.iter().enumerate() {
            writeln!(
                f,
                ">{i} LN:i:{} KC:i:{} KM:f:{km:.1}\n{seq}",
                seq.len(),
                seq.len()
            )
            .unwrap();
        }
        f.flush().unwrap();
        UnitigGraph::load(&path, k).unwrap()
    }

    #[test]
    fn extremity_info_packs_roundtrip() {
        let e = ExtremityInfo {
            unitig: 123_456,
            deleted: true,
            pos: POS_END,
        };
        assert_eq!(ExtremityInfo::unpack(e.pack()), e);
    }

    #[test]
    fn walking_a_split_contig() {
        // two unitigs overlapping on the (k-1)-mer GCGT
        let k = 5;
        let g = graph_from(&[("ATGCGT", 2.0), ("GCGTACC", 2.0)], k);

        let start = g.node_from_seq(b"ATGCG");
        assert_eq!(g.indegree(start), 0);
        assert_eq!(g.outdegree(start), 1); // into the body
        assert!(g.is_branching(start));

        // from the right extremity of unitig 0, one outgoing neighbor:
        // the left extremity of unitig 1
        let end0 = g.node_from_seq(b"TGCGT");
        let n = g.neighbors(end0, Dir::Outgoing);
        assert_eq!(n.len(), 1);
        assert_eq!(g.unitig_of(n[0]), 1);

        let (seq, cov, left_dead, right_dead) = g.simple_path_both_directions(start, false);
        assert_eq!(seq, b"ATGCGTACC".to_vec());
        assert!(left_dead && right_dead);
        assert!((cov - 2.0).abs() < 1e-9);
    }

    #[test]
    fn single_kmer_unitig_is_both_ends() {
        let k = 5;
        let g = graph_from(&[("ATGCG", 3.0)], k);
        let node = g.node_from_seq(b"ATGCG");
        let e = g.lookup(node.kmer).unwrap();
        assert_eq!(e.pos, POS_BOTH);
        assert_eq!(g.indegree(node), 0);
        assert_eq!(g.outdegree(node), 0);
    }

    #[test]
    fn deletion_is_idempotent_and_hides_neighbors() {
        let k = 5;
        let mut g = graph_from(&[("ATGCGT", 2.0), ("GCGTACC", 1.0)], k);
        let end0 = g.node_from_seq(b"TGCGT");
        let n = g.neighbors(end0, Dir::Outgoing)[0];
        assert_eq!(g.unitig_of(n), 1);
        g.unitig_delete(n);
        g.unitig_delete(n); // idempotent
        assert_eq!(g.neighbors(end0, Dir::Outgoing).len(), 0);
        assert_eq!(g.nb_live_unitigs(), 1);
    }

    #[test]
    fn neighbors_bound_by_eight_total() {
        // a hub kmer with several extensions
        let k = 5;
        let g = graph_from(
            &[
                ("ATGCGT", 1.0),
                ("GCGTAA", 1.0),
                ("GCGTCC", 1.0),
                ("GCGTGG", 1.0),
            ],
            k,
        );
        let hub = g.node_from_seq(b"TGCGT");
        let total = g.indegree(hub) + g.outdegree(hub);
        assert!(total <= 8);
        assert_eq!(g.outdegree(hub), 3);
    }
}
