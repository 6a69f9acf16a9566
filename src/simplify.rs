//! Graph cleaning: iterative removal of tips, bulges and erroneous
//! connections on the unitig graph, following the SPAdes-style criteria.
//!
//! Deletion decisions in a pass only read the pre-pass graph state; marks
//! accumulate in a deleter and are committed in one flush between passes.

use crate::kmer::KmerWord;
use crate::unitig_graph::{Dir, NodeRef, UnitigGraph};
use log::{debug, info};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

const MAX_PASSES_PER_KIND: u32 = 20;
const MAX_INTERLEAVED_PASSES: u32 = 25;
const RCTC_TIP_CUTOFF: f64 = 2.0;
const RCTC_EC_CUTOFF: f64 = 4.0;
const BULGE_RATIO: f64 = 1.1;
const BULGE_BACKTRACK_LIMIT: u64 = 10;
const NEIGHBOR_COVERAGE_SPAN: usize = 100;

/// Marks unitigs for deletion under thread-local accumulation, committed
/// by a single flush.
struct NodesDeleter<W> {
    marked: Vec<AtomicBool>,
    list: Mutex<Vec<NodeRef<W>>>,
}

impl<W: KmerWord> NodesDeleter<W> {
    fn new(nb_unitigs: usize) -> Self {
        NodesDeleter {
            marked: (0..nb_unitigs).map(|_| AtomicBool::new(false)).collect(),
            list: Mutex::new(Vec::new()),
        }
    }

    fn mark(&self, graph: &UnitigGraph<W>, node: NodeRef<W>) {
        let u = graph.unitig_of(node) as usize;
        if !self.marked[u].swap(true, Ordering::Relaxed) {
            self.list.lock().unwrap().push(node);
        }
    }

    fn get(&self, graph: &UnitigGraph<W>, node: NodeRef<W>) -> bool {
        self.marked[graph.unitig_of(node) as usize].load(Ordering::Relaxed)
    }

    fn flush(self, graph: &mut UnitigGraph<W>) -> u64 {
        let list = self.list.into_inner().unwrap();
        let n = list.len() as u64;
        for node in list {
            graph.unitig_delete(node);
        }
        n
    }
}

enum PathSearch {
    Found(f64),
    DeadEnd,
    MaxDepth,
    Loop,
}

pub struct Simplifications<'a, W: KmerWord> {
    graph: &'a mut UnitigGraph<W>,
    cutoff_events: u64,
    nb_tip_passes: u32,
    nb_bulge_passes: u32,
    nb_ec_passes: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SimplifyStats {
    pub tips_removed: u64,
    pub bulges_removed: u64,
    pub ec_removed: u64,
}

impl<'a, W: KmerWord> Simplifications<'a, W> {
    pub fn new(graph: &'a mut UnitigGraph<W>) -> Self {
        let nb_nodes = graph.nb_unitigs() as u64 * 2;
        // a fair amount of events below which another pass is useless
        let cutoff_events = (nb_nodes / 100_000).max(1);
        Simplifications {
            graph,
            cutoff_events,
            nb_tip_passes: 0,
            nb_bulge_passes: 0,
            nb_ec_passes: 0,
        }
    }

    /// The many rounds of graph simplifications.
    pub fn simplify(&mut self) -> SimplifyStats {
        let mut stats = SimplifyStats::default();

        let mut prev;
        let mut removed = 0;
        loop {
            prev = removed;
            removed = self.remove_tips();
            stats.tips_removed += removed;
            let keep_going = (prev == 0 && removed > 0)
                || self.nb_tip_passes <= 2
                || removed >= self.cutoff_events;
            if !(keep_going && self.nb_tip_passes < MAX_PASSES_PER_KIND) {
                break;
            }
        }

        removed = 0;
        loop {
            prev = removed;
            removed = self.remove_bulges();
            stats.bulges_removed += removed;
            let keep_going = (prev == 0 && removed > 0)
                || self.nb_bulge_passes <= 2
                || removed >= self.cutoff_events;
            if !(keep_going && self.nb_bulge_passes < MAX_PASSES_PER_KIND) {
                break;
            }
        }

        removed = 0;
        loop {
            prev = removed;
            removed = self.remove_erroneous_connections();
            stats.ec_removed += removed;
            let keep_going = (prev == 0 && removed > 0)
                || self.nb_ec_passes <= 2
                || removed >= self.cutoff_events;
            if !(keep_going && self.nb_ec_passes < MAX_PASSES_PER_KIND) {
                break;
            }
        }

        // interleave the three kinds until quiescent
        let mut ec_removed = 0;
        loop {
            let tips = self.remove_tips();
            let bulges = self.remove_bulges();
            let prev_ec = ec_removed;
            ec_removed = self.remove_erroneous_connections();
            stats.tips_removed += tips;
            stats.bulges_removed += bulges;
            stats.ec_removed += ec_removed;
            let keep_going = (prev_ec == 0 && ec_removed > 0)
                || ec_removed >= self.cutoff_events
                || tips >= self.cutoff_events
                || bulges >= self.cutoff_events;
            if !(keep_going && self.nb_ec_passes < MAX_INTERLEAVED_PASSES) {
                break;
            }
        }

        info!(
            "simplification removed {} tips, {} bulges, {} erroneous connections",
            stats.tips_removed, stats.bulges_removed, stats.ec_removed
        );
        stats
    }

    fn neighbors_all(graph: &UnitigGraph<W>, node: NodeRef<W>) -> Vec<(NodeRef<W>, Dir)> {
        let mut out: Vec<(NodeRef<W>, Dir)> = graph
            .neighbors(node, Dir::Outgoing)
            .into_iter()
            .map(|n| (n, Dir::Outgoing))
            .collect();
        out.extend(
            graph
                .neighbors(node, Dir::Incoming)
                .into_iter()
                .map(|n| (n, Dir::Incoming)),
        );
        out
    }

    /// Mean abundance of the simple path starting at `node`, capped.
    fn simple_path_coverage(
        graph: &UnitigGraph<W>,
        node: NodeRef<W>,
        dir: Dir,
        max_bases: usize,
    ) -> f64 {
        let k = graph.kmer_size();
        let mut total = 0f64;
        let mut kmers = 0usize;
        let mut cur = node;
        if graph.is_first_node(cur, dir) {
            let n = graph.unitig_seq(graph.unitig_of(cur)).len() - k + 1;
            total += graph.unitig_mean_abundance(cur) * n as f64;
            kmers += n;
            cur = graph.unitig_last_node(cur, dir);
        } else {
            total += graph.unitig_mean_abundance(cur);
            kmers += 1;
        }
        while kmers < max_bases {
            let nexts = graph.neighbors(cur, dir);
            if nexts.len() != 1 {
                break;
            }
            let next = nexts[0];
            if graph.neighbors(next, dir.reverse()).len() > 1 {
                break;
            }
            let n = graph.unitig_seq(graph.unitig_of(next)).len() - k + 1;
            total += graph.unitig_mean_abundance(next) * n as f64;
            kmers += n;
            cur = graph.unitig_last_node(next, dir);
        }
        total / kmers.max(1) as f64
    }

    /// Mean abundance of the paths around a branching node, excluding the
    /// path through `exclude`. A step into the branching node's own unitig
    /// body contributes that unitig's mean.
    fn mean_abundance_of_neighbors(
        graph: &UnitigGraph<W>,
        branching: NodeRef<W>,
        exclude: NodeRef<W>,
    ) -> f64 {
        let mut sum = 0f64;
        let mut n = 0u32;
        for (neighbor, dir) in Self::neighbors_all(graph, branching) {
            if neighbor.kmer == exclude.kmer {
                continue;
            }
            sum += if graph.lookup(neighbor.kmer).is_some() {
                Self::simple_path_coverage(graph, neighbor, dir, NEIGHBOR_COVERAGE_SPAN)
            } else {
                graph.unitig_mean_abundance(branching)
            };
            n += 1;
        }
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }

    /// Relative coverage criterion: mean coverage of the paths connected to
    /// the end of `nodes` against the mean coverage of `nodes` itself.
    fn satisfy_rctc(graph: &UnitigGraph<W>, nodes: &[NodeRef<W>], cutoff: f64) -> bool {
        let mean_path: f64 = nodes
            .iter()
            .map(|&n| graph.unitig_mean_abundance(n))
            .sum::<f64>()
            / nodes.len().max(1) as f64;

        let last = *nodes.last().unwrap();
        let prev = if nodes.len() >= 2 {
            Some(nodes[nodes.len() - 2])
        } else {
            None
        };
        let mut mean_neighbors = 0f64;
        let mut nb = 0u32;
        for (connected, _) in Self::neighbors_all(graph, last) {
            if prev.map(|p| p.kmer == connected.kmer).unwrap_or(false) {
                continue;
            }
            // a body step back into the path's own unitig is the path
            // itself, not a connected branch
            if graph.lookup(connected.kmer).is_none() {
                continue;
            }
            mean_neighbors += Self::mean_abundance_of_neighbors(graph, connected, last);
            nb += 1;
        }
        if nb > 0 {
            mean_neighbors /= nb as f64;
        }
        mean_neighbors > cutoff * mean_path
    }

    /// Tips: simple paths hanging off a dead end, removed when short
    /// (topological criterion) or poorly covered relative to their
    /// neighborhood (RCTC).
    fn remove_tips(&mut self) -> u64 {
        self.nb_tip_passes += 1;
        let graph = &*self.graph;
        let k = graph.kmer_size();
        let max_topo = (k as f64 * 3.5) as usize;
        let max_rctc = k * 10;

        let nodes = graph.iter_nodes();
        let deleter = NodesDeleter::new(graph.nb_unitigs());
        let removed = AtomicU64::new(0);

        nodes.par_iter().for_each(|&node| {
            if graph.is_deleted(node) || deleter.get(graph, node) {
                return;
            }
            let ind = graph.indegree(node);
            let outd = graph.outdegree(node);
            // a dead end on exactly one side
            if !((ind == 0 || outd == 0) && (ind != 0 || outd != 0)) {
                return;
            }
            let dir = if outd == 0 {
                Dir::Incoming
            } else {
                Dir::Outgoing
            };
            let mut path = vec![node];
            let (ext_len, _, _) =
                graph.simple_path_longest_avance(node, dir, false, None, Some(&mut path));
            let total_len = k + ext_len;
            let short_topo = total_len <= max_topo;
            let short_rctc = total_len <= max_rctc;
            if !short_topo && !short_rctc {
                return;
            }
            let last = *path.last().unwrap();
            let mut connected =
                graph.indegree(last) + graph.outdegree(last) > 1;
            if path.len() == 1 {
                connected |= ind + outd != 0;
            }
            let is_topo_tip = short_topo && connected;
            let is_rctc_tip = !is_topo_tip
                && short_rctc
                && connected
                && Self::satisfy_rctc(graph, &path, RCTC_TIP_CUTOFF);
            if is_topo_tip || is_rctc_tip {
                for &n in &path {
                    deleter.mark(graph, n);
                }
                removed.fetch_add(1, Ordering::Relaxed);
            }
        });

        deleter.flush(self.graph);
        let n = removed.load(Ordering::Relaxed);
        debug!("tip pass {}: removed {n}", self.nb_tip_passes);
        n
    }

    /// Depth-first most-covered alternative path search, visiting neighbors
    /// in decreasing abundance with a bounded number of calls.
    #[allow(clippy::too_many_arguments)]
    fn most_covered_path(
        graph: &UnitigGraph<W>,
        dir: Dir,
        cur: NodeRef<W>,
        end: NodeRef<W>,
        depth_left: i64,
        avoid: Option<NodeRef<W>>,
        used: &mut Vec<u32>,
        acc: &mut Vec<(f64, usize)>,
        nb_calls: &mut u64,
    ) -> PathSearch {
        *nb_calls += 1;
        if depth_left < -1 {
            return PathSearch::MaxDepth;
        }
        if cur.kmer == end.kmer {
            return PathSearch::Found(weighted_mean(acc));
        }
        let mut nexts: Vec<NodeRef<W>> = Vec::new();
        for n in graph.neighbors(cur, dir) {
            if let Some(a) = avoid {
                if n.kmer == a.kmer {
                    continue;
                }
            }
            if used.contains(&graph.unitig_of(n)) {
                return PathSearch::Loop;
            }
            nexts.push(n);
        }
        nexts.sort_by(|a, b| {
            graph
                .unitig_mean_abundance(*b)
                .partial_cmp(&graph.unitig_mean_abundance(*a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut outcome = PathSearch::DeadEnd;
        for n in nexts {
            if n.kmer == end.kmer {
                return PathSearch::Found(weighted_mean(acc));
            }
            let u = graph.unitig_of(n);
            let kmers = graph.unitig_seq(u).len() - graph.kmer_size() + 1;
            used.push(u);
            acc.push((graph.unitig_mean_abundance(n), kmers));
            let far = graph.unitig_last_node(n, dir);
            let res = Self::most_covered_path(
                graph,
                dir,
                far,
                end,
                depth_left - kmers as i64,
                None,
                used,
                acc,
                nb_calls,
            );
            if matches!(res, PathSearch::Found(_)) {
                return res;
            }
            if *nb_calls >= BULGE_BACKTRACK_LIMIT {
                return res;
            }
            acc.pop();
            used.pop();
            outcome = res;
        }
        outcome
    }

    /// Bulges: a short simple path between two branching nodes, deleted
    /// when a better-covered alternative path exists.
    fn remove_bulges(&mut self) -> u64 {
        self.nb_bulge_passes += 1;
        let graph = &*self.graph;
        let k = graph.kmer_size();
        let max_bulge = (3 * k).max(k + 100);

        let nodes = graph.iter_nodes();
        let deleter = NodesDeleter::new(graph.nb_unitigs());
        let removed = AtomicU64::new(0);

        nodes.par_iter().for_each(|&node| {
            if graph.is_deleted(node) || deleter.get(graph, node) {
                return;
            }
            let ind = graph.indegree(node);
            let outd = graph.outdegree(node);
            for dir in [Dir::Outgoing, Dir::Incoming] {
                let branching_here =
                    (dir == Dir::Outgoing && outd >= 2) || (dir == Dir::Incoming && ind >= 2);
                if !branching_here {
                    continue;
                }
                for neighbor in graph.neighbors(node, dir) {
                    if graph.is_deleted(neighbor) || deleter.get(graph, neighbor) {
                        continue;
                    }
                    let mut path = vec![neighbor];
                    let (ext_len, _, _) = graph.simple_path_longest_avance(
                        neighbor,
                        dir,
                        false,
                        None,
                        Some(&mut path),
                    );
                    let total_len = k + ext_len;
                    if total_len > max_bulge {
                        continue;
                    }
                    let last = *path.last().unwrap();
                    let outn = graph.neighbors(last, dir);
                    if outn.is_empty() {
                        continue; // may still be an unremoved tip
                    }
                    let end_node = outn[0];
                    let doubly_connected = match dir {
                        Dir::Outgoing => graph.indegree(end_node) > 1,
                        Dir::Incoming => graph.outdegree(end_node) > 1,
                    };
                    if !doubly_connected {
                        continue;
                    }
                    let depth = ((total_len as f64 * BULGE_RATIO).max(3.0)) as i64 + 2;
                    let mut used = vec![graph.unitig_of(node)];
                    let mut acc = Vec::new();
                    let mut nb_calls = 0;
                    let res = Self::most_covered_path(
                        graph,
                        dir,
                        node,
                        end_node,
                        depth,
                        Some(neighbor),
                        &mut used,
                        &mut acc,
                        &mut nb_calls,
                    );
                    let PathSearch::Found(alt_cov) = res else {
                        continue;
                    };
                    let simple_cov =
                        Self::simple_path_coverage(graph, neighbor, dir, usize::MAX);
                    if simple_cov * BULGE_RATIO <= alt_cov {
                        for &n in &path {
                            deleter.mark(graph, n);
                        }
                        removed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });

        deleter.flush(self.graph);
        let n = removed.load(Ordering::Relaxed);
        debug!("bulge pass {}: removed {n}", self.nb_bulge_passes);
        n
    }

    /// Erroneous connections: short paths joining two branching nodes with
    /// relatively poor coverage, tested from both directions.
    fn remove_erroneous_connections(&mut self) -> u64 {
        self.nb_ec_passes += 1;
        let graph = &*self.graph;
        let k = graph.kmer_size();
        let max_ec = k * 10;

        let nodes = graph.iter_nodes();
        let deleter = NodesDeleter::new(graph.nb_unitigs());
        let removed = AtomicU64::new(0);

        nodes.par_iter().for_each(|&node| {
            if graph.is_deleted(node) || deleter.get(graph, node) {
                return;
            }
            let ind = graph.indegree(node);
            let outd = graph.outdegree(node);
            if !((ind >= 1 && outd > 1) || (ind > 1 && outd >= 1)) {
                return;
            }
            for dir in [Dir::Outgoing, Dir::Incoming] {
                let branching_here =
                    (dir == Dir::Outgoing && outd >= 2) || (dir == Dir::Incoming && ind >= 2);
                if !branching_here {
                    continue;
                }
                for neighbor in graph.neighbors(node, dir) {
                    if graph.is_deleted(neighbor) || deleter.get(graph, neighbor) {
                        continue;
                    }
                    let mut path = vec![neighbor];
                    let (ext_len, _, _) = graph.simple_path_longest_avance(
                        neighbor,
                        dir,
                        false,
                        None,
                        Some(&mut path),
                    );
                    if k + ext_len > max_ec {
                        continue;
                    }
                    let last = *path.last().unwrap();
                    let outn = graph.neighbors(last, dir);
                    if outn.is_empty() {
                        continue;
                    }
                    let end_node = outn[0];
                    let doubly_connected = match dir {
                        Dir::Outgoing => {
                            graph.indegree(end_node) > 1 && graph.outdegree(end_node) >= 1
                        }
                        Dir::Incoming => {
                            graph.outdegree(end_node) > 1 && graph.indegree(end_node) >= 1
                        }
                    };
                    if !doubly_connected {
                        continue;
                    }
                    let mut rctc = Self::satisfy_rctc(graph, &path, RCTC_EC_CUTOFF);
                    let reversed: Vec<NodeRef<W>> = path.iter().rev().copied().collect();
                    rctc |= Self::satisfy_rctc(graph, &reversed, RCTC_EC_CUTOFF);
                    if rctc {
                        for &n in &path {
                            deleter.mark(graph, n);
                        }
                        removed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });

        deleter.flush(self.graph);
        let n = removed.load(Ordering::Relaxed);
        debug!("ec pass {}: removed {n}", self.nb_ec_passes);
        n
    }
}

fn weighted_mean(acc: &[(f64, usize)]) -> f64 {
    let kmers: usize = acc.iter().map(|&(_, n)| n).sum();
    if kmers == 0 {
        return 0.0;
    }
    acc.iter().map(|&(m, n)| m * n as f64).sum::<f64>() / kmers as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write as _;

    fn graph_from(unitigs: &[(&str, f32)], k: usize) -> UnitigGraph<u64> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unitigs.fa");
        let mut f = File::create(&path).unwrap();
        for (i, (seq, km)) in unitigs.iter().enumerate() {
            writeln!(f, ">{i} LN:i:{} KM:f:{km:.1}\n{seq}", seq.len()).unwrap();
        }
        f.flush().unwrap();
        UnitigGraph::load(&path, k).unwrap()
    }

    // long trunk arms around the TGCGT -> GCGT{A,C} branch point; each arm
    // is over 10k bases so only the short branch qualifies as a tip
    const TRUNK_LEFT: &str =
        "ACCTTCATCTACTGAACTCCATCAGCTGGATCAGAATCTCGACTTAATCGCTATGCGT";
    const TRUNK_RIGHT: &str =
        "GCGTCATCCAGTTCAGACCATTCGGTGATCTTGCAGAGTTCCTGCATTGGATCCTGAGAG";

    #[test]
    fn a_short_tip_is_clipped() {
        let k = 5;
        let mut g = graph_from(
            &[(TRUNK_LEFT, 5.0), (TRUNK_RIGHT, 5.0), ("GCGTAA", 5.0)],
            k,
        );
        let mut s = Simplifications::new(&mut g);
        let removed = s.remove_tips();
        assert_eq!(removed, 1);
        assert_eq!(g.nb_live_unitigs(), 2);
        // the tip unitig is the deleted one
        assert!(g.unitig_is_deleted(2));
    }

    #[test]
    fn long_tips_survive_the_topological_criterion() {
        let k = 5;
        let long_branch = "GCGTAATCTAGGATCCGGTCTAGCAATTGCCAGTTACCGGTTAACCGGATCCAA";
        let mut g = graph_from(
            &[
                (TRUNK_LEFT, 5.0),
                (TRUNK_RIGHT, 5.0),
                (long_branch, 5.0), // 54 bases: above 3.5k = 17 and 10k = 50
            ],
            k,
        );
        let mut s = Simplifications::new(&mut g);
        let removed = s.remove_tips();
        assert_eq!(removed, 0);
        assert_eq!(g.nb_live_unitigs(), 3);
    }

    #[test]
    fn weighted_mean_weighs_by_kmer_count() {
        assert!((weighted_mean(&[(2.0, 1), (10.0, 3)]) - 8.0).abs() < 1e-9);
        assert_eq!(weighted_mean(&[]), 0.0);
    }
}
