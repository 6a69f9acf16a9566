//! End-to-end scenarios: count, compact, glue and clean small synthetic
//! banks, checking the observable outputs.

use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use unitigger::config::SolidityKind;
use unitigger::simplify::Simplifications;
use unitigger::unitig_graph::UnitigGraph;
use unitigger::{run, EngineConfig, Summary};

fn write_bank(dir: &Path, name: &str, reads: &[&str], copies: usize) -> PathBuf {
    let path = dir.join(name);
    let mut f = File::create(&path).unwrap();
    let mut id = 0;
    for _ in 0..copies {
        for read in reads {
            writeln!(f, ">{id}\n{read}").unwrap();
            id += 1;
        }
    }
    f.flush().unwrap();
    path
}

fn rc(seq: &str) -> String {
    seq.chars()
        .rev()
        .map(|c| match c {
            'A' => 'T',
            'C' => 'G',
            'G' => 'C',
            'T' => 'A',
            other => other,
        })
        .collect()
}

fn canon(seq: &str) -> String {
    let r = rc(seq);
    if r.as_str() < seq {
        r
    } else {
        seq.to_string()
    }
}

/// Deterministic pseudo-random DNA.
fn random_seq(mut seed: u64, len: usize) -> String {
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        out.push(['A', 'C', 'G', 'T'][((seed >> 33) & 3) as usize]);
    }
    out
}

fn read_fasta(path: &Path) -> Vec<(String, String)> {
    let text = std::fs::read_to_string(path).unwrap();
    let mut out = Vec::new();
    let mut header = String::new();
    for line in text.lines() {
        if let Some(h) = line.strip_prefix('>') {
            header = h.to_string();
        } else if !line.is_empty() {
            out.push((header.clone(), line.to_string()));
        }
    }
    out
}

fn kmer_set(records: &[(String, String)], k: usize) -> HashSet<String> {
    let mut set = HashSet::new();
    for (_, seq) in records {
        for i in 0..=seq.len() - k {
            set.insert(canon(&seq[i..i + k]));
        }
    }
    set
}

fn kmers_of(seq: &str, k: usize) -> HashSet<String> {
    (0..=seq.len() - k).map(|i| canon(&seq[i..i + k])).collect()
}

fn base_cfg(dir: &Path, inputs: Vec<PathBuf>, k: usize, m: usize) -> EngineConfig {
    let mut cfg = EngineConfig::defaults(inputs, dir.join("out"), k);
    cfg.minimizer_size = m;
    cfg.abundance_min = 1;
    cfg
}

fn run_ok(cfg: &EngineConfig) -> (Summary, Vec<(String, String)>) {
    let summary = run(cfg).unwrap();
    let records = read_fasta(&summary.unitigs_path);
    (summary, records)
}

#[test]
fn single_short_read_yields_its_two_solid_kmers() {
    let dir = tempfile::tempdir().unwrap();
    let bank = write_bank(dir.path(), "reads.fa", &["AGGCGCC"], 1);
    let cfg = base_cfg(dir.path(), vec![bank], 5, 4);
    let (summary, records) = run_ok(&cfg);

    // GGCGC and GCGCC are one canonical k-mer, so two distinct solid
    // k-mers come out of the read
    assert_eq!(summary.nb_solid_kmers, 2);
    assert_eq!(records.len(), 1);
    assert_eq!(
        kmer_set(&records, 5),
        ["AGGCG", "GCGCC"].iter().map(|s| canon(s)).collect()
    );
}

#[test]
fn linear_contig_rebuilds_the_source_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let k = 31;
    let seq = random_seq(0xfeed, 80);
    // premise: all canonical 31-mers and 30-mers of the sequence are
    // distinct, so the expected graph is one clean path
    assert_eq!(kmers_of(&seq, k).len(), 50);
    assert_eq!(kmers_of(&seq, k - 1).len(), 51);

    let bank = write_bank(dir.path(), "reads.fa", &[&seq], 5);
    let mut cfg = base_cfg(dir.path(), vec![bank], k, 8);
    cfg.abundance_min = 5;
    let (summary, records) = run_ok(&cfg);

    assert_eq!(summary.nb_solid_kmers, 50);
    assert_eq!(records.len(), 1);
    let (header, unitig) = &records[0];
    assert_eq!(canon(unitig), canon(&seq));
    assert!(header.contains("LN:i:80"));
    assert!(header.contains("KC:i:250"));
    assert!(header.contains("KM:f:5.0"));
}

#[test]
fn min_solidity_keeps_only_kmers_present_in_every_bank() {
    let dir = tempfile::tempdir().unwrap();
    let b1 = write_bank(dir.path(), "b1.fa", &["CGCTATCGCTA"], 1);
    let b2 = write_bank(dir.path(), "b2.fa", &["CGCTATAGTTA"], 1);
    let b3 = write_bank(dir.path(), "b3.fa", &["CGCTAACGCTA"], 1);
    let mut cfg = base_cfg(dir.path(), vec![b1, b2, b3], 5, 4);
    cfg.solidity = SolidityKind::Min;
    let (summary, records) = run_ok(&cfg);

    assert_eq!(summary.nb_solid_kmers, 1);
    assert_eq!(records.len(), 1);
    assert_eq!(canon(&records[0].1), canon("CGCTA"));
}

#[test]
fn every_canonical_kmer_twice_counts_once_each() {
    let dir = tempfile::tempdir().unwrap();
    let k = 3;
    let mut canonical: Vec<String> = Vec::new();
    for a in ['A', 'C', 'G', 'T'] {
        for b in ['A', 'C', 'G', 'T'] {
            for c in ['A', 'C', 'G', 'T'] {
                let s: String = [a, b, c].iter().collect();
                if canon(&s) == s {
                    canonical.push(s);
                }
            }
        }
    }
    assert_eq!(canonical.len(), 32); // 4^3 / 2, no odd-length palindromes
    let reads: Vec<&str> = canonical.iter().map(|s| s.as_str()).collect();
    let bank = write_bank(dir.path(), "reads.fa", &reads, 2);
    let mut cfg = base_cfg(dir.path(), vec![bank], k, 2);
    cfg.abundance_min = 2;
    let (summary, records) = run_ok(&cfg);

    assert_eq!(summary.nb_solid_kmers, 32);
    assert_eq!(kmer_set(&records, k).len(), 32);
}

#[test]
fn short_branch_is_clipped_long_branch_survives() {
    let dir = tempfile::tempdir().unwrap();
    let k = 15;
    let shared = random_seq(11, 60);
    let a_sfx = random_seq(22, 60);
    let b_sfx = random_seq(33, 30);
    let read_a = format!("{shared}{a_sfx}");
    let read_b = format!("{shared}{b_sfx}");
    let bank = write_bank(dir.path(), "reads.fa", &[&read_a, &read_b], 1);
    let cfg = base_cfg(dir.path(), vec![bank], k, 8);
    let (_, records) = run_ok(&cfg);

    // both branch tips are present before simplification
    let before = kmer_set(&records, k);
    let a_tip = canon(&read_a[read_a.len() - k..]);
    let b_tip = canon(&read_b[read_b.len() - k..]);
    assert!(before.contains(&a_tip));
    assert!(before.contains(&b_tip));

    let mut graph = UnitigGraph::<u64>::load(&cfg.unitigs_path(), k).unwrap();
    Simplifications::new(&mut graph).simplify();

    let mut live: Vec<(String, String)> = Vec::new();
    for u in 0..graph.nb_unitigs() as u32 {
        if !graph.unitig_is_deleted(u) {
            live.push((
                String::new(),
                String::from_utf8(graph.unitig_seq(u).to_vec()).unwrap(),
            ));
        }
    }
    let after = kmer_set(&live, k);
    // the 44-base branch is a topological tip (under 3.5k = 52 bases); the
    // 74-base branch is too long for both tip criteria
    assert!(!after.contains(&b_tip));
    assert!(after.contains(&a_tip));
}

#[test]
fn travellers_keep_cross_partition_kmers_and_dropping_them_loses_unitigs() {
    let dir = tempfile::tempdir().unwrap();
    let k = 15;
    let seq = random_seq(77, 400);
    let bank = write_bank(dir.path(), "reads.fa", &[&seq], 1);

    let mut cfg = base_cfg(dir.path(), vec![bank.clone()], k, 5);
    cfg.forced_layout = Some((1, 4));
    let (_, records) = run_ok(&cfg);
    assert_eq!(kmer_set(&records, k), kmers_of(&seq, k));

    // fault injection: without traveller records, glue cannot chain across
    // partitions and drops the affected classes
    let mut cfg2 = base_cfg(dir.path(), vec![bank], k, 5);
    cfg2.out_prefix = dir.path().join("broken");
    cfg2.forced_layout = Some((1, 4));
    cfg2.disable_travellers = true;
    let (summary2, records2) = run_ok(&cfg2);
    let covered = kmer_set(&records2, k);
    assert!(covered.len() < kmers_of(&seq, k).len());
    assert!(summary2.glue.nb_skipped_buckets > 0);
}

#[test]
fn low_coverage_bulge_path_is_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let k = 21;
    let c1 = random_seq(101, 80);
    let c2 = random_seq(202, 80);
    let mid_hi = random_seq(303, 30);
    let mut mid_lo: Vec<u8> = mid_hi.clone().into_bytes();
    mid_lo[15] = match mid_lo[15] {
        b'A' => b'C',
        b'C' => b'G',
        b'G' => b'T',
        _ => b'A',
    };
    let mid_lo = String::from_utf8(mid_lo).unwrap();
    let read_hi = format!("{c1}{mid_hi}{c2}");
    let read_lo = format!("{c1}{mid_lo}{c2}");

    let path = dir.path().join("reads.fa");
    let mut f = File::create(&path).unwrap();
    for i in 0..20 {
        writeln!(f, ">hi{i}\n{read_hi}").unwrap();
    }
    for i in 0..2 {
        writeln!(f, ">lo{i}\n{read_lo}").unwrap();
    }
    f.flush().unwrap();

    let cfg = base_cfg(dir.path(), vec![path], k, 8);
    let (_, records) = run_ok(&cfg);

    let hi_marker = canon(&read_hi[85..85 + k]); // spans the variant base
    let lo_marker = canon(&read_lo[85..85 + k]);
    let before = kmer_set(&records, k);
    assert!(before.contains(&hi_marker));
    assert!(before.contains(&lo_marker));

    let mut graph = UnitigGraph::<u64>::load(&cfg.unitigs_path(), k).unwrap();
    Simplifications::new(&mut graph).simplify();

    let mut live: Vec<(String, String)> = Vec::new();
    for u in 0..graph.nb_unitigs() as u32 {
        if !graph.unitig_is_deleted(u) {
            live.push((
                String::new(),
                String::from_utf8(graph.unitig_seq(u).to_vec()).unwrap(),
            ));
        }
    }
    let after = kmer_set(&live, k);
    assert!(!after.contains(&lo_marker));
    assert!(after.contains(&hi_marker));
}

#[test]
fn multi_pass_layout_counts_like_a_single_pass() {
    let dir = tempfile::tempdir().unwrap();
    let k = 15;
    let seq = random_seq(55, 300);
    let bank = write_bank(dir.path(), "reads.fa", &[&seq], 3);

    let mut cfg = base_cfg(dir.path(), vec![bank.clone()], k, 5);
    cfg.abundance_min = 3;
    let (s1, r1) = run_ok(&cfg);

    let mut cfg2 = base_cfg(dir.path(), vec![bank], k, 5);
    cfg2.out_prefix = dir.path().join("multi");
    cfg2.abundance_min = 3;
    cfg2.forced_layout = Some((3, 2));
    let (s2, r2) = run_ok(&cfg2);

    assert_eq!(s1.nb_solid_kmers, s2.nb_solid_kmers);
    assert_eq!(kmer_set(&r1, k), kmer_set(&r2, k));
}
