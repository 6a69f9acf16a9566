//! Per-partition k-mer counting: expand super-k-mers into canonical
//! k-mers, sort (radix on the four leading nucleotides, or a hash table
//! when the cell is small), scan runs and emit solid counts.
//!
//! Within one cell the emitted stream is strictly ascending by canonical
//! k-mer value; across cells no order is promised.

use crate::config::SolidityKind;
use crate::container::Container;
use crate::error::Error;
use crate::histogram::Histogram;
use crate::kmer::{push_left_rc, push_right, revcomp, KmerWord};
use crate::Result;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::path::Path;

/// Canonical k-mer plus its observed multiplicity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Count<W> {
    pub value: W,
    pub abundance: u16,
}

pub fn solid_dataset(pass: usize, part: usize) -> String {
    format!("dsk/solid.{pass}.{part}")
}

#[derive(Clone)]
pub struct CountParams {
    pub kmer_size: usize,
    pub abundance_min: u32,
    pub abundance_max: u32,
    pub solidity: SolidityKind,
    pub nb_banks: usize,
    pub mem_bytes: u64,
}

/// Per-bank counters for one k-mer run, deciding solidity.
pub struct SolidityCounter<'a> {
    params: &'a CountParams,
    per_bank: Vec<u32>,
}

impl<'a> SolidityCounter<'a> {
    pub fn new(params: &'a CountParams) -> Self {
        let per_bank = vec![0; params.nb_banks];
        SolidityCounter { params, per_bank }
    }

    #[inline]
    pub fn init(&mut self, bank: usize) {
        self.per_bank.fill(0);
        self.per_bank[bank] = 1;
    }

    #[inline]
    pub fn increase(&mut self, bank: usize) {
        self.per_bank[bank] = self.per_bank[bank].saturating_add(1);
    }

    pub fn sum(&self) -> u32 {
        self.per_bank.iter().fold(0u32, |a, &b| a.saturating_add(b))
    }

    pub fn is_solid(&self) -> bool {
        let p = self.params;
        let in_range = |v: u32| v >= p.abundance_min && v <= p.abundance_max;
        match p.solidity {
            SolidityKind::Sum => in_range(self.sum()),
            SolidityKind::One => self.per_bank.iter().any(|&v| in_range(v)),
            SolidityKind::All => self.per_bank.iter().all(|&v| in_range(v)),
            SolidityKind::Min => in_range(*self.per_bank.iter().min().unwrap()),
            SolidityKind::Max => in_range(*self.per_bank.iter().max().unwrap()),
        }
    }
}

/// Walk the (super-k-mer, seed) records of a cell, calling `f` with every
/// canonical k-mer and the id of the bank the record came from.
pub fn expand_superkmers<W: KmerWord>(
    buf: &[u8],
    k: usize,
    records_per_bank: &[u64],
    path: &Path,
    mut f: impl FnMut(W, usize),
) -> Result<()> {
    let record_bytes = 2 * W::BYTES;
    if buf.len() % record_bytes != 0 {
        return Err(Error::codec(path, "truncated super-k-mer record"));
    }
    let kmask = W::low_mask(2 * k as u32);
    let mut bank = 0usize;
    let mut bank_left = records_per_bank.first().copied().unwrap_or(u64::MAX);
    for chunk in buf.chunks_exact(record_bytes) {
        while bank_left == 0 && bank + 1 < records_per_bank.len() {
            bank += 1;
            bank_left = records_per_bank[bank];
        }
        let superk = W::read_le(&chunk[..W::BYTES]);
        let seed = W::read_le(&chunk[W::BYTES..]);
        let nbk = superk.shr(W::BITS - 8).as_u64() & 255;
        if nbk == 0 {
            return Err(Error::codec(path, "empty super-k-mer record"));
        }
        let mut temp = seed;
        let mut rev = revcomp(seed, k);
        let mut rem = nbk;
        for _ in 0..nbk {
            let mink = if rev < temp { rev } else { temp };
            f(mink, bank);
            if rem < 2 {
                break;
            }
            let newnt = superk.shr(2 * (rem as u32 - 2)).low2();
            temp = push_right(temp, newnt, kmask);
            rev = push_left_rc(rev, newnt, k);
            rem -= 1;
        }
        bank_left = bank_left.saturating_sub(1);
    }
    Ok(())
}

#[inline]
fn radix_of<W: KmerWord>(w: W, k: usize) -> usize {
    if k < 4 {
        0
    } else {
        (w.shr(2 * k as u32 - 8).as_u64() & 255) as usize
    }
}

/// Count one (pass, partition) cell and append solid counts to the store.
/// Returns the number of solid k-mers emitted.
pub fn count_cell<W: KmerWord>(
    container: &Container,
    superkmer_path: &Path,
    pass: usize,
    part: usize,
    records_per_bank: &[u64],
    params: &CountParams,
    histogram: &mut Histogram,
) -> Result<u64> {
    let buf = std::fs::read(superkmer_path).map_err(|e| Error::fs(superkmer_path, e))?;
    let k = params.kmer_size;

    let mut out: Vec<u8> = Vec::new();
    let mut nb_solid = 0u64;
    let mut emit = |value: W, counter: &SolidityCounter| {
        let total = counter.sum();
        histogram.inc(total);
        if counter.is_solid() {
            value.write_le(&mut out);
            let ab = total.min(u16::MAX as u32) as u16;
            out.extend_from_slice(&ab.to_le_bytes());
            nb_solid += 1;
        }
    };

    // small single-bank cells go through a hash table; everything else is
    // radix bucketed on the 4-nucleotide prefix and sorted
    let est_kmers = (buf.len() / (2 * W::BYTES)) as u64 * 8;
    if params.nb_banks == 1 && est_kmers * 16 < params.mem_bytes / 2 {
        let mut map: FxHashMap<W, u32> = FxHashMap::default();
        expand_superkmers::<W>(&buf, k, records_per_bank, superkmer_path, |w, _| {
            *map.entry(w).or_insert(0) += 1;
        })?;
        let mut items: Vec<(W, u32)> = map.into_iter().collect();
        items.par_sort_unstable_by_key(|&(w, _)| w);
        let mut counter = SolidityCounter::new(params);
        for (w, n) in items {
            counter.per_bank[0] = n;
            emit(w, &counter);
        }
    } else {
        let mut radix: Vec<Vec<(W, u8)>> = (0..256).map(|_| Vec::new()).collect();
        expand_superkmers::<W>(&buf, k, records_per_bank, superkmer_path, |w, bank| {
            radix[radix_of(w, k)].push((w, bank as u8));
        })?;
        drop(buf);
        radix
            .par_iter_mut()
            .for_each(|bucket| bucket.sort_unstable());
        let mut counter = SolidityCounter::new(params);
        let mut current: Option<W> = None;
        for (w, bank) in radix.into_iter().flatten() {
            match current {
                Some(prev) if prev == w => counter.increase(bank as usize),
                Some(prev) => {
                    emit(prev, &counter);
                    counter.init(bank as usize);
                    current = Some(w);
                }
                None => {
                    counter.init(bank as usize);
                    current = Some(w);
                }
            }
        }
        if let Some(prev) = current {
            emit(prev, &counter);
        }
    }

    container.write_dataset(&solid_dataset(pass, part), &out)?;
    Ok(nb_solid)
}

/// Stream the solid counts of one cell in ascending canonical order.
pub fn read_solid<W: KmerWord>(
    container: &Container,
    pass: usize,
    part: usize,
    mut f: impl FnMut(Count<W>),
) -> Result<()> {
    let name = solid_dataset(pass, part);
    if !container.has_dataset(&name) {
        return Ok(());
    }
    let buf = container.read_dataset(&name)?;
    let record_bytes = W::BYTES + 2;
    if buf.len() % record_bytes != 0 {
        return Err(Error::codec(
            container.dataset_path(&name),
            "truncated solid count record",
        ));
    }
    for chunk in buf.chunks_exact(record_bytes) {
        let value = W::read_le(&chunk[..W::BYTES]);
        let abundance = u16::from_le_bytes(chunk[W::BYTES..].try_into().unwrap());
        f(Count { value, abundance });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmer::{canonical, encode};

    fn params(nb_banks: usize, min: u32) -> CountParams {
        CountParams {
            kmer_size: 5,
            abundance_min: min,
            abundance_max: u32::MAX,
            solidity: SolidityKind::Sum,
            nb_banks,
            mem_bytes: 1 << 20,
        }
    }

    fn one_record<W: KmerWord>(seq: &[u8], k: usize) -> Vec<u8> {
        // single super-k-mer record covering the whole sequence
        let nb = seq.len() - k + 1;
        let mut superk = W::from_u64(nb as u64).shl(W::BITS - 8);
        for j in 0..nb - 1 {
            let nt = crate::kmer::SEQ_NT4_TABLE[seq[k + j] as usize];
            superk = superk.bitor(W::from_u64(nt as u64).shl(2 * (nb - 2 - j) as u32));
        }
        let seed: W = encode(&seq[..k]).unwrap();
        let mut out = Vec::new();
        superk.write_le(&mut out);
        seed.write_le(&mut out);
        out
    }

    #[test]
    fn expansion_yields_canonical_kmers_in_read_order() {
        let seq = b"AGGCGCC";
        let buf = one_record::<u64>(seq, 5);
        let mut got = Vec::new();
        expand_superkmers::<u64>(&buf, 5, &[1], Path::new("x"), |w, _| got.push(w)).unwrap();
        let expect: Vec<u64> = (0..3)
            .map(|i| canonical(encode::<u64>(&seq[i..i + 5]).unwrap(), 5))
            .collect();
        assert_eq!(got, expect);
    }

    #[test]
    fn solidity_kinds_over_three_banks() {
        let mut p = params(3, 1);
        let mut c = SolidityCounter::new(&p);
        c.per_bank = vec![2, 1, 2];
        assert!(c.is_solid()); // sum = 5 >= 1
        p.solidity = SolidityKind::Min;
        let mut c = SolidityCounter::new(&p);
        c.per_bank = vec![2, 0, 2];
        assert!(!c.is_solid()); // min = 0 < 1
        c.per_bank = vec![2, 1, 2];
        assert!(c.is_solid());
        p.solidity = SolidityKind::All;
        p.abundance_min = 2;
        let mut c = SolidityCounter::new(&p);
        c.per_bank = vec![2, 1, 2];
        assert!(!c.is_solid());
        p.solidity = SolidityKind::One;
        let mut c = SolidityCounter::new(&p);
        c.per_bank = vec![2, 1, 2];
        assert!(c.is_solid());
    }

    #[test]
    fn cell_counting_orders_and_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let container = Container::open(dir.path().join("t.store")).unwrap();
        let sk_path = dir.path().join("cell.bin");
        // two copies of the read -> every canonical kmer counted twice
        let mut buf = one_record::<u64>(b"ACGGTCA", 5);
        buf.extend(one_record::<u64>(b"ACGGTCA", 5));
        std::fs::write(&sk_path, &buf).unwrap();

        let p = params(1, 2);
        let mut h = Histogram::new(100);
        let n = count_cell::<u64>(&container, &sk_path, 0, 0, &[2], &p, &mut h).unwrap();
        assert_eq!(n, 3);
        assert_eq!(h.get(2), 3);

        let mut seen = Vec::new();
        read_solid::<u64>(&container, 0, 0, |c| {
            assert_eq!(c.abundance, 2);
            seen.push(c.value);
        })
        .unwrap();
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(seen, sorted);
    }
}
