//! Engine configuration and the pass/partition planner.

use crate::bank::{BankAlbum, BankEstimate, SeqSplitter};
use crate::error::Error;
use crate::kmer::{canonical_m, KmerSpan};
use crate::Result;
use std::path::PathBuf;
use std::str::FromStr;

const MB: u64 = 1 << 20;
/// Conservative bound on simultaneously open partition files.
pub const OPEN_FILES_LIMIT: u64 = 1024;
/// Minimizer tables (frequency, repartition, per-partition buckets) are
/// dense over 4^m entries.
pub const MAX_MINIMIZER_SIZE: usize = 10;

const FREQUENCY_SAMPLE_BASES: u64 = 50_000_000;

/// How per-bank counts decide solidity for multi-bank input.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SolidityKind {
    One,
    All,
    Min,
    Max,
    Sum,
}

impl FromStr for SolidityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "one" => Ok(SolidityKind::One),
            "all" => Ok(SolidityKind::All),
            "min" => Ok(SolidityKind::Min),
            "max" => Ok(SolidityKind::Max),
            "sum" => Ok(SolidityKind::Sum),
            _ => Err(Error::Configuration(format!(
                "unknown solidity kind '{s}' (expected one|min|max|sum|all)"
            ))),
        }
    }
}

impl std::fmt::Display for SolidityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SolidityKind::One => "one",
            SolidityKind::All => "all",
            SolidityKind::Min => "min",
            SolidityKind::Max => "max",
            SolidityKind::Sum => "sum",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub inputs: Vec<PathBuf>,
    pub out_prefix: PathBuf,
    pub kmer_size: usize,
    pub minimizer_size: usize,
    pub abundance_min: u32,
    pub abundance_max: u32,
    pub solidity: SolidityKind,
    pub max_memory_mb: u64,
    /// 0 means unlimited.
    pub max_disk_mb: u64,
    /// 0 means all cores.
    pub nb_cores: usize,
    /// 0 = lexicographic order, 1 = frequency order.
    pub minimizer_type: u8,
    pub histogram_max: u32,
    /// Pick abundance_min automatically from the histogram valley.
    pub histogram_cutoff: bool,
    /// Override the planner, mostly for tests and benchmarking.
    pub forced_layout: Option<(usize, usize)>,
    /// Fault-injection knob: drop traveller records (debugging only).
    pub disable_travellers: bool,
}

impl EngineConfig {
    pub fn defaults(inputs: Vec<PathBuf>, out_prefix: PathBuf, k: usize) -> Self {
        EngineConfig {
            inputs,
            out_prefix,
            kmer_size: k,
            minimizer_size: 8.min(k.saturating_sub(1)).max(1),
            abundance_min: 2,
            abundance_max: u32::MAX,
            solidity: SolidityKind::Sum,
            max_memory_mb: 2000,
            max_disk_mb: 0,
            nb_cores: 0,
            minimizer_type: 0,
            histogram_max: 10_000,
            histogram_cutoff: false,
            forced_layout: None,
            disable_travellers: false,
        }
    }

    pub fn validate(&self) -> Result<KmerSpan> {
        let span = KmerSpan::for_kmer_size(self.kmer_size)?;
        if self.minimizer_size == 0 || self.minimizer_size > self.kmer_size - 1 {
            return Err(Error::Configuration(format!(
                "minimizer size {} must fit inside the (k-1)-mers (1..={})",
                self.minimizer_size,
                self.kmer_size - 1
            )));
        }
        if self.minimizer_size > MAX_MINIMIZER_SIZE {
            return Err(Error::Configuration(format!(
                "minimizer size {} above {MAX_MINIMIZER_SIZE} is not supported",
                self.minimizer_size
            )));
        }
        if self.abundance_min > self.abundance_max {
            return Err(Error::Configuration(format!(
                "abundance range [{}, {}] is empty",
                self.abundance_min, self.abundance_max
            )));
        }
        if self.inputs.is_empty() {
            return Err(Error::Configuration("no input bank given".into()));
        }
        if self.minimizer_type > 1 {
            return Err(Error::Configuration(
                "minimizer type must be 0 (lex) or 1 (frequency)".into(),
            ));
        }
        Ok(span)
    }

    pub fn store_prefix(&self) -> PathBuf {
        let mut p = self.out_prefix.clone().into_os_string();
        p.push(".store");
        PathBuf::from(p)
    }

    pub fn unitigs_path(&self) -> PathBuf {
        let mut p = self.out_prefix.clone().into_os_string();
        p.push(".unitigs.fa");
        PathBuf::from(p)
    }

    pub fn contigs_path(&self) -> PathBuf {
        let mut p = self.out_prefix.clone().into_os_string();
        p.push(".contigs.fa");
        PathBuf::from(p)
    }
}

/// The planned disk layout: P passes, Q partitions per pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub nb_passes: usize,
    pub nb_partitions: usize,
}

impl Layout {
    /// Budget per partition file, used to detect overflows.
    pub fn partition_budget(&self, cfg: &EngineConfig) -> Option<u64> {
        if cfg.max_disk_mb == 0 {
            None
        } else {
            Some(cfg.max_disk_mb * MB / self.nb_partitions as u64)
        }
    }
}

/// Pick (P, Q) so any single partition's count set fits the memory budget.
pub fn plan(cfg: &EngineConfig, estimate: BankEstimate, kmer_bytes: usize) -> Result<Layout> {
    if let Some((p, q)) = cfg.forced_layout {
        return Ok(Layout {
            nb_passes: p.max(1),
            nb_partitions: q.max(1),
        });
    }
    let volume = (estimate.bases.max(1)) * kmer_bytes as u64;
    let mem = cfg.max_memory_mb.max(1) * MB;
    if cfg.max_disk_mb != 0 {
        let disk = cfg.max_disk_mb * MB;
        if disk < volume / OPEN_FILES_LIMIT {
            return Err(Error::Resource(format!(
                "disk budget {} MB cannot hold {} MB of k-mers split over {} files",
                cfg.max_disk_mb,
                volume / MB,
                OPEN_FILES_LIMIT
            )));
        }
    }
    let disk_half = if cfg.max_disk_mb == 0 {
        volume
    } else {
        (cfg.max_disk_mb * MB / 2).min(volume).max(1)
    };
    let nb_passes = volume.div_ceil(disk_half).max(1) as usize;
    let mut nb_partitions = (volume / nb_passes as u64).div_ceil(mem).max(1) as usize;
    // keep P*Q under the open-file limit; oversized partitions fall back
    // to the sorting count path
    let cap = ((OPEN_FILES_LIMIT / 2 - 1) / nb_passes as u64).max(1) as usize;
    nb_partitions = nb_partitions.min(cap);
    Ok(Layout {
        nb_passes,
        nb_partitions,
    })
}

/// Sample pass counting canonical m-mer frequencies, for the frequency
/// minimizer order. Stops after a fixed base budget.
pub fn sample_minimizer_frequencies(album: &BankAlbum, m: usize) -> Result<Vec<u32>> {
    let mut freq = vec![0u32; 1 << (2 * m)];
    let splitter = SeqSplitter::new();
    let mmask = (1u32 << (2 * m)) - 1;
    let mut sampled = 0u64;
    'banks: for bank in &album.banks {
        let path = bank.path().to_path_buf();
        let mut done = false;
        bank.for_each_record(|seq| {
            splitter.chunks(seq, m, &path, |codes| {
                let mut v = 0u32;
                for (i, &nt) in codes.iter().enumerate() {
                    v = ((v << 2) | nt as u32) & mmask;
                    if i + 1 >= m {
                        let c = canonical_m(v, m);
                        freq[c as usize] = freq[c as usize].saturating_add(1);
                    }
                }
                sampled += codes.len() as u64;
                Ok(())
            })?;
            if sampled >= FREQUENCY_SAMPLE_BASES {
                done = true;
            }
            Ok(())
        })?;
        if done {
            break 'banks;
        }
    }
    Ok(freq)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EngineConfig {
        EngineConfig::defaults(vec![PathBuf::from("reads.fa")], PathBuf::from("out"), 31)
    }

    #[test]
    fn validation_rejects_bad_sizes() {
        let mut c = cfg();
        c.minimizer_size = 40;
        assert!(c.validate().is_err());
        let mut c = cfg();
        c.kmer_size = 200;
        assert!(c.validate().is_err());
        let mut c = cfg();
        c.abundance_min = 10;
        c.abundance_max = 2;
        assert!(c.validate().is_err());
        assert!(cfg().validate().is_ok());
    }

    #[test]
    fn small_inputs_plan_a_single_pass() {
        let layout = plan(
            &cfg(),
            BankEstimate {
                sequences: 100,
                bases: 10_000,
            },
            8,
        )
        .unwrap();
        assert_eq!(layout.nb_passes, 1);
        assert_eq!(layout.nb_partitions, 1);
    }

    #[test]
    fn large_volume_splits_into_partitions() {
        let mut c = cfg();
        c.max_memory_mb = 1;
        let layout = plan(
            &c,
            BankEstimate {
                sequences: 1_000_000,
                bases: 100_000_000,
            },
            8,
        )
        .unwrap();
        assert!(layout.nb_partitions > 1);
        assert!((layout.nb_passes * layout.nb_partitions) as u64 >= 1);
    }

    #[test]
    fn impossible_disk_budget_is_a_resource_error() {
        let mut c = cfg();
        c.max_disk_mb = 1;
        let err = plan(
            &c,
            BankEstimate {
                sequences: u64::MAX / 1_000_000,
                bases: 1 << 40,
            },
            8,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[test]
    fn forced_layout_wins() {
        let mut c = cfg();
        c.forced_layout = Some((2, 4));
        let layout = plan(&c, BankEstimate::default(), 8).unwrap();
        assert_eq!(
            layout,
            Layout {
                nb_passes: 2,
                nb_partitions: 4
            }
        );
    }
}
