//! Stage orchestration: configure, partition, count, bucket+compact per
//! partition, glue. The k-mer span is selected here, once, and every stage
//! below is generic over the chosen carrier.

use crate::bank::BankAlbum;
use crate::bucket::{fill_partition, TravellerFiles};
use crate::compact::{compact_partition, GlueFiles};
use crate::config::{self, EngineConfig, Layout};
use crate::container::Container;
use crate::count::{count_cell, CountParams};
use crate::error::Error;
use crate::glue::{glue_all, GlueStats};
use crate::histogram::Histogram;
use crate::kmer::{KmerSpan, KmerWord, W192, W256};
use crate::minimizer::{MinimizerModel, MinimizerOrder, Repartition};
use crate::partition::{partition_pass, superkmer_file, PassOutput};
use crate::Result;
use log::{info, warn};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Summary {
    pub unitigs_path: PathBuf,
    pub layout: Layout,
    pub nb_superkmers: u64,
    pub nb_solid_kmers: u64,
    pub abundance_threshold: u32,
    pub glue: GlueStats,
}

/// Build unitigs from the configured banks. The unitig FASTA path is
/// returned in the summary; all intermediate state lives in the store
/// directory next to it.
pub fn run(cfg: &EngineConfig) -> Result<Summary> {
    let span = cfg.validate()?;
    match span {
        KmerSpan::Span32 => run_typed::<u64>(cfg),
        KmerSpan::Span64 => run_typed::<u128>(cfg),
        KmerSpan::Span96 => run_typed::<W192>(cfg),
        KmerSpan::Span128 => run_typed::<W256>(cfg),
    }
}

fn run_typed<W: KmerWord>(cfg: &EngineConfig) -> Result<Summary> {
    let k = cfg.kmer_size;
    let m = cfg.minimizer_size;
    let album = BankAlbum::open(&cfg.inputs)?;
    let estimate = album.estimate()?;
    info!(
        "estimated {} sequences, {} bases over {} bank(s)",
        estimate.sequences,
        estimate.bases,
        album.nb_banks()
    );
    let container = Container::open(cfg.store_prefix())?;
    if container.has_dataset("configuration/xml") {
        let props = container.read_properties("configuration/xml")?;
        let stale = props
            .iter()
            .any(|(key, v)| key == "kmer_size" && v != &k.to_string());
        if stale {
            warn!(
                "store {} was built with a different kmer size, rebuilding",
                container.root().display()
            );
        }
    }

    // minimizer order; the stored frequency table only matters in
    // frequency mode
    let order = if cfg.minimizer_type == 1 {
        let freq = config::sample_minimizer_frequencies(&album, m)?;
        let mut bytes = Vec::with_capacity(freq.len() * 4);
        for f in &freq {
            bytes.extend_from_slice(&f.to_le_bytes());
        }
        container.write_dataset("minimizers/minimFrequency", &bytes)?;
        MinimizerOrder::Frequency(freq)
    } else {
        MinimizerOrder::Lex
    };
    let model = MinimizerModel::new(m, order);

    let nb_threads = if cfg.nb_cores == 0 {
        rayon::current_num_threads()
    } else {
        cfg.nb_cores
    };
    let mut layout = config::plan(cfg, estimate, W::BYTES)?;

    let params = CountParams {
        kmer_size: k,
        abundance_min: cfg.abundance_min,
        abundance_max: cfg.abundance_max,
        solidity: cfg.solidity,
        nb_banks: album.nb_banks(),
        mem_bytes: cfg.max_memory_mb.max(1) << 20,
    };

    // partition + count, retrying with more passes on overflow
    let (repart, histogram, nb_solid, nb_superkmers) = loop {
        info!(
            "using {} pass(es) and {} partition(s)",
            layout.nb_passes, layout.nb_partitions
        );
        let repart = Repartition::build(&model, layout.nb_partitions);
        let mut outputs: Vec<PassOutput> = Vec::with_capacity(layout.nb_passes);
        let mut overflowed = false;
        for pass in 0..layout.nb_passes {
            match partition_pass::<W>(
                &album, cfg, layout, pass, &model, &repart, &container, nb_threads,
            ) {
                Ok(o) => outputs.push(o),
                Err(Error::PartitionOverflow {
                    partition,
                    written,
                    budget,
                }) => {
                    warn!(
                        "partition {partition} overflowed ({written} > {budget} bytes), \
                         doubling the number of passes"
                    );
                    for pass in 0..layout.nb_passes {
                        for part in 0..layout.nb_partitions {
                            let _ = std::fs::remove_file(superkmer_file(&container, pass, part));
                        }
                    }
                    layout.nb_passes *= 2;
                    overflowed = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if overflowed {
            continue;
        }
        let nb_superkmers: u64 = outputs.iter().map(|o| o.nb_superkmers).sum();
        info!("partitioned {nb_superkmers} super-k-mers");

        let mut histogram = Histogram::new(cfg.histogram_max);
        let mut nb_solid = 0u64;
        for pass in 0..layout.nb_passes {
            for part in 0..layout.nb_partitions {
                let file = superkmer_file(&container, pass, part);
                let records: Vec<u64> = outputs[pass]
                    .records_per_bank
                    .iter()
                    .map(|bank| bank[part])
                    .collect();
                nb_solid += count_cell::<W>(
                    &container, &file, pass, part, &records, &params, &mut histogram,
                )?;
                std::fs::remove_file(&file).map_err(|e| Error::fs(&file, e))?;
            }
        }
        break (repart, histogram, nb_solid, nb_superkmers);
    };
    info!(
        "{nb_solid} solid k-mers out of {} distinct",
        histogram.total()
    );
    container.write_dataset("dsk/histogram", &histogram.to_bytes())?;
    container.write_properties(
        "configuration/xml",
        &[
            ("kmer_size".into(), k.to_string()),
            ("minimizer_size".into(), m.to_string()),
            ("minimizer_type".into(), cfg.minimizer_type.to_string()),
            ("nb_passes".into(), layout.nb_passes.to_string()),
            ("nb_partitions".into(), layout.nb_partitions.to_string()),
            ("abundance_min".into(), cfg.abundance_min.to_string()),
            ("abundance_max".into(), cfg.abundance_max.to_string()),
            ("solidity_kind".into(), cfg.solidity.to_string()),
        ],
    )?;

    // optional automatic threshold from the histogram valley; applied as a
    // re-filter while loading buckets
    let abundance_threshold = if cfg.histogram_cutoff {
        match histogram.first_minimum() {
            Some(v) if v > cfg.abundance_min => {
                info!("histogram valley picks abundance threshold {v}");
                v
            }
            _ => cfg.abundance_min,
        }
    } else {
        cfg.abundance_min
    };

    // compaction: iterate partitions in increasing order so travellers
    // always land ahead of the cursor
    let mut travellers = TravellerFiles::new(&container, layout.nb_partitions);
    travellers.disabled = cfg.disable_travellers;
    let glue = GlueFiles::create(&container, nb_threads)?;
    let mut nb_fragments = 0u64;
    let mut max_bucket = 0u64;
    for part in 0..layout.nb_partitions {
        let (buckets, bstats) = fill_partition::<W>(
            &container,
            part,
            layout.nb_passes,
            k,
            &model,
            &repart,
            abundance_threshold,
            &travellers,
        )?;
        let cstats = compact_partition::<W>(&buckets, k, part, &glue)?;
        nb_fragments += cstats.nb_fragments;
        max_bucket = max_bucket.max(cstats.max_bucket);
        info!(
            "partition {part}: {} k-mers ({} doubled, {} travellers in), \
             {} buckets, {} fragments",
            bstats.nb_kmers,
            bstats.nb_doubled,
            bstats.nb_travellers_loaded,
            cstats.nb_buckets,
            cstats.nb_fragments
        );
    }
    info!("compaction done, largest bucket held {max_bucket} k-mers, {nb_fragments} fragments");

    let glue_paths = glue.finish(&container)?;
    let unitigs_path = cfg.unitigs_path();
    let glue_stats = glue_all::<W>(&container, &glue_paths, k, &unitigs_path)?;
    if glue_stats.nb_unitigs == 0 {
        warn!("no unitigs were produced, is the abundance threshold too high?");
    }
    info!(
        "glued {} unitigs ({} extremities, {} distinct)",
        glue_stats.nb_unitigs, glue_stats.nb_extremities, glue_stats.nb_uf_keys
    );

    Ok(Summary {
        unitigs_path,
        layout,
        nb_superkmers,
        nb_solid_kmers: nb_solid,
        abundance_threshold,
        glue: glue_stats,
    })
}
