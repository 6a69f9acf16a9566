use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use rayon::ThreadPoolBuilder;
use std::path::PathBuf;
use std::str::FromStr;
use unitigger::config::SolidityKind;
use unitigger::simplify::Simplifications;
use unitigger::unitig_graph::UnitigGraph;
use unitigger::{EngineConfig, KmerSpan};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input FASTA file(s) (possibly compressed); several files count as
    /// several banks
    #[arg(short, long, value_delimiter = ',', required = true)]
    input: Vec<PathBuf>,
    /// K-mer size (up to 128)
    #[arg(short)]
    k: usize,
    /// Minimizer size
    #[arg(short, default_value_t = 8)]
    m: usize,
    /// Output prefix (produces <prefix>.unitigs.fa and <prefix>.store/)
    #[arg(short, long)]
    out: PathBuf,
    /// Minimum abundance for a k-mer to be solid
    #[arg(long, default_value_t = 2)]
    abundance_min: u32,
    /// Maximum abundance for a k-mer to be solid
    #[arg(long, default_value_t = u32::MAX)]
    abundance_max: u32,
    /// Multi-bank solidity: one|min|max|sum|all
    #[arg(long, default_value = "sum")]
    solidity: String,
    /// Memory budget in MB
    #[arg(long, default_value_t = 2000)]
    max_memory: u64,
    /// Disk budget in MB (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_disk: u64,
    /// Number of threads [default: all]
    #[arg(short, long)]
    threads: Option<usize>,
    /// Minimizer ordering: 0 = lexicographic, 1 = frequency
    #[arg(long, default_value_t = 0)]
    minimizer_type: u8,
    /// Largest abundance tracked by the histogram
    #[arg(long, default_value_t = 10_000)]
    histogram_max: u32,
    /// Pick abundance-min automatically from the histogram valley
    #[arg(long)]
    histogram_cutoff: bool,
    /// Skip tip/bulge/erroneous-connection removal
    #[arg(long)]
    no_simplify: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let span = KmerSpan::for_kmer_size(args.k)?;

    if let Some(t) = args.threads {
        ThreadPoolBuilder::new().num_threads(t).build_global()?;
    }

    let mut cfg = EngineConfig::defaults(args.input, args.out, args.k);
    cfg.minimizer_size = args.m;
    cfg.abundance_min = args.abundance_min;
    cfg.abundance_max = args.abundance_max;
    cfg.solidity = SolidityKind::from_str(&args.solidity)?;
    cfg.max_memory_mb = args.max_memory;
    cfg.max_disk_mb = args.max_disk;
    cfg.nb_cores = args.threads.unwrap_or(0);
    cfg.minimizer_type = args.minimizer_type;
    cfg.histogram_max = args.histogram_max;
    cfg.histogram_cutoff = args.histogram_cutoff;

    let summary = unitigger::run(&cfg).context("unitig construction failed")?;
    println!(
        "{} unitigs from {} solid {}-mers ({:?}, {} passes x {} partitions)",
        summary.glue.nb_unitigs,
        summary.nb_solid_kmers,
        args.k,
        span,
        summary.layout.nb_passes,
        summary.layout.nb_partitions
    );

    if !args.no_simplify {
        run_simplification(&cfg, args.k)?;
    }
    Ok(())
}

fn run_simplification(cfg: &EngineConfig, k: usize) -> Result<()> {
    let unitigs = cfg.unitigs_path();
    let contigs = cfg.contigs_path();
    match KmerSpan::for_kmer_size(k)? {
        KmerSpan::Span32 => simplify_typed::<u64>(cfg, k),
        KmerSpan::Span64 => simplify_typed::<u128>(cfg, k),
        KmerSpan::Span96 => simplify_typed::<unitigger::kmer::W192>(cfg, k),
        KmerSpan::Span128 => simplify_typed::<unitigger::kmer::W256>(cfg, k),
    }
    .with_context(|| {
        format!(
            "simplification of {} into {} failed",
            unitigs.display(),
            contigs.display()
        )
    })
}

fn simplify_typed<W: unitigger::kmer::KmerWord>(cfg: &EngineConfig, k: usize) -> Result<()> {
    let mut graph = UnitigGraph::<W>::load(&cfg.unitigs_path(), k)?;
    let before = graph.nb_live_unitigs();
    let stats = Simplifications::new(&mut graph).simplify();
    let nb_contigs = graph.write_contigs(&cfg.contigs_path())?;
    println!(
        "simplified {} -> {} live unitigs ({} tips, {} bulges, {} ec removed), {} contigs",
        before,
        graph.nb_live_unitigs(),
        stats.tips_removed,
        stats.bulges_removed,
        stats.ec_removed,
        nb_contigs
    );
    Ok(())
}
