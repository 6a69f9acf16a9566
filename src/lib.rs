//! Minimizer-partitioned k-mer counting, de Bruijn graph compaction and
//! unitig graph cleaning.
//!
//! The pipeline is: reads -> (minimizer, super-k-mer) stream -> sorted
//! partitions -> solid k-mers -> minimizer buckets (+ traveller files) ->
//! per-bucket unitig fragments -> glue partitions -> glued unitigs ->
//! unitig graph -> simplified unitig graph.

pub mod bank;
pub mod bucket;
pub mod compact;
pub mod config;
pub mod container;
pub mod count;
pub mod error;
pub mod glue;
pub mod histogram;
pub mod kmer;
pub mod minimizer;
pub mod partition;
pub mod pipeline;
pub mod simplify;
pub mod unitig_graph;

pub use config::EngineConfig;
pub use error::Error;
pub use kmer::KmerSpan;
pub use pipeline::{run, Summary};

pub type Result<T> = std::result::Result<T, Error>;
