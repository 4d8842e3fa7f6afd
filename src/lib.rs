pub mod catalog;
pub mod codec;
pub mod compositor;
pub mod config;
pub mod error;
pub mod generator;
pub mod index;
pub mod lineage;
pub mod mercator;
pub mod merge;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod raster;
pub mod split;
pub mod terrain_rgb;
pub mod writer;

pub use catalog::{build_records_from_sources, load_manifest};
pub use codec::{EncoderEffort, TileEncoder, TileFormat};
pub use compositor::{compose, compose_with_provenance, Compositor};
pub use config::EnvOverrides;
pub use error::{MosaicError, Result, SkipReason};
pub use generator::{CancelToken, GeneratorOptions, TileGenerator};
pub use index::CandidateIndex;
pub use merge::{merge_mbtiles, MergeOptions};
pub use model::{ElevationRaster, LngLatBbox, ProvenanceRaster, SourceRecord, TileCoord};
pub use orchestrator::{GroupExecution, GroupJob, SplitAggregate, SplitAggregateOptions};
pub use pipeline::{run_aggregate, AggregateOptions};
pub use raster::{GdalRasterService, RasterService};
pub use split::{get_split_pattern, ZoomGroup};
