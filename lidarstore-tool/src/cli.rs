use std::path::PathBuf;

/// Classifies the ground points of a las or laz point cloud.
///
/// The point cloud is indexed first, if this has not been done before.
/// Classifications are written into the index, next to the input file.
#[derive(Debug, clap::Parser)]
#[clap(name = "lidarstore-tool")]
pub struct AppOptions {
    /// Verbosity of the command line output.
    #[clap(long, default_value = "info")]
    pub log_level: log::Level,

    /// The las or laz file to process.
    #[clap(long)]
    pub input: PathBuf,

    /// Average number of points per cell of the ground grid.
    #[clap(long, default_value = "1000")]
    pub cell_points: usize,

    /// Points at most this far above the lowest point of their cell are classified as ground.
    #[clap(long, default_value = "0.5")]
    pub ground_threshold: f64,

    /// Maximum number of pages to keep in memory.
    #[clap(long, default_value = "256")]
    pub cache_size: usize,
}
