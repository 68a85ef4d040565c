//! Domain services used by the pipeline handlers and the HTTP surface.

pub mod decompress;
pub mod download;
pub mod schedule;
pub mod statistics;

pub use decompress::DecompressService;
pub use download::DownloadService;
pub use schedule::ScheduleService;
pub use statistics::{Period, StatisticsService};
