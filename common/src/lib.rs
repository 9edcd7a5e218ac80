pub mod color;
pub mod config;
pub mod error;
pub mod events;
pub mod input;
pub mod results;
pub mod task;
pub mod topk;

pub use color::{count_colors, count_colors_until, ColorHistogram, ColorKey, CountMode, ScanMode};
pub use config::PipelineConfig;
pub use error::{PipelineError, SetupError, SinkError, TaskError};
pub use events::{EventSink, LogEvent, LogLevel, MemorySink, TracingSink};
pub use results::{
    CsvSink, ImageReport, OutputRecord, RunSummary, TaskOutcome, TaskResult, CSV_HEADER,
};
pub use task::{ImageTask, TaskIndex, TaskState};
pub use topk::{top_colors, TopColors};
