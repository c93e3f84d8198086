//! Log pipeline: backend-live and archived log sources, the filter/
//! reformatter elements applied to them, and the archival sink invoked by
//! the run-lifecycle `Controller` on finalize. See spec.md §4.E.

pub mod archive;
pub mod element;
pub mod error;
pub mod source;

pub use archive::{ArchiveResult, EngineLogArchiver, LocalArchiveSink};
pub use element::{DockerTimestampedLogReformatter, LogFilter, LogFilterOptions, TerminateHandle};
pub use error::LogError;
pub use source::{split_lines, ArchiveSource, BackendLiveSource, ByteStream, LineStream, LiveLogSource, ResumableSource};
