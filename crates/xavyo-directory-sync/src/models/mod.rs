//! Persistent entities of the sync pipeline.

pub mod approval;
pub mod preview;
pub mod record;
pub mod run;
pub mod source;
pub mod summary;

pub use approval::{ApprovalTransition, DeactivationApproval};
pub use preview::Preview;
pub use record::{CanonicalRecord, RecordUpsert};
pub use run::{RunFinish, SourceRun, SyncOptions};
pub use source::{CreateDirectorySource, DirectorySource, SyncSchedule};
pub use summary::OpsSummary;
