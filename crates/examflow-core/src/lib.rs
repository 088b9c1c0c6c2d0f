//! examflow-core: Timed exam-delivery engine.
//!
//! This crate sequences question groups, paces listening groups by audio
//! playback, locks answers as groups finish, preloads upcoming media,
//! recovers from playback stalls, and assembles the final submission.

pub mod controller;
pub mod error;
pub mod model;
pub mod navigation;
pub mod order;
pub mod preload;
pub mod session;
pub mod stall;
pub mod store;
pub mod submission;
pub mod timer;
pub mod traits;

#[cfg(test)]
mod test_support;

pub use controller::{EngineNotice, PhaseState, PlaybackEventKind, SessionInput, UserCommand};
pub use error::{
    DataIntegrityError, DefinitionError, MediaLoadError, NavigationError, SessionClosed,
    SubmissionError,
};
pub use model::{DeliveryMode, MediaKind, OptionLetter, QuestionPart, TestDefinition};
pub use order::{BaseOrderTable, OrderEntry};
pub use session::{
    fetch_order_table, EngineConfig, ExamSession, RunningSession, SessionHandle, SessionOutcome,
};
pub use store::{FileStore, MemoryStore, SessionStore, StoreKey};
pub use submission::SubmissionPayload;
pub use traits::{MediaFetcher, OrderTableSource, SubmissionReceipt, SubmissionSink};
