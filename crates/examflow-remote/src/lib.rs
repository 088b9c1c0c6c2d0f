//! examflow-remote: Network collaborators for the exam engine.
//!
//! Implements the core boundary traits over HTTP: media fetching for the
//! preload manager, and the content API for order tables and submissions.
//! Also loads the `examflow.toml` configuration and ships in-memory mocks
//! for offline runs and tests.

pub mod api;
pub mod config;
pub mod error;
pub mod http;
pub mod mock;

pub use api::ApiClient;
pub use config::{load_config, load_config_from, ExamflowConfig};
pub use error::RemoteError;
pub use http::HttpMediaFetcher;
pub use mock::{MockMediaFetcher, MockSubmissionSink};
