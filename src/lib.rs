//! # errand
//!
//! On-demand browser agent service. POST a natural-language task to
//! `/agent/run` and an LLM-driven browser agent works it to completion,
//! returning the step transcript and a recorded video of the session.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use errand::{Config, Controller, ModelRegistry};
//! use errand::record::FfmpegFinalizer;
//! use errand::session::EokaProvisioner;
//!
//! # #[tokio::main]
//! # async fn main() -> errand::Result<()> {
//! let config = Config::default();
//! let registry = Arc::new(ModelRegistry::builtin());
//! let provisioner = Arc::new(EokaProvisioner::new(&config)?);
//! let finalizer = Arc::new(FfmpegFinalizer::new(&config.video));
//! let controller = Arc::new(Controller::new(provisioner, finalizer));
//! let app = errand::server::router(errand::server::AppState::new(
//!     config.clone(),
//!     registry,
//!     controller,
//! ));
//! let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

pub mod captcha;
pub mod config;
pub mod extract;
pub mod model;
pub mod observe;
pub mod prompt;
pub mod record;
pub mod run;
pub mod server;
pub mod session;

pub use config::{Config, EngineKind};
pub use model::{AgentAction, ModelBackend, ModelRegistry};
pub use observe::{PageElement, PageView};
pub use record::{FrameSink, VideoArtifact};
pub use run::{Controller, RunRecord, RunSpec, RunStatus, Step, StepOutcome};
pub use session::{Provisioner, Vehicle};

/// Result type for errand operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring the service or driving a run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("browser error: {0}")]
    Browser(#[from] eoka::Error),

    /// The rendering engine could not be launched. Fatal for the run,
    /// never retried.
    #[error("provision failed: {0}")]
    Provision(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("missing credential: set {var} to use model \"{model}\"")]
    MissingCredential { model: String, var: &'static str },

    /// The model backend call failed. Retried once by the step executor,
    /// then fatal for the run.
    #[error("backend error: {0}")]
    Backend(String),

    /// A single browser action failed to apply. Recorded in the step
    /// outcome; the run continues under the controller's policy.
    #[error("action failed: {0}")]
    Action(String),

    #[error("run timed out after {0}s")]
    Timeout(u64),

    /// Video stitching failed. Degrades the artifact, never the run status.
    #[error("encoding error: {0}")]
    Encoding(String),
}
