//! Process-level error classification.
//!
//! Core operations return `anyhow::Error` chains whose roots are the typed
//! errors defined by each subsystem. The CLI maps a chain to a stable
//! [`ErrorClass`] and from there to an exit code, so scripts can distinguish
//! "bad input" from "daemon missing" from "pipeline failed" without parsing
//! messages.

use crate::builders::BuilderError;
use crate::cluster::pipelines::PipelineError;
use crate::cluster::templates::TemplateError;
use crate::docker::build::BuildError;
use crate::docker::client::EngineError;
use crate::docker::creds::CredsError;
use crate::docker::runner::RunError;
use crate::registry::RegistryError;
use crate::sources::SourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Engine,
    Auth,
    Transport,
    Cluster,
    PipelineRun,
    Cancelled,
    Other,
}

impl ErrorClass {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorClass::Validation => 2,
            ErrorClass::Engine => 3,
            ErrorClass::Auth => 4,
            ErrorClass::Transport => 5,
            ErrorClass::Cluster => 6,
            ErrorClass::PipelineRun => 7,
            ErrorClass::Cancelled => 130,
            ErrorClass::Other => 1,
        }
    }
}

/// Walk the cause chain and classify the first typed error found.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<BuilderError>() {
            return match e {
                BuilderError::RuntimeRequired | BuilderError::UnsupportedRuntime(_) => {
                    ErrorClass::Validation
                }
            };
        }
        if cause.downcast_ref::<TemplateError>().is_some() {
            return ErrorClass::Validation;
        }
        if cause
            .downcast_ref::<crate::config::interpolate::TemplateError>()
            .is_some()
        {
            return ErrorClass::Validation;
        }
        if let Some(e) = cause.downcast_ref::<BuildError>() {
            return match e {
                BuildError::Cancelled => ErrorClass::Cancelled,
                BuildError::CrossPlatformUnsupported => ErrorClass::Validation,
                BuildError::LifecycleFailed(_) => ErrorClass::Other,
            };
        }
        if cause.downcast_ref::<EngineError>().is_some() {
            return ErrorClass::Engine;
        }
        if cause.downcast_ref::<CredsError>().is_some() {
            return ErrorClass::Auth;
        }
        if let Some(e) = cause.downcast_ref::<RegistryError>() {
            return match e {
                RegistryError::Unauthorized => ErrorClass::Auth,
                _ => ErrorClass::Transport,
            };
        }
        if let Some(e) = cause.downcast_ref::<PipelineError>() {
            return match e {
                PipelineError::NamespaceRequired => ErrorClass::Validation,
                PipelineError::Cancelled => ErrorClass::Cancelled,
                PipelineError::NoRunFound | PipelineError::RunFailed(_) => ErrorClass::PipelineRun,
                PipelineError::MissingTekton => ErrorClass::Cluster,
                PipelineError::RemoveFailed(_) => ErrorClass::Cluster,
            };
        }
        if let Some(e) = cause.downcast_ref::<RunError>() {
            return match e {
                RunError::Cancelled => ErrorClass::Cancelled,
                RunError::NoImage => ErrorClass::Validation,
                _ => ErrorClass::Engine,
            };
        }
        if cause.downcast_ref::<SourceError>().is_some() {
            return ErrorClass::Validation;
        }
        if cause.downcast_ref::<crate::config::FunctionError>().is_some() {
            return ErrorClass::Validation;
        }
    }
    ErrorClass::Other
}
