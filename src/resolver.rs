//! The class-loading seam.
//!
//! The store never instantiates a job class itself — that's the façade's
//! job, and dynamic class loading is explicitly out of scope for this store.
//! `ClassResolver` exists so a caller that wants `job_class_name` validated
//! at insert/update time has somewhere to plug that in; `JobRepository`
//! accepts one via `with_resolver` and otherwise skips validation entirely.
//! `NullClassResolver` is provided for callers that want every class name
//! rejected by default until a real resolver replaces it.

use crate::error::{Result, StoreError};

/// An opaque handle to whatever the façade uses to construct job instances.
/// The store never inspects it.
pub struct JobFactoryHandle(pub String);

pub trait ClassResolver: Send + Sync {
    fn resolve(&self, class_name: &str) -> Result<JobFactoryHandle>;
}

pub struct NullClassResolver;

impl ClassResolver for NullClassResolver {
    fn resolve(&self, class_name: &str) -> Result<JobFactoryHandle> {
        Err(StoreError::ClassLoad(format!(
            "no ClassResolver configured; cannot resolve '{class_name}'"
        )))
    }
}
