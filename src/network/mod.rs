//! Network layer for the resource loader
//!
//! Batch planning, the combined version hash and the transport seam through
//! which planned requests leave the loader. Response bodies come back through
//! [`crate::ModuleLoader::receive_response`].

pub mod batch;
pub mod hash;
#[cfg(feature = "http")]
pub mod http;

pub use batch::{
    build_modules_string, combined_version, encode_uri_component, make_query_string, plan_batch,
    BatchPlan, PackedModules,
};
pub use hash::fnv132;
#[cfg(feature = "http")]
pub use http::{apply_batch, drive, FetchedBatch, HttpTransport};

use serde::Serialize;
use std::cell::RefCell;

/// One planned load request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchRequest {
    /// Source id the modules belong to
    pub source: String,
    /// Endpoint plus query string
    pub url: String,
    pub query: String,
    pub group: Option<i64>,
    /// Module names in packed order
    pub modules: Vec<String>,
    /// Combined version hash
    pub version: String,
}

/// Outbound side of the loader
///
/// `send` must not call back into the loader synchronously; responses are
/// delivered later through `receive_response`, `implement` or `set_state`.
pub trait Transport {
    fn send(&self, request: BatchRequest);
}

/// Transport that only records requests
#[derive(Debug, Default)]
pub struct RecordingTransport {
    requests: RefCell<Vec<BatchRequest>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests sent so far
    pub fn requests(&self) -> Vec<BatchRequest> {
        self.requests.borrow().clone()
    }

    /// Drain recorded requests
    pub fn take(&self) -> Vec<BatchRequest> {
        std::mem::take(&mut *self.requests.borrow_mut())
    }

    /// Every module name requested so far, in request order
    pub fn requested_modules(&self) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .flat_map(|r| r.modules.iter().cloned())
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, request: BatchRequest) {
        self.requests.borrow_mut().push(request);
    }
}
