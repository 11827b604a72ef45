#![allow(dead_code)] // each test binary uses a different slice of this module

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cloudtrace::api::Traces;
use cloudtrace::{
    Client, ClientOptions, Decision, Parameters, SamplingPolicy, TraceService, UploadError,
};

/// Records every payload the client ships instead of talking to a real
/// backend.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    uploads: Arc<Mutex<Vec<Traces>>>,
    failure: Arc<Mutex<Option<UploadError>>>,
}

impl RecordingTransport {
    pub fn uploads(&self) -> Vec<Traces> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn fail_with(&self, error: UploadError) {
        *self.failure.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl TraceService for RecordingTransport {
    async fn patch_traces(&self, body: Traces) -> Result<(), UploadError> {
        self.uploads.lock().unwrap().push(body);
        match self.failure.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// A policy with a fixed answer.
pub struct FixedPolicy(pub Decision);

impl SamplingPolicy for FixedPolicy {
    fn sample(&self, _params: Parameters) -> Decision {
        self.0
    }
}

/// Trace and upload everything.
pub fn always() -> FixedPolicy {
    FixedPolicy(Decision {
        trace: true,
        sample: true,
        weight: 1.0,
    })
}

/// A client that uploads each trace as soon as its root finishes.
pub fn test_client() -> (Client, RecordingTransport) {
    test_client_with(|options| options)
}

pub fn test_client_with(
    configure: impl FnOnce(ClientOptions) -> ClientOptions,
) -> (Client, RecordingTransport) {
    let transport = RecordingTransport::default();
    let options =
        configure(ClientOptions::new("test-project").bundle_count_threshold(1)).transport(transport.clone());
    (Client::new(options).unwrap(), transport)
}
