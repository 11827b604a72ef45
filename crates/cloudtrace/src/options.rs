//! Client configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use duration_str::deserialize_option_duration;
use sampling::SamplingPolicy;
use serde::Deserialize;

use crate::uploader::TraceService;

pub(crate) const DEFAULT_ENDPOINT: &str = "https://cloudtrace.googleapis.com";

/// Options accepted by [`crate::Client::new`].
///
/// Deserializable from configuration files; custom transports and
/// sampling policies are wired programmatically through the builder
/// methods. Unset bundling fields fall back to the bundler defaults.
#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientOptions {
    /// Project the uploaded traces belong to. Required.
    pub project_id: String,

    /// Base URL of the trace backend.
    pub endpoint: Option<String>,

    /// Build the built-in rate-limited probabilistic sampler.
    pub sampling: Option<SamplingOptions>,

    /// Flush a bundle once its oldest trace has been pending this long.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub delay_threshold: Option<Duration>,

    /// Flush a bundle once it holds this many traces.
    pub bundle_count_threshold: Option<usize>,

    /// Flush a bundle once it holds this many bytes.
    pub bundle_byte_threshold: Option<usize>,

    /// Hard per-bundle byte cap; zero means no cap.
    pub bundle_byte_limit: Option<usize>,

    /// Ceiling on buffered plus in-flight bytes.
    pub buffered_byte_limit: Option<usize>,

    /// Concurrent upload limit.
    pub handler_limit: Option<usize>,

    #[serde(skip)]
    pub(crate) policy: Option<Box<dyn SamplingPolicy>>,

    #[serde(skip)]
    pub(crate) transport: Option<Arc<dyn TraceService>>,
}

/// Parameters for the built-in rate-limited sampler.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamplingOptions {
    /// Fraction of requests to trace, between 0 and 1.
    pub fraction: f64,
    /// Global ceiling on sampled traces per second.
    pub max_qps: f64,
}

impl ClientOptions {
    pub fn new(project_id: impl Into<String>) -> Self {
        ClientOptions {
            project_id: project_id.into(),
            ..Default::default()
        }
    }

    /// Override the backend base URL.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Trace a random `fraction` of requests, capped at `max_qps` per
    /// second.
    pub fn sampling(mut self, fraction: f64, max_qps: f64) -> Self {
        self.sampling = Some(SamplingOptions { fraction, max_qps });
        self
    }

    /// Install a custom sampling policy, taking precedence over
    /// [`ClientOptions::sampling`].
    pub fn sampling_policy(mut self, policy: impl SamplingPolicy + 'static) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }

    /// Replace the upload transport. Testing hook.
    pub fn transport(mut self, transport: impl TraceService) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn delay_threshold(mut self, delay: Duration) -> Self {
        self.delay_threshold = Some(delay);
        self
    }

    pub fn bundle_count_threshold(mut self, count: usize) -> Self {
        self.bundle_count_threshold = Some(count);
        self
    }

    pub fn bundle_byte_threshold(mut self, bytes: usize) -> Self {
        self.bundle_byte_threshold = Some(bytes);
        self
    }

    pub fn bundle_byte_limit(mut self, bytes: usize) -> Self {
        self.bundle_byte_limit = Some(bytes);
        self
    }

    pub fn buffered_byte_limit(mut self, bytes: usize) -> Self {
        self.buffered_byte_limit = Some(bytes);
        self
    }

    pub fn handler_limit(mut self, limit: usize) -> Self {
        self.handler_limit = Some(limit);
        self
    }

    pub(crate) fn bundler_options(&self) -> bundler::BundlerOptions {
        let mut options = bundler::BundlerOptions::default();
        if let Some(delay) = self.delay_threshold {
            options.delay_threshold = delay;
        }
        if let Some(count) = self.bundle_count_threshold {
            options.bundle_count_threshold = count;
        }
        if let Some(bytes) = self.bundle_byte_threshold {
            options.bundle_byte_threshold = bytes;
        }
        if let Some(bytes) = self.bundle_byte_limit {
            options.bundle_byte_limit = bytes;
        }
        if let Some(bytes) = self.buffered_byte_limit {
            options.buffered_byte_limit = bytes;
        }
        if let Some(limit) = self.handler_limit {
            options.handler_limit = limit;
        }
        options
    }
}

// The policy and transport hooks are trait objects, so Debug is by hand.
impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("project_id", &self.project_id)
            .field("endpoint", &self.endpoint)
            .field("sampling", &self.sampling)
            .field("delay_threshold", &self.delay_threshold)
            .field("bundle_count_threshold", &self.bundle_count_threshold)
            .field("bundle_byte_threshold", &self.bundle_byte_threshold)
            .field("bundle_byte_limit", &self.bundle_byte_limit)
            .field("buffered_byte_limit", &self.buffered_byte_limit)
            .field("handler_limit", &self.handler_limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn options_deserialize_from_toml() {
        let options: ClientOptions = toml::from_str(indoc! {r#"
            project_id = "weather-prod"
            delay_threshold = "2s"
            bundle_count_threshold = 50

            [sampling]
            fraction = 0.25
            max_qps = 10.0
        "#})
        .unwrap();

        assert_eq!(options.project_id, "weather-prod");
        assert_eq!(options.delay_threshold, Some(Duration::from_secs(2)));
        assert_eq!(options.bundle_count_threshold, Some(50));
        let sampling = options.sampling.unwrap();
        assert_eq!(sampling.fraction, 0.25);
        assert_eq!(sampling.max_qps, 10.0);
        assert!(options.endpoint.is_none());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<ClientOptions, _> = toml::from_str(indoc! {r#"
            project_id = "weather-prod"
            bundel_count_threshold = 50
        "#});
        assert!(result.is_err());
    }

    #[test]
    fn builder_methods_map_onto_bundler_options() {
        let options = ClientOptions::new("weather-prod")
            .delay_threshold(Duration::from_millis(100))
            .bundle_count_threshold(3)
            .bundle_byte_limit(1)
            .handler_limit(4);

        let bundler = options.bundler_options();
        assert_eq!(bundler.delay_threshold, Duration::from_millis(100));
        assert_eq!(bundler.bundle_count_threshold, 3);
        assert_eq!(bundler.bundle_byte_limit, 1);
        assert_eq!(bundler.handler_limit, 4);
        // Untouched fields keep the bundler defaults.
        assert_eq!(
            bundler.buffered_byte_limit,
            bundler::BundlerOptions::default().buffered_byte_limit
        );
    }
}
