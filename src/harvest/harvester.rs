use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use super::payload::{HarvestOptions, Payload, SubmitRequest};
use crate::config::AgentConfig;

/// Contributes part of a shared endpoint's payload. `None` means nothing to add.
pub type Contributor = Rc<dyn Fn(&HarvestOptions) -> Option<Payload>>;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Builds requests for endpoints and merges payloads for endpoints several
/// features share.
pub struct Harvester {
    scheme: &'static str,
    beacon: String,
    license_key: String,
    application_id: String,
    page_url: String,
    contributors: HashMap<String, Vec<Contributor>>,
}

impl Harvester {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            scheme: if config.ssl { "https" } else { "http" },
            beacon: config.beacon.clone(),
            license_key: config.license_key.clone(),
            application_id: config.application_id.clone(),
            page_url: config.page_url.clone(),
            contributors: HashMap::new(),
        }
    }

    /// Register a contributor for `endpoint`'s shared payload.
    pub fn on(&mut self, endpoint: &str, contributor: Contributor) {
        self.contributors.entry(endpoint.to_string()).or_default().push(contributor);
    }

    pub fn contributor_count(&self, endpoint: &str) -> usize {
        self.contributors.get(endpoint).map_or(0, |c| c.len())
    }

    /// Ask every contributor for `endpoint`, in registration order, and merge.
    pub fn create_payload(&self, endpoint: &str, opts: &HarvestOptions) -> Payload {
        let mut merged = Payload::default();
        for contributor in self.contributors.get(endpoint).into_iter().flatten() {
            if let Some(part) = contributor(opts) {
                merged.merge(part);
            }
        }
        merged
    }

    pub fn url(&self, endpoint: &str) -> String {
        format!("{}://{}/{}/1/{}", self.scheme, self.beacon, endpoint, self.license_key)
    }

    /// Turn a payload into a request. Empty payloads yield `None`: there is
    /// nothing to send.
    pub fn request(&self, endpoint: &str, payload: Payload, opts: &HarvestOptions) -> Option<SubmitRequest> {
        if payload.is_empty() {
            debug!("no payload for '{}', skipping send", endpoint);
            return None;
        }

        let mut query = vec![
            ("a".to_string(), self.application_id.clone()),
            ("v".to_string(), AGENT_VERSION.to_string()),
            ("ref".to_string(), self.page_url.clone()),
        ];
        query.extend(payload.qs);

        let body = serde_json::Value::Object(payload.body).to_string();

        Some(SubmitRequest {
            endpoint: endpoint.to_string(),
            url: self.url(endpoint),
            query,
            body,
            method: opts.submit_method(),
        })
    }
}
