//! Request building and delivery. The core never encodes or sends anything
//! itself; it hands payloads to these collaborators.

pub mod harvester;
pub mod payload;
pub mod transport;

pub use harvester::{Contributor, Harvester};
pub use payload::{HarvestId, HarvestOptions, HarvestResult, Payload, PayloadOptions, SubmitMethod, SubmitRequest};
pub use transport::{parse_retry_after, HttpTransport, Transport};
