//! Provider abstraction.
//!
//! Every cloud backend (EC2, Azure, GCE, Packet) implements this trait so
//! the CLI can drive the shared instance lifecycle through one interface.
//! The provider set is small and fixed; the registry is the static subcommand
//! wiring in the binary, not runtime discovery.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;

use crate::{errors::Result, instance::Instance};

#[async_trait]
pub trait InstanceProvider: Send + Sync {
    /// Provider-specific launch parameters, deserialized from the image
    /// definitions file. Differing per-provider knobs live here instead of
    /// call-site arguments.
    type Image: Send + Sync;

    fn name(&self) -> &'static str;

    /// Creates fixed-rate instances and waits until every one is running.
    async fn create_on_demand(
        &self,
        image: &Self::Image,
        tags: &HashMap<String, String>,
    ) -> Result<Vec<Instance>>;

    /// Bids for preemptible capacity and polls fulfillment until done or
    /// "timeout" elapses. Providers without a bid price ignore "max_price".
    async fn create_spot(
        &self,
        max_price: f64,
        image: &Self::Image,
        tags: &HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Instance>>;

    /// Stops the "count" most recently launched of the given instances
    /// (zero selects all).
    async fn stop(&self, instances: Vec<Instance>, count: usize) -> Result<()>;

    /// Terminates the "count" most recently launched of the given instances
    /// (zero selects all).
    async fn terminate(&self, instances: Vec<Instance>, count: usize) -> Result<()>;

    /// Enumerates instances, flattening the provider's listing structure and
    /// applying provider-native filter criteria.
    async fn find(&self, filters: &HashMap<String, String>) -> Result<Vec<Instance>>;
}
