//! AWS EC2 backend.
//!
//! Wraps the EC2 client with the fleet lifecycle: on-demand launches polled
//! to "running", spot bidding driven by a poll/cancel state machine, tagging,
//! enumeration, and batch stop/terminate.

use std::{
    collections::HashMap,
    future::Future,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_ec2::{
    model::{
        BlockDeviceMapping, EbsBlockDevice, Filter, IamInstanceProfileSpecification, InstanceType,
        Placement, RequestSpotLaunchSpecification, SpotInstanceState, SpotPlacement, Tag,
        VolumeType,
    },
    types::SdkError,
    Client, Region,
};
use aws_types::SdkConfig as AwsSdkConfig;
use base64::{engine::general_purpose, Engine as _};
use chrono::DateTime;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::{
    errors::{Error, Result},
    instance::{self, Instance},
    provider::InstanceProvider,
    retry::{with_retries, RetryPolicy},
    DEFAULT_POLL_INTERVAL,
};

/// Loads an AWS config from default environments.
pub async fn load_config(reg: Option<String>) -> io::Result<AwsSdkConfig> {
    info!("loading AWS configuration for region {:?}", reg);
    let regp = RegionProviderChain::first_try(reg.map(Region::new))
        .or_default_provider()
        .or_else(Region::new("us-west-2"));

    let shared_config = aws_config::from_env().region(regp).load().await;
    Ok(shared_config)
}

/// Launch parameters for one logical EC2 image definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Ec2ImageDef {
    /// Concrete AMI id; takes precedence over "image_name".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// Human-readable AMI name, resolved across ownership scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    pub instance_type: String,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_group_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    /// Availability zone for placement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_profile_name: Option<String>,
    #[serde(default = "default_root_device_name")]
    pub root_device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_size_gb: Option<i32>,
    #[serde(default = "default_root_volume_type")]
    pub root_volume_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_delete_on_termination: Option<bool>,
    /// Bootstrap script, overwritten with the preprocessed UserData blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

fn default_count() -> usize {
    1
}

fn default_root_device_name() -> String {
    String::from("/dev/sda1")
}

fn default_root_volume_type() -> String {
    String::from("gp2")
}

/// Result of polling one outstanding spot request.
#[derive(Debug, Clone)]
pub enum SpotOutcome {
    /// Still waiting for capacity.
    Open,
    /// Bound to an instance, resolved and tagged.
    Fulfilled(Instance),
    /// Left the open state without an instance; the field carries the
    /// provider status code (e.g. "price-too-low").
    Closed(String),
}

/// Implements AWS EC2 manager.
#[derive(Debug, Clone)]
pub struct Manager {
    #[allow(dead_code)]
    shared_config: AwsSdkConfig,
    cli: Client,
}

impl Manager {
    pub fn new(shared_config: &AwsSdkConfig) -> Self {
        let cloned = shared_config.clone();
        let cli = Client::new(shared_config);
        Self {
            shared_config: cloned,
            cli,
        }
    }

    /// Resolves a human-readable image name to an AMI id, widening the
    /// ownership scope from self-owned over vendor images to the
    /// marketplace. Fails permanently when no scope yields a match.
    pub async fn resolve_image_name(&self, name: &str) -> Result<String> {
        for scope in ["self", "amazon", "aws-marketplace"] {
            info!("looking up image '{}' in ownership scope '{}'", name, scope);
            let cli = self.cli.clone();
            let image_name = name.to_string();
            let resp = with_retries("describe_images", RetryPolicy::default(), || {
                let cli = cli.clone();
                let image_name = image_name.clone();
                async move {
                    cli.describe_images()
                        .owners(scope)
                        .set_filters(Some(vec![Filter::builder()
                            .set_name(Some(String::from("name")))
                            .set_values(Some(vec![image_name]))
                            .build()]))
                        .send()
                        .await
                        .map_err(|e| Error::API {
                            message: format!("failed describe_images {:?}", e),
                            is_retryable: is_error_retryable(&e),
                        })
                }
            })
            .await?;

            if let Some(id) = resp
                .images()
                .unwrap_or_default()
                .first()
                .and_then(|img| img.image_id())
            {
                info!("resolved image '{}' to '{}' in scope '{}'", name, id, scope);
                return Ok(id.to_string());
            }
        }

        Err(Error::Other {
            message: format!("failed to resolve image name '{}' in any ownership scope", name),
            is_retryable: false,
        })
    }

    async fn image_id(&self, image: &Ec2ImageDef) -> Result<String> {
        if let Some(id) = &image.image_id {
            return Ok(id.clone());
        }
        if let Some(name) = &image.image_name {
            return self.resolve_image_name(name).await;
        }
        Err(Error::Other {
            message: String::from("image definition carries neither 'image_id' nor 'image_name'"),
            is_retryable: false,
        })
    }

    /// Creates on-demand instances, tags them, and polls until every one
    /// reports "running".
    pub async fn create_on_demand(
        &self,
        image: &Ec2ImageDef,
        tags: &HashMap<String, String>,
    ) -> Result<Vec<Instance>> {
        let image_id = self.image_id(image).await?;
        info!(
            "launching {} on-demand instance(s) of '{}' ({})",
            image.count, image_id, image.instance_type
        );

        let mut req = self
            .cli
            .run_instances()
            .image_id(image_id)
            .instance_type(InstanceType::from(image.instance_type.as_str()))
            .min_count(image.count as i32)
            .max_count(image.count as i32);
        if let Some(v) = &image.key_name {
            req = req.key_name(v);
        }
        for sg in &image.security_group_ids {
            req = req.security_group_ids(sg);
        }
        if let Some(v) = &image.subnet_id {
            req = req.subnet_id(v);
        }
        if let Some(v) = &image.placement {
            req = req.placement(Placement::builder().availability_zone(v).build());
        }
        if let Some(v) = &image.instance_profile_name {
            req = req.iam_instance_profile(
                IamInstanceProfileSpecification::builder().name(v).build(),
            );
        }
        if let Some(v) = &image.user_data {
            req = req.user_data(general_purpose::STANDARD.encode(v));
        }
        if let Some(bdm) = root_device_mapping(image) {
            req = req.block_device_mappings(bdm);
        }

        let resp = req.send().await.map_err(|e| Error::API {
            message: format!("failed run_instances {:?}", e),
            is_retryable: is_error_retryable(&e),
        })?;

        let mut instance_ids: Vec<String> = Vec::new();
        for inst in resp.instances().unwrap_or_default() {
            if let Some(id) = inst.instance_id() {
                info!("requested '{}'", id);
                instance_ids.push(id.to_string());
            }
        }
        if instance_ids.is_empty() {
            return Err(Error::API {
                message: String::from("run_instances returned no instances"),
                is_retryable: false,
            });
        }

        self.tag_instances(&instance_ids, tags).await?;
        self.wait_until_running(&instance_ids).await
    }

    /// Polls the given instances until all of them are "running", logging
    /// each one as it transitions.
    async fn wait_until_running(&self, instance_ids: &[String]) -> Result<Vec<Instance>> {
        let mut pending: Vec<String> = instance_ids.to_vec();
        let mut running: Vec<Instance> = Vec::new();

        while !pending.is_empty() {
            let cli = self.cli.clone();
            let ids = pending.clone();
            let resp = with_retries("describe_instances", RetryPolicy::default(), || {
                let cli = cli.clone();
                let ids = ids.clone();
                async move {
                    cli.describe_instances()
                        .set_instance_ids(Some(ids))
                        .send()
                        .await
                        .map_err(|e| Error::API {
                            message: format!("failed describe_instances {:?}", e),
                            is_retryable: is_error_retryable(&e),
                        })
                }
            })
            .await?;

            for rsv in resp.reservations().unwrap_or_default() {
                for inst in rsv.instances().unwrap_or_default() {
                    let rec = to_record(inst);
                    if rec.state == "running" {
                        info!(
                            "'{}' is {} at {} ({})",
                            rec.instance_id, rec.state, rec.public_hostname, rec.public_ipv4
                        );
                        pending.retain(|id| id != &rec.instance_id);
                        running.push(rec);
                    }
                }
            }

            if pending.is_empty() {
                break;
            }
            info!("{} instance(s) still pending", pending.len());
            sleep(DEFAULT_POLL_INTERVAL).await;
        }

        Ok(running)
    }

    /// Submits spot bids mirroring the on-demand launch parameters and
    /// returns the request ids.
    pub async fn create_spot_requests(
        &self,
        max_price: f64,
        image: &Ec2ImageDef,
    ) -> Result<Vec<String>> {
        let image_id = self.image_id(image).await?;
        info!(
            "requesting {} spot instance(s) of '{}' ({}) at max {}",
            image.count, image_id, image.instance_type, max_price
        );

        let mut spec = RequestSpotLaunchSpecification::builder()
            .image_id(image_id)
            .instance_type(InstanceType::from(image.instance_type.as_str()));
        if let Some(v) = &image.key_name {
            spec = spec.key_name(v);
        }
        for sg in &image.security_group_ids {
            spec = spec.security_group_ids(sg);
        }
        if let Some(v) = &image.subnet_id {
            spec = spec.subnet_id(v);
        }
        if let Some(v) = &image.placement {
            spec = spec.placement(SpotPlacement::builder().availability_zone(v).build());
        }
        if let Some(v) = &image.instance_profile_name {
            spec = spec.iam_instance_profile(
                IamInstanceProfileSpecification::builder().name(v).build(),
            );
        }
        if let Some(v) = &image.user_data {
            spec = spec.user_data(general_purpose::STANDARD.encode(v));
        }
        if let Some(bdm) = root_device_mapping(image) {
            spec = spec.block_device_mappings(bdm);
        }

        let resp = self
            .cli
            .request_spot_instances()
            .spot_price(format!("{}", max_price))
            .instance_count(image.count as i32)
            .launch_specification(spec.build())
            .send()
            .await
            .map_err(|e| Error::API {
                message: format!("failed request_spot_instances {:?}", e),
                is_retryable: is_error_retryable(&e),
            })?;

        let mut request_ids: Vec<String> = Vec::new();
        for req in resp.spot_instance_requests().unwrap_or_default() {
            if let Some(id) = req.spot_instance_request_id() {
                info!("created spot request '{}'", id);
                request_ids.push(id.to_string());
            }
        }
        if request_ids.is_empty() {
            return Err(Error::API {
                message: String::from("request_spot_instances returned no request ids"),
                is_retryable: false,
            });
        }
        Ok(request_ids)
    }

    /// Queries all outstanding spot requests in one batch and classifies
    /// each: fulfilled requests are resolved to a tagged instance record,
    /// requests that left the open state without an instance are reported
    /// closed so they are never re-polled.
    pub async fn check_spot_requests(
        &self,
        request_ids: &[String],
        tags: &HashMap<String, String>,
    ) -> Result<Vec<(String, SpotOutcome)>> {
        let cli = self.cli.clone();
        let ids = request_ids.to_vec();
        let resp = with_retries("describe_spot_instance_requests", RetryPolicy::default(), || {
            let cli = cli.clone();
            let ids = ids.clone();
            async move {
                cli.describe_spot_instance_requests()
                    .set_spot_instance_request_ids(Some(ids))
                    .send()
                    .await
                    .map_err(|e| Error::API {
                        message: format!("failed describe_spot_instance_requests {:?}", e),
                        is_retryable: is_error_retryable(&e),
                    })
            }
        })
        .await?;

        let mut outcomes: Vec<(String, SpotOutcome)> = Vec::new();
        for req in resp.spot_instance_requests().unwrap_or_default() {
            let request_id = req
                .spot_instance_request_id()
                .unwrap_or_default()
                .to_string();
            let state = req
                .state()
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| String::from("unknown"));
            let status_code = req
                .status()
                .and_then(|s| s.code())
                .unwrap_or("unknown")
                .to_string();
            info!("spot request '{}' is {} ({})", request_id, state, status_code);

            if let Some(instance_id) = req.instance_id() {
                let rec = self.instance_by_id(instance_id).await?;
                self.tag_instances(&[instance_id.to_string()], tags).await?;
                info!(
                    "'{}' is {} at {} ({})",
                    rec.instance_id, rec.state, rec.public_hostname, rec.public_ipv4
                );
                outcomes.push((request_id, SpotOutcome::Fulfilled(rec)));
            } else if !matches!(req.state(), Some(SpotInstanceState::Open)) {
                outcomes.push((request_id, SpotOutcome::Closed(status_code)));
            } else {
                outcomes.push((request_id, SpotOutcome::Open));
            }
        }
        Ok(outcomes)
    }

    /// Submits spot bids and runs the fulfillment machine until every
    /// request resolves, closes, or the timeout cancels the remainder.
    pub async fn create_spot(
        &self,
        max_price: f64,
        image: &Ec2ImageDef,
        tags: &HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Instance>> {
        self.create_spot_with_abort(max_price, image, tags, timeout, None)
            .await
    }

    /// Same as [`Manager::create_spot`] with a cooperative abort flag; when
    /// the flag flips (e.g. on SIGINT) outstanding requests are cancelled
    /// exactly like on timeout.
    pub async fn create_spot_with_abort(
        &self,
        max_price: f64,
        image: &Ec2ImageDef,
        tags: &HashMap<String, String>,
        timeout: Option<Duration>,
        abort: Option<Arc<AtomicBool>>,
    ) -> Result<Vec<Instance>> {
        let request_ids = self.create_spot_requests(max_price, image).await?;
        drive_spot_requests(
            request_ids,
            timeout,
            DEFAULT_POLL_INTERVAL,
            abort,
            |outstanding| async move { self.check_spot_requests(&outstanding, tags).await },
            |outstanding| async move { self.cancel_spot_requests(&outstanding).await },
        )
        .await
    }

    /// Best-effort batch cancellation of outstanding spot requests.
    pub async fn cancel_spot_requests(&self, request_ids: &[String]) -> Result<()> {
        if request_ids.is_empty() {
            return Ok(());
        }
        info!("cancelling {} spot request(s): {:?}", request_ids.len(), request_ids);
        self.cli
            .cancel_spot_instance_requests()
            .set_spot_instance_request_ids(Some(request_ids.to_vec()))
            .send()
            .await
            .map_err(|e| Error::API {
                message: format!("failed cancel_spot_instance_requests {:?}", e),
                is_retryable: is_error_retryable(&e),
            })?;
        Ok(())
    }

    /// Applies the tags to the instances in one batch call, retried on
    /// transient errors.
    pub async fn tag_instances(
        &self,
        instance_ids: &[String],
        tags: &HashMap<String, String>,
    ) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        info!("tagging {} instance(s)", instance_ids.len());
        let mut sdk_tags: Vec<Tag> = Vec::new();
        for (k, v) in tags {
            sdk_tags.push(Tag::builder().key(k).value(v).build());
        }

        let cli = self.cli.clone();
        let ids = instance_ids.to_vec();
        with_retries("create_tags", RetryPolicy::default(), || {
            let cli = cli.clone();
            let ids = ids.clone();
            let sdk_tags = sdk_tags.clone();
            async move {
                cli.create_tags()
                    .set_resources(Some(ids))
                    .set_tags(Some(sdk_tags))
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| Error::API {
                        message: format!("failed create_tags {:?}", e),
                        is_retryable: is_error_retryable(&e),
                    })
            }
        })
        .await
    }

    /// Fetches one instance record by id. A freshly bound spot instance may
    /// not be visible to describe calls yet, so "not found" lookups retry
    /// within the quick bound.
    async fn instance_by_id(&self, instance_id: &str) -> Result<Instance> {
        let cli = self.cli.clone();
        let id = instance_id.to_string();
        with_retries("describe_instances(one)", RetryPolicy::quick(), || {
            let cli = cli.clone();
            let id = id.clone();
            async move {
                let resp = cli
                    .describe_instances()
                    .instance_ids(id.clone())
                    .send()
                    .await
                    .map_err(|e| Error::API {
                        message: format!("failed describe_instances {:?}", e),
                        is_retryable: is_error_retryable(&e) || is_error_instance_not_found(&e),
                    })?;
                for rsv in resp.reservations().unwrap_or_default() {
                    if let Some(inst) = rsv.instances().unwrap_or_default().first() {
                        return Ok(to_record(inst));
                    }
                }
                Err(Error::API {
                    message: format!("instance '{}' not visible yet", id),
                    is_retryable: true,
                })
            }
        })
        .await
    }

    /// Lists instances, flattening the reservation structure. Filter keys
    /// pass through as native EC2 filter names (e.g. "tag:Name",
    /// "instance-state-name").
    pub async fn find(&self, filters: &HashMap<String, String>) -> Result<Vec<Instance>> {
        let mut req = self.cli.describe_instances();
        if !filters.is_empty() {
            let mut ff: Vec<Filter> = Vec::new();
            for (k, v) in filters {
                ff.push(
                    Filter::builder()
                        .set_name(Some(k.clone()))
                        .set_values(Some(vec![v.clone()]))
                        .build(),
                );
            }
            req = req.set_filters(Some(ff));
        }
        let resp = req.send().await.map_err(|e| Error::API {
            message: format!("failed describe_instances {:?}", e),
            is_retryable: is_error_retryable(&e),
        })?;

        let mut instances: Vec<Instance> = Vec::new();
        for rsv in resp.reservations().unwrap_or_default() {
            for inst in rsv.instances().unwrap_or_default() {
                instances.push(to_record(inst));
            }
        }
        info!("found {} instance(s)", instances.len());
        Ok(instances)
    }

    /// Stops the "count" most recently launched instances (zero for all).
    pub async fn stop(&self, instances: Vec<Instance>, count: usize) -> Result<()> {
        let selected = instance::newest(instances, count);
        if selected.is_empty() {
            warn!("no instances to stop");
            return Ok(());
        }
        let ids: Vec<String> = selected.iter().map(|i| i.instance_id.clone()).collect();
        info!("stopping {} instance(s): {:?}", ids.len(), ids);
        self.cli
            .stop_instances()
            .set_instance_ids(Some(ids))
            .send()
            .await
            .map_err(|e| Error::API {
                message: format!("failed stop_instances {:?}", e),
                is_retryable: is_error_retryable(&e),
            })?;
        Ok(())
    }

    /// Terminates the "count" most recently launched instances (zero for
    /// all).
    pub async fn terminate(&self, instances: Vec<Instance>, count: usize) -> Result<()> {
        let selected = instance::newest(instances, count);
        if selected.is_empty() {
            warn!("no instances to terminate");
            return Ok(());
        }
        let ids: Vec<String> = selected.iter().map(|i| i.instance_id.clone()).collect();
        info!("terminating {} instance(s): {:?}", ids.len(), ids);
        self.cli
            .terminate_instances()
            .set_instance_ids(Some(ids))
            .send()
            .await
            .map_err(|e| Error::API {
                message: format!("failed terminate_instances {:?}", e),
                is_retryable: is_error_retryable(&e),
            })?;
        Ok(())
    }
}

#[async_trait]
impl InstanceProvider for Manager {
    type Image = Ec2ImageDef;

    fn name(&self) -> &'static str {
        "ec2"
    }

    async fn create_on_demand(
        &self,
        image: &Ec2ImageDef,
        tags: &HashMap<String, String>,
    ) -> Result<Vec<Instance>> {
        Manager::create_on_demand(self, image, tags).await
    }

    async fn create_spot(
        &self,
        max_price: f64,
        image: &Ec2ImageDef,
        tags: &HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Instance>> {
        Manager::create_spot(self, max_price, image, tags, timeout).await
    }

    async fn stop(&self, instances: Vec<Instance>, count: usize) -> Result<()> {
        Manager::stop(self, instances, count).await
    }

    async fn terminate(&self, instances: Vec<Instance>, count: usize) -> Result<()> {
        Manager::terminate(self, instances, count).await
    }

    async fn find(&self, filters: &HashMap<String, String>) -> Result<Vec<Instance>> {
        Manager::find(self, filters).await
    }
}

/// Drives outstanding spot requests to resolution: each tick polls the
/// whole batch, fulfilled requests move into the result list, closed
/// requests are recorded and dropped, and on timeout (or abort) the
/// remainder is cancelled in one batch. Results follow completion order.
pub(crate) async fn drive_spot_requests<P, PFut, C, CFut>(
    mut outstanding: Vec<String>,
    timeout: Option<Duration>,
    interval: Duration,
    abort: Option<Arc<AtomicBool>>,
    mut poll: P,
    mut cancel: C,
) -> Result<Vec<Instance>>
where
    P: FnMut(Vec<String>) -> PFut,
    PFut: Future<Output = Result<Vec<(String, SpotOutcome)>>>,
    C: FnMut(Vec<String>) -> CFut,
    CFut: Future<Output = Result<()>>,
{
    let mut fulfilled: Vec<Instance> = Vec::new();
    let mut unresolved: Vec<(String, String)> = Vec::new();
    let mut remaining = timeout;

    while !outstanding.is_empty() {
        sleep(interval).await;

        let mut still_open: Vec<String> = Vec::new();
        for (request_id, outcome) in poll(outstanding.clone()).await? {
            match outcome {
                SpotOutcome::Open => still_open.push(request_id),
                SpotOutcome::Fulfilled(rec) => {
                    info!("spot request '{}' fulfilled by '{}'", request_id, rec.instance_id);
                    fulfilled.push(rec);
                }
                SpotOutcome::Closed(code) => {
                    warn!("spot request '{}' closed without an instance ({})", request_id, code);
                    unresolved.push((request_id, code));
                }
            }
        }
        outstanding = still_open;
        if outstanding.is_empty() {
            break;
        }

        let aborted = abort.as_ref().map_or(false, |f| f.load(Ordering::Relaxed));
        let timed_out = match remaining.as_mut() {
            Some(rem) => {
                *rem = rem.saturating_sub(interval);
                rem.is_zero()
            }
            None => false,
        };
        if aborted || timed_out {
            warn!(
                "{} spot request(s) still outstanding after {}, cancelling",
                outstanding.len(),
                if aborted { "interrupt" } else { "timeout" }
            );
            if let Err(e) = cancel(outstanding.clone()).await {
                warn!("failed to cancel outstanding spot requests ({})", e.message());
            }
            break;
        }
    }

    if !unresolved.is_empty() {
        warn!(
            "{} spot request(s) closed unresolved: {:?}",
            unresolved.len(),
            unresolved
        );
    }
    Ok(fulfilled)
}

fn root_device_mapping(image: &Ec2ImageDef) -> Option<BlockDeviceMapping> {
    if image.root_size_gb.is_none() && image.root_delete_on_termination.is_none() {
        return None;
    }
    let mut ebs = EbsBlockDevice::builder()
        .volume_type(VolumeType::from(image.root_volume_type.as_str()));
    if let Some(size) = image.root_size_gb {
        ebs = ebs.volume_size(size);
    }
    if let Some(del) = image.root_delete_on_termination {
        ebs = ebs.delete_on_termination(del);
    }
    Some(
        BlockDeviceMapping::builder()
            .device_name(image.root_device_name.clone())
            .ebs(ebs.build())
            .build(),
    )
}

/// Converts the raw EC2 instance into the provider-neutral record.
fn to_record(inst: &aws_sdk_ec2::model::Instance) -> Instance {
    let instance_id = inst.instance_id().unwrap_or_default().to_string();
    let launched_at_utc = inst
        .launch_time()
        .and_then(|t| DateTime::from_timestamp(t.secs(), 0))
        .unwrap_or_default();
    let state = inst
        .state()
        .and_then(|s| s.name())
        .map(|n| n.as_str().to_string())
        .unwrap_or_else(|| String::from("unknown"));
    let availability_zone = inst
        .placement()
        .and_then(|p| p.availability_zone())
        .unwrap_or_default()
        .to_string();
    let public_hostname = inst.public_dns_name().unwrap_or_default().to_string();
    let public_ipv4 = inst.public_ip_address().unwrap_or_default().to_string();
    let mut tags: HashMap<String, String> = HashMap::new();
    for tag in inst.tags().unwrap_or_default() {
        if let (Some(k), Some(v)) = (tag.key(), tag.value()) {
            tags.insert(k.to_string(), v.to_string());
        }
    }

    Instance {
        provider: String::from("ec2"),
        instance_id,
        launched_at_utc,
        state,
        availability_zone,
        public_hostname,
        public_ipv4,
        tags,
    }
}

#[inline]
pub fn is_error_retryable<E>(e: &SdkError<E>) -> bool {
    match e {
        SdkError::TimeoutError(_) | SdkError::ResponseError { .. } => true,
        SdkError::DispatchFailure(e) => e.is_timeout() || e.is_io(),
        _ => false,
    }
}

/// Describe calls can race a freshly fulfilled spot bid before the instance
/// propagates through the API.
#[inline]
fn is_error_instance_not_found<E: std::fmt::Debug>(e: &SdkError<E>) -> bool {
    match e {
        SdkError::ServiceError { err, .. } => {
            let msg = format!("{:?}", err);
            msg.contains("InvalidInstanceID")
        }
        _ => false,
    }
}

#[cfg(test)]
fn spot_test_instance(id: &str) -> Instance {
    Instance {
        provider: String::from("ec2"),
        instance_id: String::from(id),
        launched_at_utc: DateTime::from_timestamp(1_690_000_000, 0).unwrap(),
        state: String::from("running"),
        availability_zone: String::from("us-west-2a"),
        public_hostname: String::from("ec2-host"),
        public_ipv4: String::from("203.0.113.9"),
        tags: HashMap::new(),
    }
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- ec2::test_spot_machine_fulfill_and_timeout --exact --show-output
#[tokio::test]
async fn test_spot_machine_fulfill_and_timeout() {
    use std::sync::Mutex;

    let _ = env_logger::builder().is_test(true).try_init();

    let cancelled: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let mut tick: u32 = 0;

    // R1 is fulfilled on the second tick; R2 never leaves "open" and must be
    // cancelled when the timeout budget runs out.
    let fulfilled = drive_spot_requests(
        vec![String::from("sir-r1"), String::from("sir-r2")],
        Some(Duration::from_millis(10)),
        Duration::from_millis(5),
        None,
        |ids| {
            tick += 1;
            let t = tick;
            async move {
                let mut outcomes = Vec::new();
                for id in ids {
                    if id == "sir-r1" && t >= 2 {
                        outcomes.push((id, SpotOutcome::Fulfilled(spot_test_instance("i-r1"))));
                    } else {
                        outcomes.push((id, SpotOutcome::Open));
                    }
                }
                Ok(outcomes)
            }
        },
        |ids| {
            let cancelled = Arc::clone(&cancelled);
            async move {
                cancelled.lock().unwrap().extend(ids);
                Ok(())
            }
        },
    )
    .await
    .unwrap();

    assert_eq!(fulfilled.len(), 1);
    assert_eq!(fulfilled[0].instance_id, "i-r1");
    assert_eq!(
        cancelled.lock().unwrap().clone(),
        vec![String::from("sir-r2")]
    );
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- ec2::test_spot_machine_closed_requests_not_retried --exact --show-output
#[tokio::test]
async fn test_spot_machine_closed_requests_not_retried() {
    use std::sync::Mutex;

    let _ = env_logger::builder().is_test(true).try_init();

    let polled_ids: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let mut tick: u32 = 0;

    // R1 closes on tick 1 (e.g. price-too-low) and must never be polled
    // again; R2 is fulfilled on tick 2. No cancellation happens.
    let fulfilled = drive_spot_requests(
        vec![String::from("sir-r1"), String::from("sir-r2")],
        None,
        Duration::from_millis(1),
        None,
        |ids| {
            tick += 1;
            let t = tick;
            let polled_ids = Arc::clone(&polled_ids);
            async move {
                polled_ids.lock().unwrap().push(ids.clone());
                let mut outcomes = Vec::new();
                for id in ids {
                    if id == "sir-r1" {
                        outcomes.push((id, SpotOutcome::Closed(String::from("price-too-low"))));
                    } else if t >= 2 {
                        outcomes.push((id, SpotOutcome::Fulfilled(spot_test_instance("i-r2"))));
                    } else {
                        outcomes.push((id, SpotOutcome::Open));
                    }
                }
                Ok(outcomes)
            }
        },
        |_ids| async move {
            panic!("nothing should be cancelled");
        },
    )
    .await
    .unwrap();

    assert_eq!(fulfilled.len(), 1);
    assert_eq!(fulfilled[0].instance_id, "i-r2");

    let polls = polled_ids.lock().unwrap().clone();
    assert_eq!(polls.len(), 2);
    assert_eq!(polls[0], vec![String::from("sir-r1"), String::from("sir-r2")]);
    assert_eq!(polls[1], vec![String::from("sir-r2")]);
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- ec2::test_spot_machine_abort_flag --exact --show-output
#[tokio::test]
async fn test_spot_machine_abort_flag() {
    use std::sync::Mutex;

    let _ = env_logger::builder().is_test(true).try_init();

    let cancelled: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let abort = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&abort);

    let fulfilled = drive_spot_requests(
        vec![String::from("sir-r1")],
        None,
        Duration::from_millis(1),
        Some(abort),
        move |ids| {
            // flip the flag after the first poll, as a signal handler would
            flag.store(true, Ordering::Relaxed);
            async move { Ok(ids.into_iter().map(|id| (id, SpotOutcome::Open)).collect()) }
        },
        |ids| {
            let cancelled = Arc::clone(&cancelled);
            async move {
                cancelled.lock().unwrap().extend(ids);
                Ok(())
            }
        },
    )
    .await
    .unwrap();

    assert!(fulfilled.is_empty());
    assert_eq!(
        cancelled.lock().unwrap().clone(),
        vec![String::from("sir-r1")]
    );
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- ec2::test_image_def_defaults --exact --show-output
#[test]
fn test_image_def_defaults() {
    let _ = env_logger::builder().is_test(true).try_init();

    let image: Ec2ImageDef = serde_json::from_str(
        r#"{"image_id": "ami-0abcdef1234567890", "instance_type": "t3.large"}"#,
    )
    .unwrap();
    assert_eq!(image.count, 1);
    assert_eq!(image.root_device_name, "/dev/sda1");
    assert_eq!(image.root_volume_type, "gp2");
    assert!(image.user_data.is_none());
    assert!(root_device_mapping(&image).is_none());

    let sized: Ec2ImageDef = serde_json::from_str(
        r#"{"image_name": "fuzzer-base-*", "instance_type": "c5.xlarge",
            "count": 3, "root_size_gb": 100, "root_delete_on_termination": true}"#,
    )
    .unwrap();
    assert_eq!(sized.count, 3);
    assert!(root_device_mapping(&sized).is_some());
}
