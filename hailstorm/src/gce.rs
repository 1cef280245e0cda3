//! Google Compute Engine backend.
//!
//! Talks to the Compute Engine v1 REST API with a caller-provided OAuth2
//! access token. Instance creation fans out one task per node, polls each
//! zone operation to DONE, and merges the per-node results.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::{
    errors::{Error, Result},
    http,
    instance::{self, Instance},
    provider::InstanceProvider,
    retry::{with_retries, RetryPolicy},
    DEFAULT_POLL_INTERVAL,
};

const GCE_API_BASE: &str = "https://compute.googleapis.com/compute/v1";

/// Credential config loaded from the `--config` JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GceConfig {
    pub project: String,
    pub zone: String,
    /// Pre-obtained OAuth2 access token with compute scope.
    pub access_token: String,
}

impl GceConfig {
    pub fn load(file_path: &str) -> Result<Self> {
        info!("loading GCE config from '{}'", file_path);
        let contents = std::fs::read_to_string(file_path).map_err(|e| Error::Other {
            message: format!("failed to read '{}' ({})", file_path, e),
            is_retryable: false,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| Error::Other {
            message: format!("failed to parse '{}' ({})", file_path, e),
            is_retryable: false,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.project.is_empty() || self.zone.is_empty() || self.access_token.is_empty() {
            return Err(Error::Other {
                message: String::from(
                    "GCE config requires non-empty 'project', 'zone', and 'access_token'",
                ),
                is_retryable: false,
            });
        }
        Ok(())
    }
}

/// Launch parameters for one logical GCE image definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GceImageDef {
    pub machine_type: String,
    /// Overrides the config-level zone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Short image name (resolved within "image_project") or a full
    /// "projects/.../global/images/..." path.
    pub source_image: String,
    #[serde(default = "default_image_project")]
    pub image_project: String,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_disk_size_gb")]
    pub disk_size_gb: i64,
    #[serde(default = "default_true")]
    pub disk_auto_delete: bool,
    #[serde(default)]
    pub preemptible: bool,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_tags: Vec<String>,
    /// Extra metadata items, merged after the startup script.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Bootstrap script, shipped as "startup-script" metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

fn default_image_project() -> String {
    String::from("cos-cloud")
}

fn default_count() -> usize {
    1
}

fn default_disk_size_gb() -> i64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_network() -> String {
    String::from("global/networks/default")
}

/// Implements Google Compute Engine manager.
#[derive(Debug, Clone)]
pub struct Manager {
    config: GceConfig,
    cli: reqwest::Client,
}

impl Manager {
    pub fn new(config: GceConfig) -> Self {
        Self {
            config,
            cli: reqwest::Client::new(),
        }
    }

    fn zone_url(&self, zone: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}",
            GCE_API_BASE, self.config.project, zone
        )
    }

    fn pick_zone(&self, image: &GceImageDef) -> String {
        image.zone.clone().unwrap_or_else(|| self.config.zone.clone())
    }

    /// Creates "count" nodes in parallel tasks joined before returning.
    /// Per-node failures are logged and the successes returned; only when
    /// every node fails does the whole call fail.
    pub async fn create(
        &self,
        image: &GceImageDef,
        tags: &HashMap<String, String>,
        preemptible: bool,
    ) -> Result<Vec<Instance>> {
        let zone = self.pick_zone(image);
        let names = node_names(image.name.as_deref(), image.count);
        info!(
            "creating {} GCE node(s) in zone '{}' ({})",
            names.len(),
            zone,
            image.machine_type
        );

        let mut handles = Vec::new();
        for name in names {
            let mgr = self.clone();
            let image = image.clone();
            let tags = tags.clone();
            let zone = zone.clone();
            handles.push(tokio::spawn(async move {
                let created = mgr
                    .create_one(&zone, &name, &image, &tags, preemptible)
                    .await;
                (name, created)
            }));
        }

        let mut created: Vec<Instance> = Vec::new();
        let mut failed: usize = 0;
        for handle in handles {
            match handle.await {
                Ok((name, Ok(rec))) => {
                    info!("node '{}' is {}", name, rec.state);
                    created.push(rec);
                }
                Ok((name, Err(e))) => {
                    warn!("failed to create node '{}' ({})", name, e.message());
                    failed += 1;
                }
                Err(e) => {
                    warn!("node creation task failed ({})", e);
                    failed += 1;
                }
            }
        }

        if created.is_empty() && failed > 0 {
            return Err(Error::API {
                message: format!("all {} GCE node creation(s) failed", failed),
                is_retryable: false,
            });
        }
        Ok(created)
    }

    async fn create_one(
        &self,
        zone: &str,
        name: &str,
        image: &GceImageDef,
        tags: &HashMap<String, String>,
        preemptible: bool,
    ) -> Result<Instance> {
        let mut items: Vec<MetadataItem> = Vec::new();
        if let Some(ud) = &image.user_data {
            items.push(MetadataItem {
                key: String::from("startup-script"),
                value: ud.clone(),
            });
        }
        for (k, v) in &image.metadata {
            items.push(MetadataItem {
                key: k.clone(),
                value: v.clone(),
            });
        }

        let body = InsertInstanceRequest {
            name: name.to_string(),
            machine_type: format!("zones/{}/machineTypes/{}", zone, image.machine_type),
            disks: vec![AttachedDisk {
                boot: true,
                auto_delete: image.disk_auto_delete,
                initialize_params: InitializeParams {
                    source_image: source_image_path(image),
                    disk_size_gb: image.disk_size_gb,
                },
            }],
            network_interfaces: vec![NetworkInterface {
                network: image.network.clone(),
                access_configs: vec![AccessConfig {
                    name: String::from("External NAT"),
                    r#type: String::from("ONE_TO_ONE_NAT"),
                }],
            }],
            labels: if tags.is_empty() {
                None
            } else {
                Some(tags.clone())
            },
            metadata: Metadata { items },
            scheduling: if preemptible || image.preemptible {
                // preemptible capacity cannot auto-restart
                Some(Scheduling {
                    preemptible: true,
                    automatic_restart: false,
                })
            } else {
                None
            },
            tags: if image.network_tags.is_empty() {
                None
            } else {
                Some(NetworkTags {
                    items: image.network_tags.clone(),
                })
            },
        };

        info!("inserting instance '{}'", name);
        let url = format!("{}/instances", self.zone_url(zone));
        let resp = self
            .cli
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::request_error("instances.insert", &e))?;
        let op: ZoneOperation = http::read_json("instances.insert", resp).await?;

        self.wait_for_zone_operation(zone, &op.name).await?;
        self.get_instance(zone, name).await
    }

    /// Polls a zone operation until DONE, surfacing operation errors.
    async fn wait_for_zone_operation(&self, zone: &str, op_name: &str) -> Result<()> {
        loop {
            let url = format!("{}/operations/{}", self.zone_url(zone), op_name);
            let cli = self.cli.clone();
            let token = self.config.access_token.clone();
            let op = with_retries("zoneOperations.get", RetryPolicy::default(), || {
                let cli = cli.clone();
                let token = token.clone();
                let url = url.clone();
                async move {
                    let resp = cli
                        .get(&url)
                        .bearer_auth(&token)
                        .send()
                        .await
                        .map_err(|e| http::request_error("zoneOperations.get", &e))?;
                    http::read_json::<ZoneOperation>("zoneOperations.get", resp).await
                }
            })
            .await?;

            info!("operation '{}' is {}", op.name, op.status);
            if op.status == "DONE" {
                if let Some(err) = &op.error {
                    let messages: Vec<String> = err
                        .errors
                        .iter()
                        .map(|e| format!("{}: {}", e.code, e.message))
                        .collect();
                    return Err(Error::API {
                        message: format!("operation '{}' failed ({})", op.name, messages.join("; ")),
                        is_retryable: false,
                    });
                }
                return Ok(());
            }
            sleep(DEFAULT_POLL_INTERVAL).await;
        }
    }

    async fn get_instance(&self, zone: &str, name: &str) -> Result<Instance> {
        let url = format!("{}/instances/{}", self.zone_url(zone), name);
        let cli = self.cli.clone();
        let token = self.config.access_token.clone();
        let inst = with_retries("instances.get", RetryPolicy::quick(), || {
            let cli = cli.clone();
            let token = token.clone();
            let url = url.clone();
            async move {
                let resp = cli
                    .get(&url)
                    .bearer_auth(&token)
                    .send()
                    .await
                    .map_err(|e| http::request_error("instances.get", &e))?;
                http::read_json::<GceInstance>("instances.get", resp).await
            }
        })
        .await?;
        Ok(to_record(&inst))
    }

    /// Lists nodes in the configured zone; filter criteria become a
    /// server-side label filter expression.
    pub async fn find(&self, filters: &HashMap<String, String>) -> Result<Vec<Instance>> {
        let url = format!("{}/instances", self.zone_url(&self.config.zone));
        let expr = label_filter_expression(filters);
        let cli = self.cli.clone();
        let token = self.config.access_token.clone();
        let listed = with_retries("instances.list", RetryPolicy::default(), || {
            let cli = cli.clone();
            let token = token.clone();
            let url = url.clone();
            let expr = expr.clone();
            async move {
                let mut req = cli.get(&url).bearer_auth(&token);
                if let Some(filter) = &expr {
                    req = req.query(&[("filter", filter.as_str())]);
                }
                let resp = req
                    .send()
                    .await
                    .map_err(|e| http::request_error("instances.list", &e))?;
                http::read_json::<InstanceList>("instances.list", resp).await
            }
        })
        .await?;

        let instances: Vec<Instance> = listed.items.iter().map(to_record).collect();
        info!("found {} node(s)", instances.len());
        Ok(instances)
    }

    /// Stops the "count" most recently launched nodes, skipping nodes that
    /// are already stopped.
    pub async fn stop(&self, instances: Vec<Instance>, count: usize) -> Result<()> {
        let selected = instance::newest(instances, count);
        if selected.is_empty() {
            warn!("no instances to stop");
            return Ok(());
        }
        for rec in &selected {
            if rec.state == "TERMINATED" || rec.state == "STOPPING" {
                warn!("'{}' is already {}, skipping stop", rec.instance_id, rec.state);
                continue;
            }
            info!("stopping '{}'", rec.instance_id);
            let zone = self.record_zone(rec);
            let op = self
                .instance_action(&zone, &rec.instance_id, "stop")
                .await?;
            self.wait_for_zone_operation(&zone, &op.name).await?;
        }
        Ok(())
    }

    /// Starts stopped nodes, skipping nodes already running.
    pub async fn start(&self, instances: Vec<Instance>) -> Result<()> {
        if instances.is_empty() {
            warn!("no instances to start");
            return Ok(());
        }
        for rec in &instances {
            if rec.state == "RUNNING" {
                warn!("'{}' is already running, skipping start", rec.instance_id);
                continue;
            }
            info!("starting '{}'", rec.instance_id);
            let zone = self.record_zone(rec);
            let op = self
                .instance_action(&zone, &rec.instance_id, "start")
                .await?;
            self.wait_for_zone_operation(&zone, &op.name).await?;
        }
        Ok(())
    }

    /// Resets running nodes, skipping stopped ones.
    pub async fn reboot(&self, instances: Vec<Instance>) -> Result<()> {
        if instances.is_empty() {
            warn!("no instances to reboot");
            return Ok(());
        }
        for rec in &instances {
            if rec.state == "TERMINATED" || rec.state == "STOPPING" {
                warn!("'{}' is {}, skipping reboot", rec.instance_id, rec.state);
                continue;
            }
            info!("rebooting '{}'", rec.instance_id);
            let zone = self.record_zone(rec);
            let op = self
                .instance_action(&zone, &rec.instance_id, "reset")
                .await?;
            self.wait_for_zone_operation(&zone, &op.name).await?;
        }
        Ok(())
    }

    /// Deletes the "count" most recently launched nodes in parallel tasks.
    /// Per-node failures are logged; only all-failed is an error.
    pub async fn terminate(&self, instances: Vec<Instance>, count: usize) -> Result<()> {
        let selected = instance::newest(instances, count);
        if selected.is_empty() {
            warn!("no instances to terminate");
            return Ok(());
        }
        info!("terminating {} GCE node(s)", selected.len());

        let mut handles = Vec::new();
        for rec in selected {
            let mgr = self.clone();
            handles.push(tokio::spawn(async move {
                let zone = mgr.record_zone(&rec);
                let deleted = mgr.delete_one(&zone, &rec.instance_id).await;
                (rec.instance_id, deleted)
            }));
        }

        let mut total: usize = 0;
        let mut failed: usize = 0;
        for handle in handles {
            total += 1;
            match handle.await {
                Ok((name, Ok(()))) => info!("deleted '{}'", name),
                Ok((name, Err(e))) => {
                    warn!("failed to delete '{}' ({})", name, e.message());
                    failed += 1;
                }
                Err(e) => {
                    warn!("delete task failed ({})", e);
                    failed += 1;
                }
            }
        }
        if failed == total {
            return Err(Error::API {
                message: format!("all {} GCE node deletion(s) failed", failed),
                is_retryable: false,
            });
        }
        Ok(())
    }

    async fn delete_one(&self, zone: &str, name: &str) -> Result<()> {
        let url = format!("{}/instances/{}", self.zone_url(zone), name);
        let resp = self
            .cli
            .delete(&url)
            .bearer_auth(&self.config.access_token)
            .send()
            .await
            .map_err(|e| http::request_error("instances.delete", &e))?;
        let op: ZoneOperation = http::read_json("instances.delete", resp).await?;
        self.wait_for_zone_operation(zone, &op.name).await
    }

    async fn instance_action(
        &self,
        zone: &str,
        name: &str,
        action: &str,
    ) -> Result<ZoneOperation> {
        let url = format!("{}/instances/{}/{}", self.zone_url(zone), name, action);
        let op = format!("instances.{}", action);
        let resp = self
            .cli
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .send()
            .await
            .map_err(|e| http::request_error(&op, &e))?;
        http::read_json(&op, resp).await
    }

    fn record_zone(&self, rec: &Instance) -> String {
        if rec.availability_zone.is_empty() {
            self.config.zone.clone()
        } else {
            rec.availability_zone.clone()
        }
    }
}

#[async_trait]
impl InstanceProvider for Manager {
    type Image = GceImageDef;

    fn name(&self) -> &'static str {
        "gce"
    }

    async fn create_on_demand(
        &self,
        image: &GceImageDef,
        tags: &HashMap<String, String>,
    ) -> Result<Vec<Instance>> {
        self.create(image, tags, false).await
    }

    async fn create_spot(
        &self,
        _max_price: f64,
        image: &GceImageDef,
        tags: &HashMap<String, String>,
        _timeout: Option<Duration>,
    ) -> Result<Vec<Instance>> {
        // preemptible capacity has no bid price
        self.create(image, tags, true).await
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

/// Node names: explicit base with "-1..-N" suffixes when more than one is
/// requested, a random "hailstorm-" name otherwise.
fn node_names(base: Option<&str>, count: usize) -> Vec<String> {
    let base = match base {
        Some(b) => b.to_string(),
        None => format!("hailstorm-{}", random_manager::string(10).to_lowercase()),
    };
    if count <= 1 {
        return vec![base];
    }
    (1..=count).map(|i| format!("{}-{}", base, i)).collect()
}

fn source_image_path(image: &GceImageDef) -> String {
    if image.source_image.contains('/') {
        image.source_image.clone()
    } else {
        format!(
            "projects/{}/global/images/{}",
            image.image_project, image.source_image
        )
    }
}

/// Builds the server-side list filter from the criteria, e.g.
/// `labels.owner="me" AND labels.pool="fuzzer"`. Keys are sorted so the
/// expression is deterministic.
fn label_filter_expression(filters: &HashMap<String, String>) -> Option<String> {
    if filters.is_empty() {
        return None;
    }
    let mut keys: Vec<&String> = filters.keys().collect();
    keys.sort();
    let parts: Vec<String> = keys
        .iter()
        .map(|k| format!("labels.{}=\"{}\"", k, filters[*k]))
        .collect();
    Some(parts.join(" AND "))
}

fn to_record(inst: &GceInstance) -> Instance {
    let launched_at_utc = DateTime::parse_from_rfc3339(&inst.creation_timestamp)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default();
    let availability_zone = inst
        .zone
        .as_deref()
        .and_then(|z| z.rsplit('/').next())
        .unwrap_or_default()
        .to_string();
    let public_ipv4 = inst
        .network_interfaces
        .first()
        .and_then(|ni| ni.access_configs.first())
        .and_then(|ac| ac.nat_ip.clone())
        .unwrap_or_default();

    Instance {
        provider: String::from("gce"),
        instance_id: inst.name.clone(),
        launched_at_utc,
        state: inst.status.clone(),
        availability_zone,
        public_hostname: String::new(),
        public_ipv4,
        tags: inst.labels.clone(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertInstanceRequest {
    name: String,
    machine_type: String,
    disks: Vec<AttachedDisk>,
    network_interfaces: Vec<NetworkInterface>,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<HashMap<String, String>>,
    metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduling: Option<Scheduling>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<NetworkTags>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachedDisk {
    boot: bool,
    auto_delete: bool,
    initialize_params: InitializeParams,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    source_image: String,
    disk_size_gb: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    network: String,
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Serialize)]
struct AccessConfig {
    name: String,
    #[serde(rename = "type")]
    r#type: String,
}

#[derive(Debug, Serialize)]
struct Metadata {
    items: Vec<MetadataItem>,
}

#[derive(Debug, Serialize)]
struct MetadataItem {
    key: String,
    value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Scheduling {
    preemptible: bool,
    automatic_restart: bool,
}

#[derive(Debug, Serialize)]
struct NetworkTags {
    items: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZoneOperation {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    errors: Vec<OperationErrorItem>,
}

#[derive(Debug, Deserialize)]
struct OperationErrorItem {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceList {
    #[serde(default)]
    items: Vec<GceInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GceInstance {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    creation_timestamp: String,
    #[serde(default)]
    zone: Option<String>,
    #[serde(default)]
    network_interfaces: Vec<GceNetworkInterface>,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GceNetworkInterface {
    #[serde(default)]
    access_configs: Vec<GceAccessConfig>,
}

#[derive(Debug, Deserialize)]
struct GceAccessConfig {
    #[serde(default, rename = "natIP")]
    nat_ip: Option<String>,
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- gce::test_label_filter_expression --exact --show-output
#[test]
fn test_label_filter_expression() {
    let _ = env_logger::builder().is_test(true).try_init();

    assert_eq!(label_filter_expression(&HashMap::new()), None);

    let mut filters = HashMap::new();
    filters.insert(String::from("pool"), String::from("fuzzer"));
    filters.insert(String::from("owner"), String::from("me"));
    assert_eq!(
        label_filter_expression(&filters).unwrap(),
        "labels.owner=\"me\" AND labels.pool=\"fuzzer\""
    );
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- gce::test_node_names --exact --show-output
#[test]
fn test_node_names() {
    let _ = env_logger::builder().is_test(true).try_init();

    assert_eq!(node_names(Some("grizzly"), 1), vec!["grizzly"]);
    assert_eq!(
        node_names(Some("grizzly"), 3),
        vec!["grizzly-1", "grizzly-2", "grizzly-3"]
    );

    let generated = node_names(None, 2);
    assert_eq!(generated.len(), 2);
    assert!(generated[0].starts_with("hailstorm-"));
    assert!(generated[0].ends_with("-1"));
    assert!(generated[1].ends_with("-2"));
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- gce::test_source_image_path --exact --show-output
#[test]
fn test_source_image_path() {
    let _ = env_logger::builder().is_test(true).try_init();

    let image: GceImageDef = serde_json::from_str(
        r#"{"machine_type": "n1-standard-2", "source_image": "fuzzer-base"}"#,
    )
    .unwrap();
    assert_eq!(
        source_image_path(&image),
        "projects/cos-cloud/global/images/fuzzer-base"
    );
    assert_eq!(image.disk_size_gb, 10);
    assert!(image.disk_auto_delete);

    let full: GceImageDef = serde_json::from_str(
        r#"{"machine_type": "n1-standard-2",
            "source_image": "projects/debian-cloud/global/images/family/debian-12",
            "image_project": "ignored"}"#,
    )
    .unwrap();
    assert_eq!(
        source_image_path(&full),
        "projects/debian-cloud/global/images/family/debian-12"
    );
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- gce::test_instance_record_from_api --exact --show-output
#[test]
fn test_instance_record_from_api() {
    let _ = env_logger::builder().is_test(true).try_init();

    let inst: GceInstance = serde_json::from_str(
        r#"{
            "name": "grizzly-1",
            "status": "RUNNING",
            "creationTimestamp": "2023-08-01T12:30:00.000-07:00",
            "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-east1-b",
            "networkInterfaces": [
                {"accessConfigs": [{"natIP": "203.0.113.77"}]}
            ],
            "labels": {"pool": "fuzzer"}
        }"#,
    )
    .unwrap();

    let rec = to_record(&inst);
    assert_eq!(rec.provider, "gce");
    assert_eq!(rec.instance_id, "grizzly-1");
    assert_eq!(rec.state, "RUNNING");
    assert_eq!(rec.availability_zone, "us-east1-b");
    assert_eq!(rec.public_ipv4, "203.0.113.77");
    assert_eq!(rec.tags.get("pool").unwrap(), "fuzzer");
    assert_eq!(rec.launched_at_utc.timestamp(), 1_690_918_200);
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- gce::test_gce_config_validate --exact --show-output
#[test]
fn test_gce_config_validate() {
    let _ = env_logger::builder().is_test(true).try_init();

    let ok: GceConfig = serde_json::from_str(
        r#"{"project": "fuzzing", "zone": "us-east1-b", "access_token": "ya29.token"}"#,
    )
    .unwrap();
    assert!(ok.validate().is_ok());

    let missing: GceConfig =
        serde_json::from_str(r#"{"project": "fuzzing", "zone": "", "access_token": "t"}"#).unwrap();
    assert!(missing.validate().is_err());
}
