//! Packet bare-metal backend.
//!
//! Talks to the Packet REST API with token-header auth. Devices come back
//! in their initial provisioning state right away, so creation does not
//! poll. Enumeration filters client-side over the raw device fields.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{Error, Result},
    http,
    instance::{self, Instance},
    provider::InstanceProvider,
    retry::{with_retries, RetryPolicy},
};

const PACKET_API_BASE: &str = "https://api.packet.net";

/// Credential config loaded from the `--config` JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PacketConfig {
    pub auth_token: String,
    /// Project name to id.
    #[serde(default)]
    pub projects: HashMap<String, String>,
    /// Name of the project to operate in; optional when only one project
    /// is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl PacketConfig {
    pub fn load(file_path: &str) -> Result<Self> {
        info!("loading Packet config from '{}'", file_path);
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
        if self.auth_token.is_empty() {
            return Err(Error::Other {
                message: String::from("Packet config requires a non-empty 'auth_token'"),
                is_retryable: false,
            });
        }
        if !self.projects.values().any(|id| !id.is_empty()) {
            return Err(Error::Other {
                message: String::from("Packet config requires at least one project with an id"),
                is_retryable: false,
            });
        }
        Ok(())
    }

    /// Resolves the project id to operate in: the named project when
    /// "project" is set, otherwise the sole configured project.
    pub fn project_id(&self) -> Result<String> {
        if let Some(name) = &self.project {
            return match self.projects.get(name) {
                Some(id) if !id.is_empty() => Ok(id.clone()),
                _ => Err(Error::Other {
                    message: format!("project '{}' not found in Packet config", name),
                    is_retryable: false,
                }),
            };
        }
        if self.projects.len() == 1 {
            if let Some(id) = self.projects.values().next() {
                if !id.is_empty() {
                    return Ok(id.clone());
                }
            }
        }
        Err(Error::Other {
            message: String::from(
                "Packet config lists multiple projects, set 'project' to pick one",
            ),
            is_retryable: false,
        })
    }
}

/// Launch parameters for one logical Packet image definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PacketImageDef {
    pub plan: String,
    pub facility: String,
    pub operating_system: String,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname_prefix: Option<String>,
    /// Bootstrap script, shipped as device userdata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

fn default_count() -> usize {
    1
}

/// Implements Packet bare-metal manager.
#[derive(Debug, Clone)]
pub struct Manager {
    config: PacketConfig,
    cli: reqwest::Client,
}

impl Manager {
    pub fn new(config: PacketConfig) -> Self {
        Self {
            config,
            cli: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", PACKET_API_BASE, path)
    }

    /// Creates devices one POST at a time, failing on the first error.
    /// Devices return immediately in their initial provisioning state.
    async fn create_devices(
        &self,
        image: &PacketImageDef,
        tags: &HashMap<String, String>,
        spot_price_max: Option<f64>,
    ) -> Result<Vec<Instance>> {
        let project_id = self.config.project_id()?;
        let hostnames = device_hostnames(image.hostname_prefix.as_deref(), image.count);
        let tag_strings: Vec<String> = tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let mut created: Vec<Instance> = Vec::new();
        for hostname in hostnames {
            info!(
                "creating device '{}' ({} in {})",
                hostname, image.plan, image.facility
            );
            let body = CreateDeviceRequest {
                hostname,
                plan: image.plan.clone(),
                facility: image.facility.clone(),
                operating_system: image.operating_system.clone(),
                userdata: image.user_data.clone().unwrap_or_default(),
                tags: tag_strings.clone(),
                spot_instance: spot_price_max.is_some(),
                spot_price_max,
            };
            let resp = self
                .cli
                .post(self.url(&format!("/projects/{}/devices", project_id)))
                .header("X-Auth-Token", &self.config.auth_token)
                .json(&body)
                .send()
                .await
                .map_err(|e| http::request_error("devices.create", &e))?;
            let device: PacketDevice = http::read_json("devices.create", resp).await?;
            info!("device '{}' is {}", device.hostname, device.state);
            created.push(to_record(&device));
        }
        Ok(created)
    }

    /// Lists every device in the project and keeps the ones matching all
    /// filter criteria (root-level field equality, or membership for
    /// list-valued fields such as "tags").
    pub async fn find(&self, filters: &HashMap<String, String>) -> Result<Vec<Instance>> {
        let project_id = self.config.project_id()?;
        let url = self.url(&format!("/projects/{}/devices", project_id));
        let cli = self.cli.clone();
        let token = self.config.auth_token.clone();
        let listed = with_retries("devices.list", RetryPolicy::default(), || {
            let cli = cli.clone();
            let token = token.clone();
            let url = url.clone();
            async move {
                let resp = cli
                    .get(&url)
                    .header("X-Auth-Token", &token)
                    .query(&[("per_page", "1000")])
                    .send()
                    .await
                    .map_err(|e| http::request_error("devices.list", &e))?;
                http::read_json::<DevicesList>("devices.list", resp).await
            }
        })
        .await?;

        let mut instances: Vec<Instance> = Vec::new();
        for raw in &listed.devices {
            if !matches_filters(raw, filters) {
                continue;
            }
            let device: PacketDevice =
                serde_json::from_value(raw.clone()).map_err(|e| Error::Other {
                    message: format!("failed to decode device ({})", e),
                    is_retryable: false,
                })?;
            instances.push(to_record(&device));
        }
        info!("found {} device(s)", instances.len());
        Ok(instances)
    }

    /// Powers off the "count" most recently created devices, sequentially,
    /// failing on the first device that errors.
    pub async fn stop(&self, instances: Vec<Instance>, count: usize) -> Result<()> {
        let selected = instance::newest(instances, count);
        if selected.is_empty() {
            warn!("no devices to stop");
            return Ok(());
        }
        for rec in &selected {
            info!("powering off '{}'", rec.public_hostname);
            self.device_action(&rec.instance_id, "power_off").await?;
        }
        Ok(())
    }

    /// Reboots every given device.
    pub async fn reboot(&self, instances: Vec<Instance>) -> Result<()> {
        if instances.is_empty() {
            warn!("no devices to reboot");
            return Ok(());
        }
        for rec in &instances {
            info!("rebooting '{}'", rec.public_hostname);
            self.device_action(&rec.instance_id, "reboot").await?;
        }
        Ok(())
    }

    /// Deletes the "count" most recently created devices.
    pub async fn terminate(&self, instances: Vec<Instance>, count: usize) -> Result<()> {
        let selected = instance::newest(instances, count);
        if selected.is_empty() {
            warn!("no devices to terminate");
            return Ok(());
        }
        for rec in &selected {
            info!("deleting '{}'", rec.public_hostname);
            let resp = self
                .cli
                .delete(self.url(&format!("/devices/{}", rec.instance_id)))
                .header("X-Auth-Token", &self.config.auth_token)
                .send()
                .await
                .map_err(|e| http::request_error("devices.delete", &e))?;
            http::expect_success("devices.delete", resp).await?;
        }
        Ok(())
    }

    async fn device_action(&self, device_id: &str, action: &str) -> Result<()> {
        let resp = self
            .cli
            .post(self.url(&format!("/devices/{}/actions", device_id)))
            .header("X-Auth-Token", &self.config.auth_token)
            .json(&DeviceAction {
                r#type: action.to_string(),
            })
            .send()
            .await
            .map_err(|e| http::request_error("devices.actions", &e))?;
        http::expect_success("devices.actions", resp).await
    }

    /// Checks whether the given (facility, plan, quantity) tuples can all
    /// be fulfilled right now.
    pub async fn validate_capacity(&self, servers: &[(String, String, usize)]) -> Result<bool> {
        let body = CapacityRequest {
            servers: servers
                .iter()
                .map(|(facility, plan, quantity)| CapacityServerQuery {
                    facility: facility.clone(),
                    plan: plan.clone(),
                    quantity: *quantity,
                })
                .collect(),
        };
        let resp = self
            .cli
            .post(self.url("/capacity"))
            .header("X-Auth-Token", &self.config.auth_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::request_error("capacity.check", &e))?;
        let checked: CapacityResponse = http::read_json("capacity.check", resp).await?;
        Ok(!checked.servers.is_empty() && checked.servers.iter().all(|s| s.available))
    }

    pub async fn list_projects(&self) -> Result<Vec<(String, String)>> {
        let listed: ProjectsList = self.get_listing("/projects", "projects.list").await?;
        Ok(listed
            .projects
            .into_iter()
            .map(|p| (p.id, p.name))
            .collect())
    }

    pub async fn list_plans(&self) -> Result<Vec<(String, String)>> {
        let listed: PlansList = self.get_listing("/plans", "plans.list").await?;
        Ok(listed.plans.into_iter().map(|p| (p.slug, p.name)).collect())
    }

    pub async fn list_facilities(&self) -> Result<Vec<(String, String)>> {
        let listed: FacilitiesList = self.get_listing("/facilities", "facilities.list").await?;
        Ok(listed
            .facilities
            .into_iter()
            .map(|f| (f.code, f.name))
            .collect())
    }

    pub async fn list_operating_systems(&self) -> Result<Vec<(String, String)>> {
        let listed: OperatingSystemsList = self
            .get_listing("/operating-systems", "operating-systems.list")
            .await?;
        Ok(listed
            .operating_systems
            .into_iter()
            .map(|os| (os.slug, os.name))
            .collect())
    }

    /// Current spot market prices, nested facility to plan to price.
    pub async fn list_spot_prices(&self) -> Result<serde_json::Value> {
        self.get_listing("/market/spot/prices", "spot-prices.list")
            .await
    }

    /// Creates a storage volume and returns its id.
    pub async fn create_volume(
        &self,
        plan: &str,
        size_gb: u64,
        facility: &str,
        label: &str,
    ) -> Result<String> {
        let project_id = self.config.project_id()?;
        info!(
            "creating {}GB volume ({} in {})",
            size_gb, plan, facility
        );
        let body = CreateVolumeRequest {
            plan: plan.to_string(),
            size: size_gb,
            facility: facility.to_string(),
            description: label.to_string(),
        };
        let resp = self
            .cli
            .post(self.url(&format!("/projects/{}/storage", project_id)))
            .header("X-Auth-Token", &self.config.auth_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::request_error("volumes.create", &e))?;
        let volume: PacketVolume = http::read_json("volumes.create", resp).await?;
        info!("created volume '{}'", volume.id);
        Ok(volume.id)
    }

    /// Attaches a volume to a device.
    pub async fn attach_volume(&self, volume_id: &str, device_id: &str) -> Result<()> {
        info!("attaching volume '{}' to device '{}'", volume_id, device_id);
        let resp = self
            .cli
            .post(self.url(&format!("/storage/{}/attachments", volume_id)))
            .header("X-Auth-Token", &self.config.auth_token)
            .json(&AttachVolumeRequest {
                device_id: device_id.to_string(),
            })
            .send()
            .await
            .map_err(|e| http::request_error("volumes.attach", &e))?;
        http::expect_success("volumes.attach", resp).await
    }

    async fn get_listing<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        op: &str,
    ) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .cli
            .get(&url)
            .header("X-Auth-Token", &self.config.auth_token)
            .query(&[("per_page", "1000")])
            .send()
            .await
            .map_err(|e| http::request_error(op, &e))?;
        http::read_json(op, resp).await
    }
}

#[async_trait]
impl InstanceProvider for Manager {
    type Image = PacketImageDef;

    fn name(&self) -> &'static str {
        "packet"
    }

    async fn create_on_demand(
        &self,
        image: &PacketImageDef,
        tags: &HashMap<String, String>,
    ) -> Result<Vec<Instance>> {
        let available = self
            .validate_capacity(&[(image.facility.clone(), image.plan.clone(), image.count)])
            .await?;
        if !available {
            return Err(Error::API {
                message: format!(
                    "insufficient capacity for {} x '{}' in '{}'",
                    image.count, image.plan, image.facility
                ),
                is_retryable: false,
            });
        }
        self.create_devices(image, tags, None).await
    }

    async fn create_spot(
        &self,
        max_price: f64,
        image: &PacketImageDef,
        tags: &HashMap<String, String>,
        _timeout: Option<Duration>,
    ) -> Result<Vec<Instance>> {
        self.create_devices(image, tags, Some(max_price)).await
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

/// Hostnames: explicit prefix with "-1..-N" suffixes when more than one
/// device is requested, a random "hailstorm-" name otherwise.
fn device_hostnames(prefix: Option<&str>, count: usize) -> Vec<String> {
    let base = match prefix {
        Some(p) => p.to_string(),
        None => format!("hailstorm-{}", random_manager::string(10).to_lowercase()),
    };
    if count <= 1 {
        return vec![base];
    }
    (1..=count).map(|i| format!("{}-{}", base, i)).collect()
}

/// Matches one raw device against every filter criterion: string, number,
/// and bool fields compare by string equality; list fields match when any
/// element equals the wanted value; a missing field never matches.
fn matches_filters(device: &serde_json::Value, filters: &HashMap<String, String>) -> bool {
    for (k, wanted) in filters {
        let hit = match device.get(k) {
            Some(serde_json::Value::Array(items)) => items.iter().any(|item| match item {
                serde_json::Value::String(s) => s == wanted,
                other => other.to_string() == *wanted,
            }),
            Some(serde_json::Value::String(s)) => s == wanted,
            Some(serde_json::Value::Number(n)) => n.to_string() == *wanted,
            Some(serde_json::Value::Bool(b)) => b.to_string() == *wanted,
            _ => false,
        };
        if !hit {
            return false;
        }
    }
    true
}

fn to_record(device: &PacketDevice) -> Instance {
    let launched_at_utc = DateTime::parse_from_rfc3339(&device.created_at)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default();
    let availability_zone = device
        .facility
        .as_ref()
        .map(|f| f.code.clone())
        .unwrap_or_default();
    let public_ipv4 = device
        .ip_addresses
        .iter()
        .find(|ip| ip.public && ip.address_family == 4)
        .map(|ip| ip.address.clone())
        .unwrap_or_default();
    let mut tags: HashMap<String, String> = HashMap::new();
    for tag in &device.tags {
        match tag.split_once('=') {
            Some((k, v)) => tags.insert(k.to_string(), v.to_string()),
            None => tags.insert(tag.clone(), String::new()),
        };
    }

    Instance {
        provider: String::from("packet"),
        instance_id: device.id.clone(),
        launched_at_utc,
        state: device.state.clone(),
        availability_zone,
        public_hostname: device.hostname.clone(),
        public_ipv4,
        tags,
    }
}

#[derive(Debug, Serialize)]
struct CreateDeviceRequest {
    hostname: String,
    plan: String,
    facility: String,
    operating_system: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    userdata: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    spot_instance: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    spot_price_max: Option<f64>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Serialize)]
struct DeviceAction {
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct DevicesList {
    #[serde(default)]
    devices: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PacketDevice {
    id: String,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    facility: Option<PacketFacilityRef>,
    #[serde(default)]
    ip_addresses: Vec<PacketIpAddress>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PacketFacilityRef {
    #[serde(default)]
    code: String,
}

#[derive(Debug, Deserialize)]
struct PacketIpAddress {
    #[serde(default)]
    address: String,
    #[serde(default)]
    public: bool,
    #[serde(default)]
    address_family: i32,
}

#[derive(Debug, Serialize)]
struct CapacityRequest {
    servers: Vec<CapacityServerQuery>,
}

#[derive(Debug, Serialize)]
struct CapacityServerQuery {
    facility: String,
    plan: String,
    quantity: usize,
}

#[derive(Debug, Deserialize)]
struct CapacityResponse {
    #[serde(default)]
    servers: Vec<CapacityServerResult>,
}

#[derive(Debug, Deserialize)]
struct CapacityServerResult {
    #[serde(default)]
    available: bool,
}

#[derive(Debug, Serialize)]
struct CreateVolumeRequest {
    plan: String,
    size: u64,
    facility: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    description: String,
}

#[derive(Debug, Deserialize)]
struct PacketVolume {
    id: String,
}

#[derive(Debug, Serialize)]
struct AttachVolumeRequest {
    device_id: String,
}

#[derive(Debug, Deserialize)]
struct ProjectsList {
    #[serde(default)]
    projects: Vec<ProjectEntry>,
}

#[derive(Debug, Deserialize)]
struct ProjectEntry {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct PlansList {
    #[serde(default)]
    plans: Vec<PlanEntry>,
}

#[derive(Debug, Deserialize)]
struct PlanEntry {
    #[serde(default)]
    slug: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct FacilitiesList {
    #[serde(default)]
    facilities: Vec<FacilityEntry>,
}

#[derive(Debug, Deserialize)]
struct FacilityEntry {
    #[serde(default)]
    code: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct OperatingSystemsList {
    #[serde(default)]
    operating_systems: Vec<OperatingSystemEntry>,
}

#[derive(Debug, Deserialize)]
struct OperatingSystemEntry {
    #[serde(default)]
    slug: String,
    #[serde(default)]
    name: String,
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- packet::test_device_filtering --exact --show-output
#[test]
fn test_device_filtering() {
    let _ = env_logger::builder().is_test(true).try_init();

    let device = serde_json::json!({
        "id": "dev-1",
        "hostname": "fuzzer-1",
        "state": "active",
        "spot_instance": true,
        "tags": ["pool=fuzzer", "throwaway"]
    });

    let mut filters = HashMap::new();
    filters.insert(String::from("state"), String::from("active"));
    assert!(matches_filters(&device, &filters));

    filters.insert(String::from("tags"), String::from("pool=fuzzer"));
    assert!(matches_filters(&device, &filters));

    filters.insert(String::from("tags"), String::from("pool=other"));
    assert!(!matches_filters(&device, &filters));

    let mut by_bool = HashMap::new();
    by_bool.insert(String::from("spot_instance"), String::from("true"));
    assert!(matches_filters(&device, &by_bool));

    let mut missing = HashMap::new();
    missing.insert(String::from("no_such_field"), String::from("x"));
    assert!(!matches_filters(&device, &missing));

    assert!(matches_filters(&device, &HashMap::new()));
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- packet::test_device_hostnames --exact --show-output
#[test]
fn test_device_hostnames() {
    let _ = env_logger::builder().is_test(true).try_init();

    assert_eq!(device_hostnames(Some("crusher"), 1), vec!["crusher"]);
    assert_eq!(
        device_hostnames(Some("crusher"), 2),
        vec!["crusher-1", "crusher-2"]
    );

    let generated = device_hostnames(None, 1);
    assert!(generated[0].starts_with("hailstorm-"));
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- packet::test_device_record_from_api --exact --show-output
#[test]
fn test_device_record_from_api() {
    let _ = env_logger::builder().is_test(true).try_init();

    let device: PacketDevice = serde_json::from_str(
        r#"{
            "id": "b6e8c138-5ad9-4c05-a2cb-1e4d09f9ac11",
            "hostname": "crusher-1",
            "state": "provisioning",
            "created_at": "2023-08-01T19:30:00Z",
            "facility": {"code": "sjc1"},
            "ip_addresses": [
                {"address": "10.88.11.2", "public": false, "address_family": 4},
                {"address": "2604:1380::1", "public": true, "address_family": 6},
                {"address": "147.75.1.2", "public": true, "address_family": 4}
            ],
            "tags": ["pool=fuzzer", "throwaway"]
        }"#,
    )
    .unwrap();

    let rec = to_record(&device);
    assert_eq!(rec.provider, "packet");
    assert_eq!(rec.instance_id, "b6e8c138-5ad9-4c05-a2cb-1e4d09f9ac11");
    assert_eq!(rec.state, "provisioning");
    assert_eq!(rec.availability_zone, "sjc1");
    assert_eq!(rec.public_hostname, "crusher-1");
    assert_eq!(rec.public_ipv4, "147.75.1.2");
    assert_eq!(rec.tags.get("pool").unwrap(), "fuzzer");
    assert_eq!(rec.tags.get("throwaway").unwrap(), "");
    assert_eq!(rec.launched_at_utc.timestamp(), 1_690_918_200);
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- packet::test_packet_config --exact --show-output
#[test]
fn test_packet_config() {
    let _ = env_logger::builder().is_test(true).try_init();

    let single: PacketConfig = serde_json::from_str(
        r#"{"auth_token": "t0ken", "projects": {"fuzzing": "proj-id-1"}}"#,
    )
    .unwrap();
    assert!(single.validate().is_ok());
    assert_eq!(single.project_id().unwrap(), "proj-id-1");

    let named: PacketConfig = serde_json::from_str(
        r#"{"auth_token": "t0ken",
            "projects": {"fuzzing": "proj-id-1", "ci": "proj-id-2"},
            "project": "ci"}"#,
    )
    .unwrap();
    assert_eq!(named.project_id().unwrap(), "proj-id-2");

    let ambiguous: PacketConfig = serde_json::from_str(
        r#"{"auth_token": "t0ken",
            "projects": {"fuzzing": "proj-id-1", "ci": "proj-id-2"}}"#,
    )
    .unwrap();
    assert!(ambiguous.project_id().is_err());

    let no_token: PacketConfig =
        serde_json::from_str(r#"{"auth_token": "", "projects": {"fuzzing": "p"}}"#).unwrap();
    assert!(no_token.validate().is_err());

    let empty_ids: PacketConfig =
        serde_json::from_str(r#"{"auth_token": "t", "projects": {"fuzzing": ""}}"#).unwrap();
    assert!(empty_ids.validate().is_err());
}
