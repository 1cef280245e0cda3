//! Azure backend.
//!
//! Drives the Azure Resource Manager REST API with an OAuth2
//! client-credentials token. VMs are created through a template deployment
//! into the configured resource group, polled until the deployment settles,
//! then read back as instance records.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
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

const ARM_API_BASE: &str = "https://management.azure.com";
const LOGIN_API_BASE: &str = "https://login.microsoftonline.com";

const RESOURCE_API_VERSION: &str = "2021-04-01";
const COMPUTE_API_VERSION: &str = "2022-08-01";
const NETWORK_API_VERSION: &str = "2022-07-01";

/// Upper bound on one template deployment.
const DEPLOYMENT_TIMEOUT: Duration = Duration::from_secs(900);

/// Credential config loaded from the `--config` JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AzureConfig {
    pub subscription_id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub resource_group: String,
}

impl AzureConfig {
    pub fn load(file_path: &str) -> Result<Self> {
        info!("loading Azure config from '{}'", file_path);
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
        if self.subscription_id.is_empty()
            || self.tenant_id.is_empty()
            || self.client_id.is_empty()
            || self.client_secret.is_empty()
            || self.resource_group.is_empty()
        {
            return Err(Error::Other {
                message: String::from(
                    "Azure config requires 'subscription_id', 'tenant_id', 'client_id', \
                     'client_secret', and 'resource_group'",
                ),
                is_retryable: false,
            });
        }
        Ok(())
    }
}

/// Launch parameters for one logical Azure image definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AzureImageDef {
    pub location: String,
    pub vm_size: String,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    pub ssh_public_key: String,
    #[serde(default = "default_image_publisher")]
    pub image_publisher: String,
    #[serde(default = "default_image_offer")]
    pub image_offer: String,
    #[serde(default = "default_image_sku")]
    pub image_sku: String,
    #[serde(default = "default_image_version")]
    pub image_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_name_prefix: Option<String>,
    /// Bootstrap script, shipped base64-encoded as "customData".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

fn default_count() -> usize {
    1
}

fn default_admin_username() -> String {
    String::from("azureuser")
}

fn default_image_publisher() -> String {
    String::from("Canonical")
}

fn default_image_offer() -> String {
    String::from("0001-com-ubuntu-server-jammy")
}

fn default_image_sku() -> String {
    String::from("22_04-lts-gen2")
}

fn default_image_version() -> String {
    String::from("latest")
}

/// Implements Azure VM manager.
#[derive(Debug, Clone)]
pub struct Manager {
    config: AzureConfig,
    template: serde_json::Value,
    cli: reqwest::Client,
    token: String,
}

impl Manager {
    /// Fetches an ARM access token and returns a ready manager.
    pub async fn connect(config: AzureConfig, template: serde_json::Value) -> Result<Self> {
        let cli = reqwest::Client::new();
        let token = fetch_token(&cli, &config).await?;
        Ok(Self {
            config,
            template,
            cli,
            token,
        })
    }

    fn group_url(&self) -> String {
        format!(
            "{}/subscriptions/{}/resourcegroups/{}",
            ARM_API_BASE, self.config.subscription_id, self.config.resource_group
        )
    }

    fn vm_url(&self, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.Compute/virtualMachines/{}",
            self.group_url(),
            name
        )
    }

    /// Creates the configured resource group when it does not exist yet.
    /// The PUT is idempotent for an existing group in the same location.
    pub async fn ensure_resource_group(&self, location: &str) -> Result<()> {
        info!(
            "ensuring resource group '{}' in '{}'",
            self.config.resource_group, location
        );
        let resp = self
            .cli
            .put(self.group_url())
            .bearer_auth(&self.token)
            .query(&[("api-version", RESOURCE_API_VERSION)])
            .json(&serde_json::json!({ "location": location }))
            .send()
            .await
            .map_err(|e| http::request_error("resourceGroups.createOrUpdate", &e))?;
        http::expect_success("resourceGroups.createOrUpdate", resp).await
    }

    /// Tears down the whole resource group and everything in it.
    pub async fn delete_resource_group(&self) -> Result<()> {
        info!("deleting resource group '{}'", self.config.resource_group);
        let resp = self
            .cli
            .delete(self.group_url())
            .bearer_auth(&self.token)
            .query(&[("api-version", RESOURCE_API_VERSION)])
            .send()
            .await
            .map_err(|e| http::request_error("resourceGroups.delete", &e))?;
        http::expect_success("resourceGroups.delete", resp).await
    }

    /// Deploys "count" VMs through the template and returns their records
    /// once the deployment succeeds.
    pub async fn create(
        &self,
        image: &AzureImageDef,
        tags: &HashMap<String, String>,
        max_price: Option<f64>,
    ) -> Result<Vec<Instance>> {
        self.ensure_resource_group(&image.location).await?;

        let prefix = image
            .vm_name_prefix
            .clone()
            .unwrap_or_else(|| format!("hailstorm-{}", random_manager::string(8).to_lowercase()));
        let deployment = format!("{}-deploy", prefix);
        info!(
            "deploying {} VM(s) as '{}' into '{}'",
            image.count, deployment, self.config.resource_group
        );

        let body = serde_json::json!({
            "properties": {
                "mode": "Incremental",
                "template": self.template.clone(),
                "parameters": build_parameters(&prefix, image, tags, max_price),
            }
        });
        let url = format!(
            "{}/providers/Microsoft.Resources/deployments/{}",
            self.group_url(),
            deployment
        );
        let resp = self
            .cli
            .put(&url)
            .bearer_auth(&self.token)
            .query(&[("api-version", RESOURCE_API_VERSION)])
            .json(&body)
            .send()
            .await
            .map_err(|e| http::request_error("deployments.createOrUpdate", &e))?;
        http::expect_success("deployments.createOrUpdate", resp).await?;

        self.wait_for_deployment(&deployment).await?;

        let vms = self.list_vms().await?;
        Ok(vms
            .into_iter()
            .filter(|rec| rec.instance_id.starts_with(&prefix))
            .collect())
    }

    /// Polls the deployment until it settles, bounded by the deployment
    /// timeout.
    async fn wait_for_deployment(&self, deployment: &str) -> Result<()> {
        let url = format!(
            "{}/providers/Microsoft.Resources/deployments/{}",
            self.group_url(),
            deployment
        );
        let mut remaining = DEPLOYMENT_TIMEOUT;
        loop {
            let cli = self.cli.clone();
            let token = self.token.clone();
            let state = with_retries("deployments.get", RetryPolicy::default(), || {
                let cli = cli.clone();
                let token = token.clone();
                let url = url.clone();
                async move {
                    let resp = cli
                        .get(&url)
                        .bearer_auth(&token)
                        .query(&[("api-version", RESOURCE_API_VERSION)])
                        .send()
                        .await
                        .map_err(|e| http::request_error("deployments.get", &e))?;
                    http::read_json::<Deployment>("deployments.get", resp).await
                }
            })
            .await?;

            let provisioning = state.properties.provisioning_state;
            info!("deployment '{}' is {}", deployment, provisioning);
            match provisioning.as_str() {
                "Succeeded" => return Ok(()),
                "Failed" | "Canceled" => {
                    return Err(Error::API {
                        message: format!("deployment '{}' ended {}", deployment, provisioning),
                        is_retryable: false,
                    })
                }
                _ => {}
            }

            remaining = remaining.saturating_sub(DEFAULT_POLL_INTERVAL);
            if remaining.is_zero() {
                return Err(Error::API {
                    message: format!("deployment '{}' timed out", deployment),
                    is_retryable: false,
                });
            }
            sleep(DEFAULT_POLL_INTERVAL).await;
        }
    }

    /// Lists the VMs in the resource group with power state and public
    /// address resolved.
    async fn list_vms(&self) -> Result<Vec<Instance>> {
        let url = format!(
            "{}/providers/Microsoft.Compute/virtualMachines",
            self.group_url()
        );
        let cli = self.cli.clone();
        let token = self.token.clone();
        let listed = with_retries("virtualMachines.list", RetryPolicy::default(), || {
            let cli = cli.clone();
            let token = token.clone();
            let url = url.clone();
            async move {
                let resp = cli
                    .get(&url)
                    .bearer_auth(&token)
                    .query(&[("api-version", COMPUTE_API_VERSION)])
                    .send()
                    .await
                    .map_err(|e| http::request_error("virtualMachines.list", &e))?;
                http::read_json::<VmList>("virtualMachines.list", resp).await
            }
        })
        .await?;

        let addresses = self.public_ip_map().await?;
        let mut records: Vec<Instance> = Vec::new();
        for vm in &listed.value {
            let power_state = match self.instance_power_state(&vm.name).await {
                Ok(state) => state,
                Err(e) => {
                    warn!("failed to read instance view of '{}' ({})", vm.name, e.message());
                    String::from("unknown")
                }
            };
            records.push(to_record(vm, power_state, addresses.get(&vm.name)));
        }
        info!("found {} VM(s)", records.len());
        Ok(records)
    }

    async fn instance_power_state(&self, name: &str) -> Result<String> {
        let url = format!("{}/instanceView", self.vm_url(name));
        let resp = self
            .cli
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("api-version", COMPUTE_API_VERSION)])
            .send()
            .await
            .map_err(|e| http::request_error("virtualMachines.instanceView", &e))?;
        let view: InstanceView = http::read_json("virtualMachines.instanceView", resp).await?;
        Ok(power_state_from_statuses(&view.statuses))
    }

    /// Maps VM name to (ip, fqdn) through the "{vm}-ip" public address
    /// naming the template uses.
    async fn public_ip_map(&self) -> Result<HashMap<String, (String, String)>> {
        let url = format!(
            "{}/providers/Microsoft.Network/publicIPAddresses",
            self.group_url()
        );
        let resp = self
            .cli
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("api-version", NETWORK_API_VERSION)])
            .send()
            .await
            .map_err(|e| http::request_error("publicIPAddresses.list", &e))?;
        let listed: PublicIpList = http::read_json("publicIPAddresses.list", resp).await?;

        let mut addresses: HashMap<String, (String, String)> = HashMap::new();
        for pip in listed.value {
            if let Some(vm_name) = pip.name.strip_suffix("-ip") {
                let ip = pip.properties.ip_address.unwrap_or_default();
                let fqdn = pip
                    .properties
                    .dns_settings
                    .and_then(|d| d.fqdn)
                    .unwrap_or_default();
                addresses.insert(vm_name.to_string(), (ip, fqdn));
            }
        }
        Ok(addresses)
    }

    /// Powers off the "count" most recently created VMs.
    pub async fn stop(&self, instances: Vec<Instance>, count: usize) -> Result<()> {
        let selected = instance::newest(instances, count);
        if selected.is_empty() {
            warn!("no VMs to stop");
            return Ok(());
        }
        for rec in &selected {
            info!("powering off '{}'", rec.instance_id);
            let url = format!("{}/powerOff", self.vm_url(&rec.instance_id));
            let resp = self
                .cli
                .post(&url)
                .bearer_auth(&self.token)
                .query(&[("api-version", COMPUTE_API_VERSION)])
                .header(reqwest::header::CONTENT_LENGTH, 0)
                .send()
                .await
                .map_err(|e| http::request_error("virtualMachines.powerOff", &e))?;
            http::expect_success("virtualMachines.powerOff", resp).await?;
        }
        Ok(())
    }

    /// Deletes the "count" most recently created VMs. Auxiliary resources
    /// stay behind; whole-pool teardown goes through
    /// [`Manager::delete_resource_group`].
    pub async fn terminate(&self, instances: Vec<Instance>, count: usize) -> Result<()> {
        let selected = instance::newest(instances, count);
        if selected.is_empty() {
            warn!("no VMs to terminate");
            return Ok(());
        }
        for rec in &selected {
            info!("deleting '{}'", rec.instance_id);
            let resp = self
                .cli
                .delete(self.vm_url(&rec.instance_id))
                .bearer_auth(&self.token)
                .query(&[("api-version", COMPUTE_API_VERSION)])
                .send()
                .await
                .map_err(|e| http::request_error("virtualMachines.delete", &e))?;
            http::expect_success("virtualMachines.delete", resp).await?;
        }
        Ok(())
    }

    /// Lists VMs matching the tag criteria.
    pub async fn find(&self, filters: &HashMap<String, String>) -> Result<Vec<Instance>> {
        let vms = self.list_vms().await?;
        Ok(vms
            .into_iter()
            .filter(|rec| {
                filters
                    .iter()
                    .all(|(k, v)| rec.tags.get(k).map(|t| t == v).unwrap_or(false))
            })
            .collect())
    }
}

#[async_trait]
impl InstanceProvider for Manager {
    type Image = AzureImageDef;

    fn name(&self) -> &'static str {
        "azure"
    }

    async fn create_on_demand(
        &self,
        image: &AzureImageDef,
        tags: &HashMap<String, String>,
    ) -> Result<Vec<Instance>> {
        self.create(image, tags, None).await
    }

    async fn create_spot(
        &self,
        max_price: f64,
        image: &AzureImageDef,
        tags: &HashMap<String, String>,
        _timeout: Option<Duration>,
    ) -> Result<Vec<Instance>> {
        self.create(image, tags, Some(max_price)).await
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

async fn fetch_token(cli: &reqwest::Client, config: &AzureConfig) -> Result<String> {
    info!("requesting ARM access token for tenant '{}'", config.tenant_id);
    let url = format!("{}/{}/oauth2/token", LOGIN_API_BASE, config.tenant_id);
    let params = [
        ("grant_type", "client_credentials"),
        ("client_id", config.client_id.as_str()),
        ("client_secret", config.client_secret.as_str()),
        ("resource", "https://management.azure.com/"),
    ];
    let resp = cli
        .post(&url)
        .form(&params)
        .send()
        .await
        .map_err(|e| http::request_error("oauth2.token", &e))?;
    let token: TokenResponse = http::read_json("oauth2.token", resp).await?;
    Ok(token.access_token)
}

/// Builds the ARM deployment parameter object. Spot deployments carry the
/// max price and a Deallocate eviction policy; on-demand stays "Regular".
/// "maxPrice" travels as a string since ARM parameters have no float type;
/// the template converts it back with "json()".
fn build_parameters(
    prefix: &str,
    image: &AzureImageDef,
    tags: &HashMap<String, String>,
    max_price: Option<f64>,
) -> serde_json::Value {
    let custom_data = image
        .user_data
        .as_ref()
        .map(|ud| general_purpose::STANDARD.encode(ud))
        .unwrap_or_default();
    serde_json::json!({
        "vmNamePrefix": {"value": prefix},
        "vmCount": {"value": image.count},
        "vmSize": {"value": image.vm_size},
        "adminUsername": {"value": image.admin_username},
        "sshPublicKey": {"value": image.ssh_public_key},
        "imagePublisher": {"value": image.image_publisher},
        "imageOffer": {"value": image.image_offer},
        "imageSku": {"value": image.image_sku},
        "imageVersion": {"value": image.image_version},
        "customData": {"value": custom_data},
        "instanceTags": {"value": tags},
        "priority": {"value": if max_price.is_some() { "Spot" } else { "Regular" }},
        "maxPrice": {"value": max_price.map_or_else(|| String::from("-1"), |p| p.to_string())},
        "evictionPolicy": {"value": "Deallocate"},
    })
}

fn power_state_from_statuses(statuses: &[InstanceViewStatus]) -> String {
    statuses
        .iter()
        .filter_map(|s| s.code.strip_prefix("PowerState/"))
        .last()
        .unwrap_or("unknown")
        .to_string()
}

fn to_record(vm: &AzureVm, power_state: String, address: Option<&(String, String)>) -> Instance {
    let launched_at_utc = vm
        .properties
        .time_created
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default();
    let (public_ipv4, public_hostname) = match address {
        Some((ip, fqdn)) => (ip.clone(), fqdn.clone()),
        None => (String::new(), String::new()),
    };

    Instance {
        provider: String::from("azure"),
        instance_id: vm.name.clone(),
        launched_at_utc,
        state: power_state,
        availability_zone: vm.location.clone(),
        public_hostname,
        public_ipv4,
        tags: vm.tags.clone(),
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Deployment {
    #[serde(default)]
    properties: DeploymentProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentProperties {
    #[serde(default)]
    provisioning_state: String,
}

#[derive(Debug, Deserialize)]
struct VmList {
    #[serde(default)]
    value: Vec<AzureVm>,
}

#[derive(Debug, Deserialize)]
struct AzureVm {
    name: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    properties: AzureVmProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureVmProperties {
    #[serde(default)]
    time_created: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceView {
    #[serde(default)]
    statuses: Vec<InstanceViewStatus>,
}

#[derive(Debug, Deserialize)]
struct InstanceViewStatus {
    #[serde(default)]
    code: String,
}

#[derive(Debug, Deserialize)]
struct PublicIpList {
    #[serde(default)]
    value: Vec<PublicIp>,
}

#[derive(Debug, Deserialize)]
struct PublicIp {
    name: String,
    #[serde(default)]
    properties: PublicIpProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicIpProperties {
    #[serde(default)]
    ip_address: Option<String>,
    #[serde(default)]
    dns_settings: Option<DnsSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct DnsSettings {
    #[serde(default)]
    fqdn: Option<String>,
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- azure::test_build_parameters --exact --show-output
#[test]
fn test_build_parameters() {
    let _ = env_logger::builder().is_test(true).try_init();

    let image: AzureImageDef = serde_json::from_str(
        r##"{"location": "eastus", "vm_size": "Standard_D2s_v3", "count": 2,
            "ssh_public_key": "ssh-ed25519 AAAA...", "user_data": "#!/bin/sh"}"##,
    )
    .unwrap();
    let mut tags = HashMap::new();
    tags.insert(String::from("pool"), String::from("fuzzer"));

    let regular = build_parameters("storm", &image, &tags, None);
    assert_eq!(regular["priority"]["value"], "Regular");
    assert_eq!(regular["maxPrice"]["value"], "-1");
    assert_eq!(regular["vmCount"]["value"], 2);
    assert_eq!(regular["adminUsername"]["value"], "azureuser");
    assert_eq!(regular["instanceTags"]["value"]["pool"], "fuzzer");
    assert_eq!(regular["customData"]["value"], "IyEvYmluL3No");

    let spot = build_parameters("storm", &image, &tags, Some(0.08));
    assert_eq!(spot["priority"]["value"], "Spot");
    assert_eq!(spot["maxPrice"]["value"], "0.08");
    assert_eq!(spot["evictionPolicy"]["value"], "Deallocate");
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- azure::test_power_state_from_statuses --exact --show-output
#[test]
fn test_power_state_from_statuses() {
    let _ = env_logger::builder().is_test(true).try_init();

    let statuses = vec![
        InstanceViewStatus {
            code: String::from("ProvisioningState/succeeded"),
        },
        InstanceViewStatus {
            code: String::from("PowerState/running"),
        },
    ];
    assert_eq!(power_state_from_statuses(&statuses), "running");
    assert_eq!(power_state_from_statuses(&[]), "unknown");
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- azure::test_vm_record_from_api --exact --show-output
#[test]
fn test_vm_record_from_api() {
    let _ = env_logger::builder().is_test(true).try_init();

    let vm: AzureVm = serde_json::from_str(
        r#"{
            "name": "storm-1",
            "location": "eastus",
            "tags": {"pool": "fuzzer"},
            "properties": {"timeCreated": "2023-08-01T19:30:00Z"}
        }"#,
    )
    .unwrap();

    let address = (String::from("20.42.1.9"), String::from("storm-1.eastus.cloudapp.azure.com"));
    let rec = to_record(&vm, String::from("running"), Some(&address));
    assert_eq!(rec.provider, "azure");
    assert_eq!(rec.instance_id, "storm-1");
    assert_eq!(rec.state, "running");
    assert_eq!(rec.availability_zone, "eastus");
    assert_eq!(rec.public_ipv4, "20.42.1.9");
    assert_eq!(rec.public_hostname, "storm-1.eastus.cloudapp.azure.com");
    assert_eq!(rec.launched_at_utc.timestamp(), 1_690_918_200);
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- azure::test_azure_config_validate --exact --show-output
#[test]
fn test_azure_config_validate() {
    let _ = env_logger::builder().is_test(true).try_init();

    let ok: AzureConfig = serde_json::from_str(
        r#"{"subscription_id": "sub", "tenant_id": "ten", "client_id": "cid",
            "client_secret": "sec", "resource_group": "fuzzing"}"#,
    )
    .unwrap();
    assert!(ok.validate().is_ok());

    let missing: AzureConfig = serde_json::from_str(
        r#"{"subscription_id": "sub", "tenant_id": "", "client_id": "cid",
            "client_secret": "sec", "resource_group": "fuzzing"}"#,
    )
    .unwrap();
    assert!(missing.validate().is_err());
}
