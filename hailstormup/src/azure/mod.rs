use std::{
    fs,
    io::{self, stdout, Error, ErrorKind},
};

use clap::{Arg, ArgGroup, Command};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use hailstorm::azure::{self, AzureConfig, AzureImageDef};
use rust_embed::RustEmbed;

use crate::lifecycle;

pub const NAME: &str = "azure";

#[derive(Debug, Clone)]
pub struct Flags {
    pub common: lifecycle::CommonFlags,

    pub config: String,
    pub template: Option<String>,
    pub group_name: Option<String>,
    pub delete_group: bool,
}

pub fn command() -> Command {
    Command::new(NAME)
        .about("Provisions fuzzing instances on Azure")
        .args(lifecycle::common_args())
        .arg(
            Arg::new("CONFIG")
                .long("config")
                .help("Sets the Azure credential config JSON file path")
                .required(false)
                .num_args(1)
                .default_value("azure.json"),
        )
        .arg(
            Arg::new("TEMPLATE")
                .long("template")
                .help("Sets the ARM deployment template JSON file path (embedded default otherwise)")
                .required(false)
                .num_args(1),
        )
        .arg(
            Arg::new("GROUP_NAME")
                .long("group-name")
                .help("Overrides the resource group from the credential config")
                .required(false)
                .num_args(1),
        )
        .arg(
            Arg::new("DELETE_GROUP")
                .long("delete-group")
                .help("Deletes the whole resource group and everything in it")
                .required(false)
                .num_args(0),
        )
        .group(
            ArgGroup::new("ACTION").args(
                lifecycle::ACTION_ARGS
                    .iter()
                    .copied()
                    .chain(["DELETE_GROUP"]),
            ),
        )
}

pub async fn execute(opts: Flags) -> io::Result<()> {
    // ref. https://github.com/env-logger-rs/env_logger/issues/47
    env_logger::init_from_env(
        env_logger::Env::default()
            .filter_or(env_logger::DEFAULT_FILTER_ENV, &opts.common.log_level),
    );

    if opts.delete_group {
        let config = load_config(&opts)?;
        execute!(
            stdout(),
            SetForegroundColor(Color::Red),
            Print(format!(
                "\nDeleting resource group '{}' and everything in it\n",
                config.resource_group
            )),
            ResetColor
        )?;
        if !lifecycle::confirm(
            &format!("delete resource group '{}'", config.resource_group),
            opts.common.skip_prompt,
        ) {
            return Ok(());
        }
        // teardown does not deploy; the template goes unused
        let mgr = azure::Manager::connect(config, serde_json::Value::Null)
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
        return mgr
            .delete_resource_group()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e.message()));
    }

    let image_set = match lifecycle::prepare_images(&opts.common, "location")? {
        Some(v) => v,
        None => return Ok(()),
    };
    let image_def: AzureImageDef = image_set
        .extract(&opts.common.image_name)
        .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;

    let template_text = match &opts.template {
        Some(path) => {
            log::info!("loading ARM template from '{}'", path);
            fs::read_to_string(path)?
        }
        None => default_arm_template()?,
    };
    let template: serde_json::Value = serde_json::from_str(&template_text).map_err(|e| {
        Error::new(
            ErrorKind::InvalidInput,
            format!("failed to parse ARM template ({})", e),
        )
    })?;

    let config = load_config(&opts)?;
    let resource_group = config.resource_group.clone();
    let mgr = azure::Manager::connect(config, template)
        .await
        .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;

    execute!(
        stdout(),
        SetForegroundColor(Color::Blue),
        Print(format!(
            "\nLoaded image definition '{}' from '{}' (resource group '{}')\n",
            opts.common.image_name, opts.common.images, resource_group
        )),
        ResetColor
    )?;

    lifecycle::drive(
        &mgr,
        &image_def,
        &opts.common,
        lifecycle::pick_action(&opts.common),
    )
    .await?;

    Ok(())
}

fn load_config(opts: &Flags) -> io::Result<AzureConfig> {
    let mut config = AzureConfig::load(&opts.config)
        .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;
    if let Some(group) = &opts.group_name {
        config.resource_group = group.clone();
    }
    Ok(config)
}

fn default_arm_template() -> io::Result<String> {
    #[derive(RustEmbed)]
    #[folder = "src/azure/arm-templates/"]
    #[prefix = "src/azure/arm-templates/"]
    struct Asset;
    let f = Asset::get("src/azure/arm-templates/vm.json").unwrap();
    let s = std::str::from_utf8(f.data.as_ref()).map_err(|e| {
        Error::new(
            ErrorKind::InvalidInput,
            format!("failed to convert embed file to str {}", e),
        )
    })?;
    Ok(s.to_string())
}

/// RUST_LOG=debug cargo test --package hailstormup --bin hailstormup -- azure::test_default_arm_template --exact --show-output
#[test]
fn test_default_arm_template() {
    let _ = env_logger::builder().is_test(true).try_init();

    let text = default_arm_template().unwrap();
    let template: serde_json::Value = serde_json::from_str(&text).unwrap();

    // every deployment parameter the manager sends must be declared
    for name in [
        "vmNamePrefix",
        "vmCount",
        "vmSize",
        "adminUsername",
        "sshPublicKey",
        "imagePublisher",
        "imageOffer",
        "imageSku",
        "imageVersion",
        "customData",
        "instanceTags",
        "priority",
        "maxPrice",
        "evictionPolicy",
    ] {
        assert!(
            template["parameters"].get(name).is_some(),
            "template is missing parameter '{}'",
            name
        );
    }

    // the manager pairs VMs with their addresses by the '-ip' suffix
    let resources = template["resources"].as_array().unwrap();
    let ip = resources
        .iter()
        .find(|r| r["type"] == "Microsoft.Network/publicIPAddresses")
        .unwrap();
    assert!(ip["name"].as_str().unwrap().contains("-ip"));
}

/// RUST_LOG=debug cargo test --package hailstormup --bin hailstormup -- azure::test_command --exact --show-output
#[test]
fn test_command() {
    let _ = env_logger::builder().is_test(true).try_init();

    let matches = command()
        .try_get_matches_from(vec![NAME, "--delete-group", "--group-name", "storm-eu"])
        .unwrap();
    assert!(matches.get_flag("DELETE_GROUP"));
    assert_eq!(
        matches.get_one::<String>("GROUP_NAME").map(String::as_str),
        Some("storm-eu")
    );

    let ret = command().try_get_matches_from(vec![NAME, "--delete-group", "--create-spot"]);
    assert!(ret.is_err());
}
