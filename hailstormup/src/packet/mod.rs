use std::io::{self, stdout, Error, ErrorKind};

use clap::{Arg, ArgGroup, Command};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use hailstorm::packet::{self, PacketConfig, PacketImageDef};

use crate::lifecycle;

pub const NAME: &str = "packet";

#[derive(Debug, Clone)]
pub struct Flags {
    pub common: lifecycle::CommonFlags,

    pub config: String,
    pub reboot: bool,
    pub list_projects: bool,
    pub list_plans: bool,
    pub list_facilities: bool,
    pub list_operating_systems: bool,
    pub list_spot_prices: bool,
    pub create_volume: Option<String>,
    pub attach_volume: Option<String>,
}

pub fn command() -> Command {
    Command::new(NAME)
        .about("Provisions fuzzing devices on Packet bare metal")
        .args(lifecycle::common_args())
        .arg(
            Arg::new("CONFIG")
                .long("config")
                .help("Sets the Packet credential config JSON file path")
                .required(false)
                .num_args(1)
                .default_value("packet.json"),
        )
        .arg(
            Arg::new("REBOOT")
                .long("reboot")
                .help("Reboots matching devices")
                .required(false)
                .num_args(0),
        )
        .arg(
            Arg::new("LIST_PROJECTS")
                .long("list-projects")
                .help("Lists the projects reachable with the configured token")
                .required(false)
                .num_args(0),
        )
        .arg(
            Arg::new("LIST_PLANS")
                .long("list-plans")
                .help("Lists the available device plans")
                .required(false)
                .num_args(0),
        )
        .arg(
            Arg::new("LIST_FACILITIES")
                .long("list-facilities")
                .help("Lists the available facilities")
                .required(false)
                .num_args(0),
        )
        .arg(
            Arg::new("LIST_OPERATING_SYSTEMS")
                .long("list-operating-systems")
                .help("Lists the available operating systems")
                .required(false)
                .num_args(0),
        )
        .arg(
            Arg::new("LIST_SPOT_PRICES")
                .long("list-spot-prices")
                .help("Lists the current spot market prices")
                .required(false)
                .num_args(0),
        )
        .arg(
            Arg::new("CREATE_VOLUME")
                .long("create-volume")
                .help("Creates a storage volume ('plan,size,facility[,label]')")
                .required(false)
                .num_args(1),
        )
        .arg(
            Arg::new("ATTACH_VOLUME")
                .long("attach-volume")
                .help("Attaches a storage volume to a device ('volume-id,device-id')")
                .required(false)
                .num_args(1),
        )
        .group(ArgGroup::new("ACTION").args(
            lifecycle::ACTION_ARGS.iter().copied().chain([
                "REBOOT",
                "LIST_PROJECTS",
                "LIST_PLANS",
                "LIST_FACILITIES",
                "LIST_OPERATING_SYSTEMS",
                "LIST_SPOT_PRICES",
                "CREATE_VOLUME",
                "ATTACH_VOLUME",
            ]),
        ))
}

pub async fn execute(opts: Flags) -> io::Result<()> {
    // ref. https://github.com/env-logger-rs/env_logger/issues/47
    env_logger::init_from_env(
        env_logger::Env::default()
            .filter_or(env_logger::DEFAULT_FILTER_ENV, &opts.common.log_level),
    );

    // listings, volume plumbing and reboot only need the credential config
    if opts.reboot
        || opts.list_projects
        || opts.list_plans
        || opts.list_facilities
        || opts.list_operating_systems
        || opts.list_spot_prices
        || opts.create_volume.is_some()
        || opts.attach_volume.is_some()
    {
        let config = PacketConfig::load(&opts.config)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;
        let mgr = packet::Manager::new(config);
        return execute_provider_action(&mgr, &opts).await;
    }

    let image_set = match lifecycle::prepare_images(&opts.common, "facility")? {
        Some(v) => v,
        None => return Ok(()),
    };
    let image_def: PacketImageDef = image_set
        .extract(&opts.common.image_name)
        .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;

    let config = PacketConfig::load(&opts.config)
        .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;
    let mgr = packet::Manager::new(config);

    execute!(
        stdout(),
        SetForegroundColor(Color::Blue),
        Print(format!(
            "\nLoaded image definition '{}' from '{}'\n",
            opts.common.image_name, opts.common.images
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

async fn execute_provider_action(mgr: &packet::Manager, opts: &Flags) -> io::Result<()> {
    if opts.reboot {
        let only = hailstorm::parse_key_value_map(&opts.common.only)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;
        let found = mgr
            .find(&only)
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
        log::info!("rebooting {} matching device(s)", found.len());
        return mgr
            .reboot(found)
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e.message()));
    }

    if opts.list_projects {
        for (id, name) in mgr
            .list_projects()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e.message()))?
        {
            println!("{:<40} {}", id, name);
        }
        return Ok(());
    }

    if opts.list_plans {
        for (slug, name) in mgr
            .list_plans()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e.message()))?
        {
            println!("{:<24} {}", slug, name);
        }
        return Ok(());
    }

    if opts.list_facilities {
        for (code, name) in mgr
            .list_facilities()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e.message()))?
        {
            println!("{:<12} {}", code, name);
        }
        return Ok(());
    }

    if opts.list_operating_systems {
        for (slug, name) in mgr
            .list_operating_systems()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e.message()))?
        {
            println!("{:<32} {}", slug, name);
        }
        return Ok(());
    }

    if opts.list_spot_prices {
        let prices = mgr
            .list_spot_prices()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
        println!(
            "{}",
            serde_json::to_string_pretty(&prices)
                .map_err(|e| Error::new(ErrorKind::Other, format!("failed to render ({})", e)))?
        );
        return Ok(());
    }

    if let Some(spec) = &opts.create_volume {
        let (plan, size_gb, facility, label) = parse_volume_spec(spec)?;
        let label = label
            .unwrap_or_else(|| format!("hailstorm-{}", random_manager::string(8).to_lowercase()));
        let volume_id = mgr
            .create_volume(&plan, size_gb, &facility, &label)
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
        println!("{}", volume_id);
        return Ok(());
    }

    if let Some(spec) = &opts.attach_volume {
        let (volume_id, device_id) = spec.split_once(',').ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("--attach-volume takes 'volume-id,device-id', got '{}'", spec),
            )
        })?;
        return mgr
            .attach_volume(volume_id.trim(), device_id.trim())
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e.message()));
    }

    Ok(())
}

/// Parses the "plan,size,facility[,label]" value of --create-volume.
fn parse_volume_spec(spec: &str) -> io::Result<(String, u64, String, Option<String>)> {
    let parts: Vec<&str> = spec.split(',').map(|p| p.trim()).collect();
    if parts.len() < 3 || parts.len() > 4 {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!(
                "--create-volume takes 'plan,size,facility[,label]', got '{}'",
                spec
            ),
        ));
    }
    let size_gb = parts[1].parse::<u64>().map_err(|e| {
        Error::new(
            ErrorKind::InvalidInput,
            format!("invalid volume size '{}' ({})", parts[1], e),
        )
    })?;
    Ok((
        parts[0].to_string(),
        size_gb,
        parts[2].to_string(),
        parts.get(3).map(|s| s.to_string()),
    ))
}

/// RUST_LOG=debug cargo test --package hailstormup --bin hailstormup -- packet::test_parse_volume_spec --exact --show-output
#[test]
fn test_parse_volume_spec() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (plan, size_gb, facility, label) =
        parse_volume_spec("storage_1, 120, ewr1, corpus").unwrap();
    assert_eq!(plan, "storage_1");
    assert_eq!(size_gb, 120);
    assert_eq!(facility, "ewr1");
    assert_eq!(label, Some(String::from("corpus")));

    let (_, _, _, label) = parse_volume_spec("storage_1,120,ewr1").unwrap();
    assert_eq!(label, None);

    assert!(parse_volume_spec("storage_1,120").is_err());
    assert!(parse_volume_spec("storage_1,many,ewr1").is_err());
}

/// RUST_LOG=debug cargo test --package hailstormup --bin hailstormup -- packet::test_command --exact --show-output
#[test]
fn test_command() {
    let _ = env_logger::builder().is_test(true).try_init();

    let matches = command()
        .try_get_matches_from(vec![NAME, "--list-spot-prices"])
        .unwrap();
    assert!(matches.get_flag("LIST_SPOT_PRICES"));

    let ret = command().try_get_matches_from(vec![NAME, "--list-plans", "--status"]);
    assert!(ret.is_err());
}
