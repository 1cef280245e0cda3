use std::io::{self, stdout, Error, ErrorKind};

use clap::{Arg, ArgGroup, Command};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use hailstorm::gce::{self, GceConfig, GceImageDef};

use crate::lifecycle;

pub const NAME: &str = "gce";

#[derive(Debug, Clone)]
pub struct Flags {
    pub common: lifecycle::CommonFlags,

    pub config: String,
    pub start: bool,
    pub reboot: bool,
}

pub fn command() -> Command {
    Command::new(NAME)
        .about("Provisions fuzzing instances on Google Compute Engine")
        .args(lifecycle::common_args())
        .arg(
            Arg::new("CONFIG")
                .long("config")
                .help("Sets the GCE credential config JSON file path")
                .required(false)
                .num_args(1)
                .default_value("gce.json"),
        )
        .arg(
            Arg::new("START")
                .long("start")
                .help("Starts stopped matching instances")
                .required(false)
                .num_args(0),
        )
        .arg(
            Arg::new("REBOOT")
                .long("reboot")
                .help("Reboots running matching instances")
                .required(false)
                .num_args(0),
        )
        .group(ArgGroup::new("ACTION").args(
            lifecycle::ACTION_ARGS
                .iter()
                .copied()
                .chain(["START", "REBOOT"]),
        ))
}

pub async fn execute(opts: Flags) -> io::Result<()> {
    // ref. https://github.com/env-logger-rs/env_logger/issues/47
    env_logger::init_from_env(
        env_logger::Env::default()
            .filter_or(env_logger::DEFAULT_FILTER_ENV, &opts.common.log_level),
    );

    // start/reboot work off the live instance list, no image definition
    if opts.start || opts.reboot {
        let config = GceConfig::load(&opts.config)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;
        let mgr = gce::Manager::new(config);
        let only = hailstorm::parse_key_value_map(&opts.common.only)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;
        let found = mgr
            .find(&only)
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
        log::info!("found {} matching instance(s)", found.len());
        if opts.start {
            mgr.start(found)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
        } else {
            mgr.reboot(found)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
        }
        return Ok(());
    }

    let image_set = match lifecycle::prepare_images(&opts.common, "zone")? {
        Some(v) => v,
        None => return Ok(()),
    };
    let image_def: GceImageDef = image_set
        .extract(&opts.common.image_name)
        .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;

    let config = GceConfig::load(&opts.config)
        .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;
    let project = config.project.clone();
    let mgr = gce::Manager::new(config);

    execute!(
        stdout(),
        SetForegroundColor(Color::Blue),
        Print(format!(
            "\nLoaded image definition '{}' from '{}' (project '{}')\n",
            opts.common.image_name, opts.common.images, project
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

/// RUST_LOG=debug cargo test --package hailstormup --bin hailstormup -- gce::test_command --exact --show-output
#[test]
fn test_command() {
    let _ = env_logger::builder().is_test(true).try_init();

    let matches = command()
        .try_get_matches_from(vec![NAME, "--start", "--only", "labels=fuzzer"])
        .unwrap();
    assert!(matches.get_flag("START"));
    assert!(!matches.get_flag("REBOOT"));

    // provider actions join the shared exclusivity group
    let ret = command().try_get_matches_from(vec![NAME, "--start", "--create-on-demand"]);
    assert!(ret.is_err());
}
