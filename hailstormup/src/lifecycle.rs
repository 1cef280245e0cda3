//! Shared provisioning flow for the provider subcommands.
//!
//! Every provider goes through the same steps: load the image definitions,
//! preprocess the UserData script, apply field overrides, then dispatch
//! exactly one action through the [`InstanceProvider`] trait. Provider-only
//! actions (GCE start/reboot, Packet listings, Azure group teardown) are
//! handled in the subcommand modules around this driver.

use std::{
    fs,
    io::{self, stdout, Error, ErrorKind},
    path::Path,
};

use clap::{value_parser, Arg, ArgAction, ArgMatches};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use dialoguer::{theme::ColorfulTheme, Select};
use hailstorm::{instance::Instance, provider::InstanceProvider, ssh, userdata, ImageSet, Settings};

/// Argument ids that select an action; each subcommand puts them (plus its
/// provider-only extras) into one clap group so they stay mutually exclusive.
pub const ACTION_ARGS: &[&str] = &[
    "CREATE_ON_DEMAND",
    "CREATE_SPOT",
    "STOP",
    "TERMINATE",
    "STATUS",
    "RUN",
    "LIST_USERDATA_MACROS",
    "PRINT_USERDATA",
];

#[derive(Debug, Clone)]
pub struct CommonFlags {
    pub log_level: String,
    pub skip_prompt: bool,

    pub images: String,
    pub image_name: String,
    pub image_args: Vec<String>,

    pub userdata: Option<String>,
    pub userdata_macros: Vec<String>,
    pub list_userdata_macros: bool,
    pub print_userdata: bool,

    pub tags: Vec<String>,
    pub only: Vec<String>,
    pub settings: Option<String>,
    pub zone: Option<String>,

    pub create_on_demand: bool,
    pub create_spot: bool,
    pub max_spot_price: f64,
    pub stop: Option<usize>,
    pub terminate: Option<usize>,
    pub status: bool,
    pub run: Option<String>,
}

/// Flags shared by every provider subcommand.
pub fn common_args() -> Vec<Arg> {
    vec![
        Arg::new("LOG_LEVEL")
            .long("log-level")
            .short('l')
            .help("Sets the log level")
            .required(false)
            .num_args(1)
            .value_parser(["debug", "info"])
            .default_value("info"),
        Arg::new("IMAGES")
            .long("images")
            .help("Sets the image definitions JSON file path")
            .required(false)
            .num_args(1)
            .default_value("images.json"),
        Arg::new("IMAGE_NAME")
            .long("image-name")
            .help("Sets the name of the image definition to use")
            .required(false)
            .num_args(1)
            .default_value("default"),
        Arg::new("IMAGE_ARGS")
            .long("image-args")
            .help("Overrides a field of the image definition (KEY=VALUE, repeatable)")
            .required(false)
            .action(ArgAction::Append)
            .num_args(1),
        Arg::new("USERDATA")
            .long("userdata")
            .help("Sets the UserData script file path for instance bootstrap")
            .required(false)
            .num_args(1),
        Arg::new("USERDATA_MACROS")
            .long("userdata-macros")
            .help("Sets a UserData macro value (KEY=VALUE, repeatable)")
            .required(false)
            .action(ArgAction::Append)
            .num_args(1),
        Arg::new("LIST_USERDATA_MACROS")
            .long("list-userdata-macros")
            .help("Lists the macro names found in the UserData script, then exits")
            .required(false)
            .num_args(0),
        Arg::new("PRINT_USERDATA")
            .long("print-userdata")
            .help("Prints the preprocessed UserData script, then exits")
            .required(false)
            .num_args(0),
        Arg::new("TAGS")
            .long("tags")
            .help("Tags created instances (KEY=VALUE, repeatable)")
            .required(false)
            .action(ArgAction::Append)
            .num_args(1),
        Arg::new("ONLY")
            .long("only")
            .help("Filters instances for stop/terminate/status/run (KEY=VALUE, repeatable)")
            .required(false)
            .action(ArgAction::Append)
            .num_args(1),
        Arg::new("SETTINGS")
            .long("settings")
            .help("Sets the settings JSON file path (SSH identity for --run)")
            .required(false)
            .num_args(1),
        Arg::new("ZONE")
            .long("zone")
            .help("Overrides the placement zone of the selected image definition")
            .required(false)
            .num_args(1),
        Arg::new("CREATE_ON_DEMAND")
            .long("create-on-demand")
            .help("Creates on-demand instances from the selected image definition")
            .required(false)
            .num_args(0),
        Arg::new("CREATE_SPOT")
            .long("create-spot")
            .help("Bids for spot/preemptible instances from the selected image definition")
            .required(false)
            .num_args(0),
        Arg::new("MAX_SPOT_PRICE")
            .long("max-spot-price")
            .help("Sets the maximum hourly price for spot bids")
            .required(false)
            .num_args(1)
            .value_parser(value_parser!(f64))
            .default_value("0.05"),
        Arg::new("STOP")
            .long("stop")
            .help("Stops the N most recently launched matching instances (0 stops all)")
            .required(false)
            .num_args(0..=1)
            .value_parser(value_parser!(usize))
            .default_missing_value("0"),
        Arg::new("TERMINATE")
            .long("terminate")
            .help("Terminates the N most recently launched matching instances (0 terminates all)")
            .required(false)
            .num_args(0..=1)
            .value_parser(value_parser!(usize))
            .default_missing_value("0"),
        Arg::new("STATUS")
            .long("status")
            .help("Lists matching instances with their state and address")
            .required(false)
            .num_args(0),
        Arg::new("RUN")
            .long("run")
            .help("Runs a command over SSH on every matching instance")
            .required(false)
            .num_args(1),
        Arg::new("SKIP_PROMPT")
            .long("skip-prompt")
            .short('s')
            .help("Skips the prompt mode")
            .required(false)
            .num_args(0),
    ]
}

pub fn common_flags(sub_matches: &ArgMatches) -> CommonFlags {
    CommonFlags {
        log_level: sub_matches
            .get_one::<String>("LOG_LEVEL")
            .unwrap_or(&String::from("info"))
            .clone(),
        skip_prompt: sub_matches.get_flag("SKIP_PROMPT"),

        images: sub_matches
            .get_one::<String>("IMAGES")
            .unwrap_or(&String::from("images.json"))
            .clone(),
        image_name: sub_matches
            .get_one::<String>("IMAGE_NAME")
            .unwrap_or(&String::from("default"))
            .clone(),
        image_args: string_values(sub_matches, "IMAGE_ARGS"),

        userdata: sub_matches.get_one::<String>("USERDATA").cloned(),
        userdata_macros: string_values(sub_matches, "USERDATA_MACROS"),
        list_userdata_macros: sub_matches.get_flag("LIST_USERDATA_MACROS"),
        print_userdata: sub_matches.get_flag("PRINT_USERDATA"),

        tags: string_values(sub_matches, "TAGS"),
        only: string_values(sub_matches, "ONLY"),
        settings: sub_matches.get_one::<String>("SETTINGS").cloned(),
        zone: sub_matches.get_one::<String>("ZONE").cloned(),

        create_on_demand: sub_matches.get_flag("CREATE_ON_DEMAND"),
        create_spot: sub_matches.get_flag("CREATE_SPOT"),
        max_spot_price: *sub_matches.get_one::<f64>("MAX_SPOT_PRICE").unwrap_or(&0.05),
        stop: sub_matches.get_one::<usize>("STOP").copied(),
        terminate: sub_matches.get_one::<usize>("TERMINATE").copied(),
        status: sub_matches.get_flag("STATUS"),
        run: sub_matches.get_one::<String>("RUN").cloned(),
    }
}

fn string_values(sub_matches: &ArgMatches, id: &str) -> Vec<String> {
    sub_matches
        .get_many::<String>(id)
        .unwrap_or_default()
        .cloned()
        .collect()
}

#[derive(Debug)]
pub enum Action {
    CreateOnDemand,
    CreateSpot,
    Stop(usize),
    Terminate(usize),
    Status,
    Run(String),
    None,
}

/// Resolves the requested action; flags are screened in the original order
/// so the first one set wins (the clap group keeps them exclusive anyway).
pub fn pick_action(opts: &CommonFlags) -> Action {
    if opts.create_on_demand {
        Action::CreateOnDemand
    } else if opts.create_spot {
        Action::CreateSpot
    } else if let Some(count) = opts.stop {
        Action::Stop(count)
    } else if let Some(count) = opts.terminate {
        Action::Terminate(count)
    } else if opts.status {
        Action::Status
    } else if let Some(command) = &opts.run {
        Action::Run(command.clone())
    } else {
        Action::None
    }
}

/// Loads the image definitions and runs the UserData preprocessing steps in
/// order: read script, list macros (early exit), resolve imports, substitute
/// macros, print result (early exit), then write the blob plus any field
/// overrides into the selected definition. Returns "None" when an
/// informational flag already completed the run.
pub fn prepare_images(opts: &CommonFlags, zone_field: &str) -> io::Result<Option<ImageSet>> {
    log::info!(
        "using image definition '{}' from '{}'",
        opts.image_name,
        opts.images
    );
    let mut image_set = ImageSet::load(&opts.images).map_err(|e| {
        Error::new(
            ErrorKind::Other,
            format!("failed to load image definitions ({})", e.message()),
        )
    })?;

    let mut user_data = String::new();
    if let Some(path) = &opts.userdata {
        log::info!("reading UserData script '{}'", path);
        user_data = fs::read_to_string(path)?;
    }

    if opts.list_userdata_macros {
        for name in userdata::list_macro_names(&user_data) {
            println!("@{}@", name);
        }
        return Ok(None);
    }

    if let Some(path) = &opts.userdata {
        let base_dir = Path::new(path).parent().unwrap_or_else(|| Path::new("."));
        user_data = userdata::resolve_imports(&user_data, base_dir).map_err(|e| {
            Error::new(
                ErrorKind::Other,
                format!("failed to resolve UserData imports ({})", e),
            )
        })?;

        let macros = hailstorm::parse_key_value_pairs(&opts.userdata_macros)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;
        user_data = userdata::substitute_macros(&user_data, &macros).map_err(|e| {
            Error::new(
                ErrorKind::Other,
                format!("failed to substitute UserData macros ({})", e),
            )
        })?;
    }

    if opts.print_userdata {
        println!("{}", user_data);
        return Ok(None);
    }

    if opts.userdata.is_some() {
        if user_data.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "preprocessed UserData script is empty",
            ));
        }
        image_set
            .set_user_data(&opts.image_name, &user_data)
            .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
    }

    if !opts.image_args.is_empty() {
        let overrides = hailstorm::parse_key_value_pairs(&opts.image_args)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;
        log::info!("overriding image definition fields {:?}", overrides);
        image_set
            .apply_args(&opts.image_name, &overrides)
            .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
    }

    if let Some(zone) = &opts.zone {
        log::info!("placing instances in '{}'", zone);
        image_set
            .set_field(
                &opts.image_name,
                zone_field,
                serde_json::Value::String(zone.clone()),
            )
            .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
    }

    Ok(Some(image_set))
}

/// Dispatches the selected action through the provider trait.
pub async fn drive<P>(
    provider: &P,
    image: &P::Image,
    opts: &CommonFlags,
    action: Action,
) -> io::Result<()>
where
    P: InstanceProvider,
{
    let tags = hailstorm::parse_key_value_map(&opts.tags)
        .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;
    let only = hailstorm::parse_key_value_map(&opts.only)
        .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;

    match action {
        Action::CreateOnDemand => {
            if !confirm(
                &format!("create on-demand instances on '{}'", provider.name()),
                opts.skip_prompt,
            ) {
                return Ok(());
            }
            let created = provider
                .create_on_demand(image, &tags)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
            print_created(&created)?;
        }

        Action::CreateSpot => {
            if !confirm(
                &format!("create spot instances on '{}'", provider.name()),
                opts.skip_prompt,
            ) {
                return Ok(());
            }
            let created = provider
                .create_spot(opts.max_spot_price, image, &tags, None)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
            print_created(&created)?;
        }

        Action::Stop(count) => {
            let found = provider
                .find(&only)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
            log::info!("found {} matching instance(s)", found.len());
            provider
                .stop(found, count)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
        }

        Action::Terminate(count) => {
            let found = provider
                .find(&only)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
            execute!(
                stdout(),
                SetForegroundColor(Color::Red),
                Print(format!(
                    "\nTerminating {} of {} matching instance(s) on '{}'\n",
                    if count == 0 {
                        found.len()
                    } else {
                        count.min(found.len())
                    },
                    found.len(),
                    provider.name()
                )),
                ResetColor
            )?;
            if !confirm("let's terminate them", opts.skip_prompt) {
                return Ok(());
            }
            provider
                .terminate(found, count)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
        }

        Action::Status => {
            let found = provider
                .find(&only)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
            for inst in found.iter() {
                log::info!(
                    "'{}' is {} at '{}' (tags {:?})",
                    inst.instance_id,
                    inst.state,
                    inst.public_ipv4,
                    inst.tags
                );
            }
        }

        Action::Run(command) => {
            let settings_path = opts.settings.clone().ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidInput,
                    "--run requires --settings with an 'ssh' section",
                )
            })?;
            let settings = Settings::load(&settings_path)
                .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
            let ssh_settings = settings
                .ssh()
                .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;
            let found = provider
                .find(&only)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
            log::info!("running '{}' on {} instance(s)", command, found.len());
            ssh::run_command(ssh_settings, &found, &command)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
        }

        Action::None => {
            log::warn!("no action requested");
        }
    }

    Ok(())
}

/// Interactive yes/no gate shown before resource-changing actions.
pub fn confirm(question: &str, skip_prompt: bool) -> bool {
    if skip_prompt {
        log::info!("skipping prompt ({})", question);
        return true;
    }
    let options = vec![String::from("No, not yet."), format!("Yes, {}.", question)];
    let selected = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select your option")
        .items(&options[..])
        .default(0)
        .interact()
        .unwrap();
    selected == 1
}

pub fn print_created(instances: &[Instance]) -> io::Result<()> {
    execute!(
        stdout(),
        SetForegroundColor(Color::Green),
        Print(format!("\ncreated {} instance(s)\n", instances.len())),
        ResetColor
    )?;
    for inst in instances.iter() {
        println!(
            "{}\t{}\t{}\t{}",
            inst.instance_id, inst.state, inst.public_ipv4, inst.availability_zone
        );
    }
    Ok(())
}

#[cfg(test)]
fn test_flags() -> CommonFlags {
    CommonFlags {
        log_level: String::from("info"),
        skip_prompt: true,
        images: String::from("images.json"),
        image_name: String::from("default"),
        image_args: Vec::new(),
        userdata: None,
        userdata_macros: Vec::new(),
        list_userdata_macros: false,
        print_userdata: false,
        tags: Vec::new(),
        only: Vec::new(),
        settings: None,
        zone: None,
        create_on_demand: false,
        create_spot: false,
        max_spot_price: 0.05,
        stop: None,
        terminate: None,
        status: false,
        run: None,
    }
}

/// RUST_LOG=debug cargo test --package hailstormup --bin hailstormup -- lifecycle::test_pick_action --exact --show-output
#[test]
fn test_pick_action() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut opts = test_flags();
    assert!(matches!(pick_action(&opts), Action::None));

    opts.status = true;
    assert!(matches!(pick_action(&opts), Action::Status));

    // earlier flags in the original order win
    opts.terminate = Some(2);
    assert!(matches!(pick_action(&opts), Action::Terminate(2)));
    opts.stop = Some(0);
    assert!(matches!(pick_action(&opts), Action::Stop(0)));
    opts.create_spot = true;
    assert!(matches!(pick_action(&opts), Action::CreateSpot));
    opts.create_on_demand = true;
    assert!(matches!(pick_action(&opts), Action::CreateOnDemand));

    let mut run_only = test_flags();
    run_only.run = Some(String::from("uname -a"));
    assert!(matches!(pick_action(&run_only), Action::Run(_)));
}

/// RUST_LOG=debug cargo test --package hailstormup --bin hailstormup -- lifecycle::test_optional_count_flags --exact --show-output
#[test]
fn test_optional_count_flags() {
    let _ = env_logger::builder().is_test(true).try_init();

    let cmd = clap::Command::new("test").args(common_args());

    let matches = cmd
        .clone()
        .try_get_matches_from(vec!["test", "--terminate"])
        .unwrap();
    let opts = common_flags(&matches);
    assert_eq!(opts.terminate, Some(0));
    assert_eq!(opts.stop, None);

    let matches = cmd
        .clone()
        .try_get_matches_from(vec!["test", "--stop", "3"])
        .unwrap();
    let opts = common_flags(&matches);
    assert_eq!(opts.stop, Some(3));

    let matches = cmd
        .try_get_matches_from(vec![
            "test",
            "--tags",
            "pool=fuzzer",
            "--tags",
            "owner=me",
            "--max-spot-price",
            "0.1",
        ])
        .unwrap();
    let opts = common_flags(&matches);
    assert_eq!(opts.tags, vec!["pool=fuzzer", "owner=me"]);
    assert!((opts.max_spot_price - 0.1).abs() < f64::EPSILON);
}

/// RUST_LOG=debug cargo test --package hailstormup --bin hailstormup -- lifecycle::test_prepare_images --exact --show-output
#[test]
fn test_prepare_images() {
    use std::io::Write;

    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let images_path = dir.path().join("images.json");
    let mut f = std::fs::File::create(&images_path).unwrap();
    f.write_all(br#"{"default": {"instance_type": "t2.small"}}"#)
        .unwrap();

    let userdata_path = dir.path().join("boot.sh");
    let mut f = std::fs::File::create(&userdata_path).unwrap();
    f.write_all(b"setup @import(extra.sh)@ run @CMD@").unwrap();
    let mut f = std::fs::File::create(dir.path().join("extra.sh")).unwrap();
    f.write_all(b"PAYLOAD").unwrap();

    let mut opts = test_flags();
    opts.images = images_path.display().to_string();
    opts.userdata = Some(userdata_path.display().to_string());
    opts.userdata_macros = vec![String::from("CMD=./fuzz")];
    opts.zone = Some(String::from("us-west-2b"));

    let image_set = prepare_images(&opts, "placement").unwrap().unwrap();
    let def: serde_json::Value = image_set.extract("default").unwrap();
    assert_eq!(def["instance_type"], "t2.small");
    assert_eq!(def["user_data"], "setup PAYLOAD run ./fuzz");
    assert_eq!(def["placement"], "us-west-2b");
}

/// RUST_LOG=debug cargo test --package hailstormup --bin hailstormup -- lifecycle::test_prepare_images_early_exit --exact --show-output
#[test]
fn test_prepare_images_early_exit() {
    use std::io::Write;

    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let images_path = dir.path().join("images.json");
    let mut f = std::fs::File::create(&images_path).unwrap();
    f.write_all(br#"{"default": {}}"#).unwrap();

    let userdata_path = dir.path().join("boot.sh");
    let mut f = std::fs::File::create(&userdata_path).unwrap();
    f.write_all(b"run @CMD@").unwrap();

    let mut opts = test_flags();
    opts.images = images_path.display().to_string();
    opts.userdata = Some(userdata_path.display().to_string());
    opts.list_userdata_macros = true;

    // macro listing never substitutes, so no macro values are needed
    assert!(prepare_images(&opts, "placement").unwrap().is_none());

    let mut opts = test_flags();
    opts.images = images_path.display().to_string();
    opts.userdata = Some(userdata_path.display().to_string());
    opts.userdata_macros = vec![String::from("CMD=./fuzz")];
    opts.print_userdata = true;

    assert!(prepare_images(&opts, "placement").unwrap().is_none());
}
