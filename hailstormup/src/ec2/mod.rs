use std::{
    io::{self, stdout, Error, ErrorKind},
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use clap::{value_parser, Arg, ArgGroup, Command};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use hailstorm::ec2::{self, Ec2ImageDef};

use crate::lifecycle;

pub const NAME: &str = "ec2";

#[derive(Debug, Clone)]
pub struct Flags {
    pub common: lifecycle::CommonFlags,

    pub region: Option<String>,
    pub spot_request_timeout: u64,
}

pub fn command() -> Command {
    Command::new(NAME)
        .about("Provisions fuzzing instances on AWS EC2")
        .args(lifecycle::common_args())
        .arg(
            Arg::new("REGION")
                .long("region")
                .help("Sets the AWS region (defaults to the environment, then us-west-2)")
                .required(false)
                .num_args(1),
        )
        .arg(
            Arg::new("SPOT_REQUEST_TIMEOUT")
                .long("spot-request-timeout")
                .help("Cancels unfulfilled spot requests after this many seconds (0 waits without deadline)")
                .required(false)
                .num_args(1)
                .value_parser(value_parser!(u64))
                .default_value("0"),
        )
        .group(ArgGroup::new("ACTION").args(lifecycle::ACTION_ARGS.iter().copied()))
}

pub async fn execute(opts: Flags) -> io::Result<()> {
    // ref. https://github.com/env-logger-rs/env_logger/issues/47
    env_logger::init_from_env(
        env_logger::Env::default()
            .filter_or(env_logger::DEFAULT_FILTER_ENV, &opts.common.log_level),
    );

    let image_set = match lifecycle::prepare_images(&opts.common, "placement")? {
        Some(v) => v,
        None => return Ok(()),
    };
    let image_def: Ec2ImageDef = image_set
        .extract(&opts.common.image_name)
        .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;

    let shared_config = ec2::load_config(opts.region.clone()).await?;
    let mgr = ec2::Manager::new(&shared_config);

    execute!(
        stdout(),
        SetForegroundColor(Color::Blue),
        Print(format!(
            "\nLoaded image definition '{}' from '{}'\n",
            opts.common.image_name, opts.common.images
        )),
        ResetColor
    )?;

    match lifecycle::pick_action(&opts.common) {
        // spot creation carries the signal flag: Ctrl-C cancels outstanding
        // requests the same way a timeout does
        lifecycle::Action::CreateSpot => {
            if !lifecycle::confirm("create spot instances on 'ec2'", opts.common.skip_prompt) {
                return Ok(());
            }
            let tags = hailstorm::parse_key_value_map(&opts.common.tags)
                .map_err(|e| Error::new(ErrorKind::InvalidInput, e.message()))?;
            let timeout = if opts.spot_request_timeout > 0 {
                Some(Duration::from_secs(opts.spot_request_timeout))
            } else {
                None
            };

            let aborted = Arc::new(AtomicBool::new(false));
            signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&aborted))
                .expect("failed to register os signal");
            signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&aborted))
                .expect("failed to register os signal");

            let created = mgr
                .create_spot_with_abort(
                    opts.common.max_spot_price,
                    &image_def,
                    &tags,
                    timeout,
                    Some(aborted),
                )
                .await
                .map_err(|e| Error::new(ErrorKind::Other, e.message()))?;
            lifecycle::print_created(&created)?;
        }

        action => lifecycle::drive(&mgr, &image_def, &opts.common, action).await?,
    }

    Ok(())
}

/// RUST_LOG=debug cargo test --package hailstormup --bin hailstormup -- ec2::test_command --exact --show-output
#[test]
fn test_command() {
    let _ = env_logger::builder().is_test(true).try_init();

    let matches = command()
        .try_get_matches_from(vec![
            NAME,
            "--create-spot",
            "--spot-request-timeout",
            "90",
            "--region",
            "eu-central-1",
            "--skip-prompt",
        ])
        .unwrap();
    assert!(matches.get_flag("CREATE_SPOT"));
    assert_eq!(matches.get_one::<u64>("SPOT_REQUEST_TIMEOUT"), Some(&90));
    assert_eq!(
        matches.get_one::<String>("REGION").map(String::as_str),
        Some("eu-central-1")
    );

    // actions are mutually exclusive
    let ret = command().try_get_matches_from(vec![NAME, "--create-on-demand", "--terminate"]);
    assert!(ret.is_err());
}
