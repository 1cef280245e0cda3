mod azure;
mod ec2;
mod gce;
mod lifecycle;
mod packet;

use std::io;

use clap::{crate_version, Command};

const APP_NAME: &str = "hailstormup";

#[tokio::main]
async fn main() -> io::Result<()> {
    let matches = Command::new(APP_NAME)
        .version(crate_version!())
        .about("Provisions ephemeral fuzzing clusters on EC2, Azure, GCE and Packet")
        .subcommands(vec![
            azure::command(),
            ec2::command(),
            gce::command(),
            packet::command(),
        ])
        .get_matches();

    match matches.subcommand() {
        Some((azure::NAME, sub_matches)) => {
            azure::execute(azure::Flags {
                common: lifecycle::common_flags(sub_matches),
                config: sub_matches
                    .get_one::<String>("CONFIG")
                    .unwrap_or(&String::from("azure.json"))
                    .clone(),
                template: sub_matches.get_one::<String>("TEMPLATE").cloned(),
                group_name: sub_matches.get_one::<String>("GROUP_NAME").cloned(),
                delete_group: sub_matches.get_flag("DELETE_GROUP"),
            })
            .await?;
        }

        Some((ec2::NAME, sub_matches)) => {
            ec2::execute(ec2::Flags {
                common: lifecycle::common_flags(sub_matches),
                region: sub_matches.get_one::<String>("REGION").cloned(),
                spot_request_timeout: *sub_matches
                    .get_one::<u64>("SPOT_REQUEST_TIMEOUT")
                    .unwrap_or(&0),
            })
            .await?;
        }

        Some((gce::NAME, sub_matches)) => {
            gce::execute(gce::Flags {
                common: lifecycle::common_flags(sub_matches),
                config: sub_matches
                    .get_one::<String>("CONFIG")
                    .unwrap_or(&String::from("gce.json"))
                    .clone(),
                start: sub_matches.get_flag("START"),
                reboot: sub_matches.get_flag("REBOOT"),
            })
            .await?;
        }

        Some((packet::NAME, sub_matches)) => {
            packet::execute(packet::Flags {
                common: lifecycle::common_flags(sub_matches),
                config: sub_matches
                    .get_one::<String>("CONFIG")
                    .unwrap_or(&String::from("packet.json"))
                    .clone(),
                reboot: sub_matches.get_flag("REBOOT"),
                list_projects: sub_matches.get_flag("LIST_PROJECTS"),
                list_plans: sub_matches.get_flag("LIST_PLANS"),
                list_facilities: sub_matches.get_flag("LIST_FACILITIES"),
                list_operating_systems: sub_matches.get_flag("LIST_OPERATING_SYSTEMS"),
                list_spot_prices: sub_matches.get_flag("LIST_SPOT_PRICES"),
                create_volume: sub_matches.get_one::<String>("CREATE_VOLUME").cloned(),
                attach_volume: sub_matches.get_one::<String>("ATTACH_VOLUME").cloned(),
            })
            .await?;
        }

        _ => unreachable!("unknown subcommand"),
    }

    Ok(())
}
