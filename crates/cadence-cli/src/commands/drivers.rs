//! Driver and internal client listing.

use cadence_config::user_drivers_dir;
use cadence_core::ParamDescriptor;
use cadence_driver::{DriverRegistry, output_device_names};
use cadence_server::InternalClientRegistry;
use clap::Args;

#[derive(Args)]
pub struct DriversArgs {
    /// Show only this driver, with its parameters
    name: Option<String>,

    /// Also list the audio output devices cpal can see
    #[arg(long)]
    devices: bool,
}

fn print_params(params: &[ParamDescriptor]) {
    if params.is_empty() {
        println!("    (no parameters)");
        return;
    }
    for p in params {
        println!(
            "    -{}, --{:<10} {:<6} default {:<8} {}",
            p.character,
            p.name,
            p.kind.to_string(),
            p.default.to_string(),
            p.short_desc
        );
    }
}

pub fn run(args: DriversArgs) -> anyhow::Result<()> {
    let mut drivers = DriverRegistry::new();
    drivers.add_search_dir(user_drivers_dir());

    if let Some(name) = args.name {
        let Some(descriptor) = drivers.descriptor(&name) else {
            anyhow::bail!("unknown driver: {name}");
        };
        println!("{} - {}", descriptor.name, descriptor.description);
        println!("  Parameters:");
        print_params(&descriptor.params);
        return Ok(());
    }

    println!("Available Drivers");
    println!("=================\n");
    for descriptor in drivers.descriptors() {
        println!("  {:<10} {}", descriptor.name, descriptor.description);
        print_params(&descriptor.params);
        println!();
    }

    let clients = InternalClientRegistry::new();
    println!("Internal Clients");
    println!("================\n");
    for name in clients.names() {
        if let Some(descriptor) = clients.descriptor(name) {
            println!("  {:<10} {}", descriptor.name, descriptor.description);
            print_params(&descriptor.params);
        }
    }

    if args.devices {
        println!();
        println!("Output Devices");
        println!("==============\n");
        let devices = output_device_names();
        if devices.is_empty() {
            println!("  No audio devices found.");
        }
        for (idx, name) in devices.iter().enumerate() {
            println!("  [{idx}] {name}");
        }
    }

    Ok(())
}
