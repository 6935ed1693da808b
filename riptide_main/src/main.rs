// Riptide: Compiling Network Policies into Flow-Table Updates
// Copyright (C) 2021  Tibor Schneider
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.
use riptide::compile::Compiler;
use riptide::netkat::to_request;
use riptide::policy::{propagate_network, Policy};
use riptide::runtime::{specialize, Cookie, DriverCommand, RecordingDriver, Runtime, RuntimeConfig};
use riptide::vheader::VirtualFieldRegistry;

use clap::{Parser, Subcommand};
use log::*;
use std::error::Error;
use std::fs::File;

mod scenario;
use scenario::*;

fn main() -> Result<(), Box<dyn Error>> {
    // initialize the env logger
    pretty_env_logger::init();
    // run clap
    let args = CommandLineArguments::parse();

    match args.cmd {
        MainCommand::Compile { scenario, table } => {
            let scenario = Scenario::from_file(&scenario)?;
            let config = load_config(args.config.as_deref(), &scenario)?;
            compile(&scenario, &config, table)?
        }
        MainCommand::Replay { scenario, tables, json_filename } => {
            let scenario = Scenario::from_file(&scenario)?;
            let config = load_config(args.config.as_deref(), &scenario)?;
            let commands = replay(&scenario, config, tables)?;
            if let Some(path) = json_filename {
                serde_json::to_writer_pretty(File::create(&path)?, &commands)?;
                info!("Stored {} driver commands in {}", commands.len(), path);
            }
        }
        MainCommand::Netkat { scenario, table, switches } => {
            let scenario = Scenario::from_file(&scenario)?;
            let (policy, topo) = final_policy(&scenario, table)?;
            let switches = switches.unwrap_or_else(|| topo.switches().last().copied().unwrap_or(0));
            let request = to_request(&policy, switches)?;
            println!("{}", serde_json::to_string_pretty(&request)?);
        }
    }
    Ok(())
}

fn load_config(path: Option<&str>, scenario: &Scenario) -> Result<RuntimeConfig, Box<dyn Error>> {
    Ok(match path {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => scenario.config.clone(),
    })
}

fn registry(scenario: &Scenario) -> Result<VirtualFieldRegistry, Box<dyn Error>> {
    let mut registry = VirtualFieldRegistry::new();
    for f in scenario.virtual_fields.iter() {
        registry.register(&f.name, f.values.clone(), f.stage)?;
    }
    Ok(registry)
}

/// Build the last policy of the table, and hand it the final topology of the scenario.
fn final_policy(scenario: &Scenario, table: u8) -> Result<(Policy, riptide::network::Topology), Box<dyn Error>> {
    let spec = scenario
        .last_policy(table)
        .ok_or_else(|| format!("The scenario never installs a policy in table {}", table))?;
    let policy = Names::default().build(spec);
    let topo = scenario.final_topology();
    propagate_network(&policy, &topo);
    Ok((policy, topo))
}

/// Compile the last policy of the table and print the classifier, followed by the rules of
/// every switch.
fn compile(scenario: &Scenario, config: &RuntimeConfig, table: u8) -> Result<(), Box<dyn Error>> {
    let (policy, topo) = final_policy(scenario, table)?;
    let registry = registry(scenario)?;
    info!("Compiling {}", policy);
    let classifier = Compiler::new().with_registry(&registry).compile(&policy)?;
    let classifier = registry.rewrite_classifier(classifier, config.multi_table)?;
    println!("{}", classifier);
    for (switch, rules) in specialize(&classifier, &topo, config.multi_table) {
        println!("switch {}:", switch);
        for r in rules {
            let actions: Vec<String> = r.actions.iter().map(|a| a.to_string()).collect();
            println!("    prio {:5} {} -> [{}]", r.priority, r.matches, actions.join(", "));
        }
    }
    Ok(())
}

/// Run every step of the scenario through the update engine. Returns all driver commands.
fn replay(
    scenario: &Scenario,
    config: RuntimeConfig,
    print_tables: bool,
) -> Result<Vec<DriverCommand>, Box<dyn Error>> {
    let driver = RecordingDriver::new();
    let runtime = Runtime::new(config, driver.clone());
    for f in scenario.virtual_fields.iter() {
        runtime.register_virtual_field(&f.name, f.values.clone(), f.stage)?;
    }

    let mut names = Names::default();
    let mut commands = Vec::new();
    for (i, step) in scenario.steps.iter().enumerate() {
        match step {
            Step::Topology(event) => {
                info!("Step {}: {}", i, event);
                runtime.handle_event(event)?;
            }
            Step::SetPolicy { set_policy, table } => {
                let policy = names.build(set_policy);
                info!("Step {}: table {} <- {}", i, table, policy);
                if let Err(e) = runtime.set_table_policy(*table, policy) {
                    error!("Step {}: {}", i, e);
                }
            }
            Step::Update { update, policy } => {
                let policy = names.build(policy);
                match names.dynamics.get(update) {
                    Some(d) => {
                        info!("Step {}: {} <- {}", i, update, policy);
                        d.set_policy(policy);
                        runtime.process_events()?;
                    }
                    None => warn!("Step {}: unknown dynamic policy {}", i, update),
                }
            }
            Step::PacketIn { packet_in, table } => {
                let pkt = packet(packet_in);
                info!("Step {}: packet in {}", i, pkt);
                let sent = runtime.handle_packet_in(pkt, Cookie::new(*table, runtime.generation(*table)));
                debug!("{} packets sent back", sent);
            }
            Step::Pull { pull } => match names.counts.get(pull) {
                Some(b) => info!("Step {}: pull {}: {:?}", i, pull, runtime.pull_stats(b)),
                None => warn!("Step {}: unknown count bucket {}", i, pull),
            },
        }
        runtime.flush();
        for cmd in driver.take() {
            println!("{}", cmd);
            commands.push(cmd);
        }
    }

    if print_tables {
        for (table, rules) in runtime.installed() {
            println!("table {} (generation {}):", table, runtime.generation(table));
            for r in rules.iter() {
                let actions: Vec<String> = r.actions.iter().map(|a| a.to_string()).collect();
                println!("    {} -> [{}] ({})", r.slot, actions.join(", "), r.cookie);
            }
        }
    }
    Ok(commands)
}

/// Compile network policies and replay scenarios through the update engine, printing the
/// flow-table changes sent to the switches.
#[derive(Parser, Debug)]
#[command(name = "riptide", author = "Tibor Schneider")]
struct CommandLineArguments {
    /// Runtime configuration (JSON file), replacing the configuration of the scenario
    #[arg(short, long, global = true)]
    config: Option<String>,
    /// Action to perform
    #[command(subcommand)]
    cmd: MainCommand,
}

#[derive(Subcommand, Debug)]
enum MainCommand {
    /// Compile the last policy of a table and print the classifier of every switch
    #[command(name = "compile")]
    Compile {
        /// Scenario file
        scenario: String,
        /// Flow table
        #[arg(short, long, default_value = "0")]
        table: u8,
    },
    /// Replay the steps of a scenario and print the driver commands
    #[command(name = "replay")]
    Replay {
        /// Scenario file
        scenario: String,
        /// Print the installed rules at the end
        #[arg(long)]
        tables: bool,
        /// Store all driver commands in a json file
        #[arg(long = "json")]
        json_filename: Option<String>,
    },
    /// Print the NetKAT compile request of the last policy of a table
    #[command(name = "netkat")]
    Netkat {
        /// Scenario file
        scenario: String,
        /// Flow table
        #[arg(short, long, default_value = "0")]
        table: u8,
        /// Number of switches, defaults to the largest switch id of the scenario
        #[arg(short = 'n', long)]
        switches: Option<u32>,
    },
}
