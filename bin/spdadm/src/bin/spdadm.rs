// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::io;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use clap::Parser;
use slog::Drain;
use slog::Logger;
use slog::info;
use slog::o;
use spd::api::Direction;
use spd::api::FlowId;
use spd::api::Protocol;
use spd::api::Selector;
use spd::print::print_acquires_into;
use spd::print::print_policy;
use spd::print::print_policy_header;
use spd::print::print_sas_into;
use spd::print::print_spd;
use spd::print::print_stats;
use spd::sys::time::Moment;
use spdadm::LookupResult;
use spdadm::SpdAdm;
use spdadm::SpdFile;
use tabwriter::TabWriter;

/// Load, inspect, and exercise an IPsec security policy database.
#[derive(Debug, Parser)]
#[command(version)]
enum Command {
    /// Load a policy file and report whether it is valid.
    Check {
        #[arg(short)]
        file: PathBuf,
    },

    /// Dump the SPD and SAD built from a policy file.
    Dump {
        #[arg(short)]
        file: PathBuf,
    },

    /// Show the policy governing a flow.
    Lookup {
        #[arg(short)]
        file: PathBuf,

        #[arg(long, default_value = "out")]
        dir: Direction,

        #[command(flatten)]
        flow: Flow,
    },

    /// Send one outbound packet of a flow and report what became of it.
    Dispatch {
        #[arg(short)]
        file: PathBuf,

        #[command(flatten)]
        flow: Flow,
    },
}

#[derive(Args, Clone, Debug)]
struct Flow {
    #[arg(long)]
    src: IpAddr,

    #[arg(long)]
    dst: IpAddr,

    #[arg(long, default_value = "TCP")]
    proto: Protocol,

    #[arg(long, default_value_t = 0)]
    sport: u16,

    #[arg(long, default_value_t = 0)]
    dport: u16,
}

impl From<Flow> for FlowId {
    fn from(f: Flow) -> Self {
        FlowId {
            proto: f.proto,
            src_ip: f.src,
            src_port: f.sport,
            dst_ip: f.dst,
            dst_port: f.dport,
        }
    }
}

fn logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("component" => "spdadm"))
}

fn load(file: &Path, log: &Logger, now: Moment) -> anyhow::Result<SpdAdm> {
    let spd_file = SpdFile::load(file)?;
    let adm = SpdAdm::build(spd_file, log.clone(), now)
        .with_context(|| format!("failed to load {}", file.display()))?;
    info!(log, "loaded policy file";
        "file" => %file.display(),
        "policies" => adm.ipsec.spd().len(),
        "sas" => adm.sad.len(),
    );
    Ok(adm)
}

fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    let log = logger();
    let now = Moment::now();

    match cmd {
        Command::Check { file } => {
            let adm = load(&file, &log, now)?;
            println!(
                "{}: {} policies, {} SAs",
                file.display(),
                adm.ipsec.spd().len(),
                adm.sad.len(),
            );
        }

        Command::Dump { file } => {
            let adm = load(&file, &log, now)?;
            print_spd(&adm.ipsec.spd_dump(now))?;
            println!();
            print_sas_into(&mut io::stdout(), &adm.sad.dump())?;
        }

        Command::Lookup { file, dir, flow } => {
            let adm = load(&file, &log, now)?;
            let sel = Selector::try_from(&FlowId::from(flow))?;
            match adm.lookup(dir, &sel, now) {
                LookupResult::Policy(p) => {
                    let mut t = TabWriter::new(io::stdout());
                    print_policy_header(&mut t)?;
                    print_policy(&mut t, &p)?;
                    t.flush()?;
                }

                LookupResult::Default(def) => {
                    println!("no matching policy, default {def}");
                }
            }
        }

        Command::Dispatch { file, flow } => {
            let adm = load(&file, &log, now)?;
            println!("{}", adm.dispatch(&FlowId::from(flow), now));
            println!();
            let acquires = adm.ipsec.acquires();
            print_acquires_into(&mut io::stdout(), &acquires, now)?;
            println!();
            print_stats(&adm.ipsec.stats())?;
        }
    }

    Ok(())
}
