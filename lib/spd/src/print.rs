// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print dumps in a human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both spdadm and integration tests.

use crate::engine::acquire::AcquireEntry;
use crate::engine::sad::SaHandle;
use crate::sys::time::Moment;
use itertools::Itertools;
use spd_api::DumpSpdResp;
use spd_api::IpsecRequestSpec;
use spd_api::PolicyDump;
use spd_api::Selector;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a [`DumpSpdResp`].
pub fn print_spd(resp: &DumpSpdResp) -> std::io::Result<()> {
    print_spd_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpSpdResp`] into a given writer.
pub fn print_spd_into(
    writer: &mut impl Write,
    resp: &DumpSpdResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "SPD (generation {})", resp.generation)?;
    write_hrb(&mut t)?;
    print_policy_header(&mut t)?;
    for policy in &resp.policies {
        print_policy(&mut t, policy)?;
    }
    writeln!(t, "DEF\t--\t*\t{}\t--\t--\t--", resp.default_policy)?;
    t.flush()
}

/// Print the header for the [`print_policy()`] output.
pub fn print_policy_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "ID\tDIR\tSELECTOR\tACTION\tREFS\tHITS\tIDLE")
}

fn fmt_request(req: &IpsecRequestSpec) -> String {
    let mut s = format!("{}/{}/{}", req.proto, req.mode, req.level);
    if let Some(dst) = req.dst {
        match req.peer {
            Some(peer) => s.push_str(&format!(" {peer}->{dst}")),
            None => s.push_str(&format!(" ->{dst}")),
        }
    }
    s
}

/// Print a [`PolicyDump`]. An IPsec policy's requests after the first
/// are printed on their own lines beneath it.
pub fn print_policy(
    t: &mut impl Write,
    policy: &PolicyDump,
) -> std::io::Result<()> {
    let mut reqs = policy.requests.iter().map(fmt_request);

    let action = match reqs.next() {
        Some(first) => format!("{} {first}", policy.disposition),
        None => policy.disposition.to_string(),
    };

    writeln!(
        t,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}s",
        policy.id,
        policy.dir,
        policy.selector,
        action,
        policy.refcnt,
        policy.hits,
        policy.idle_secs,
    )?;

    for req in reqs {
        writeln!(t, "\t\t\t  {req}\t\t\t")?;
    }

    Ok(())
}

/// Print the statistics table.
pub fn print_stats(stats: &[(&'static str, u64)]) -> std::io::Result<()> {
    print_stats_into(&mut std::io::stdout(), stats)
}

/// Print the statistics table into a given writer.
pub fn print_stats_into(
    writer: &mut impl Write,
    stats: &[(&'static str, u64)],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "COUNTER\tVALUE")?;
    for (name, val) in stats {
        writeln!(t, "{name}\t{val}")?;
    }
    t.flush()
}

/// Print the pending acquires.
pub fn print_acquires_into(
    writer: &mut impl Write,
    acquires: &[(Selector, AcquireEntry)],
    now: Moment,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "SELECTOR\tSAI\tAGE\tSUPPRESSED")?;
    for (sel, entry) in acquires {
        writeln!(
            t,
            "{sel}\t{}\t{}ms\t{}",
            entry.sai,
            now.delta_as_millis(entry.created),
            entry.count,
        )?;
    }
    t.flush()
}

/// Print a set of SAs.
pub fn print_sas_into(
    writer: &mut impl Write,
    sas: &[SaHandle],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "SPI\tSAI\tALGS")?;
    for sa in sas {
        writeln!(
            t,
            "{}\t{}\t{:?}/{:?}",
            sa.id(),
            sa.sai(),
            sa.auth_alg(),
            sa.enc_alg(),
        )?;
    }
    t.flush()
}

/// Summarize a chain of SAs on one line, in application order.
pub fn sa_chain(sas: &[SaHandle]) -> String {
    if sas.is_empty() {
        return "(none)".to_string();
    }

    sas.iter()
        .map(|sa| format!("{}[{}]", sa.sai().proto, sa.id()))
        .join(" -> ")
}

/// Output a horizontal rule in bold to the given writer.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Output a horizontal rule to the given writer.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}
