// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

#[macro_use]
pub mod stat_state;
pub mod xform;

// Let's make our lives easier and pub use a bunch of stuff.
pub use spd::api::Direction::*;
pub use spd::api::*;
pub use spd::engine::acquire::AcquireResult;
pub use spd::engine::acquire::KeyManager;
pub use spd::engine::ipsec::Ipsec;
pub use spd::engine::ipsec::IpsecError;
pub use spd::engine::ipsec::OutputAction;
pub use spd::engine::pcb::CacheHint;
pub use spd::engine::pcb::PcbPolicy;
pub use spd::engine::policy::PolicyRef;
pub use spd::engine::sad::MemSad;
pub use spd::engine::sad::SaHandle;
pub use spd::engine::sad::SaId;
pub use spd::engine::sad::SecurityAssociationDb;
pub use spd::engine::spd::Resolved;
pub use spd::sys::time::Moment;
pub use stat_state::IpsecState;
pub use xform::RecordingKm;
pub use xform::RecordingXform;

use slog::Drain;
use slog::Logger;
use slog::o;
use std::net::IpAddr;
use std::sync::Arc;

/// A logger which writes through the test harness, so output only
/// shows up for failing tests.
pub fn test_logger() -> Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!("unit" => "test"))
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn cidr(s: &str) -> IpCidr {
    s.parse().unwrap()
}

/// An IPv4 TCP flow.
pub fn tcp4(src: &str, sport: u16, dst: &str, dport: u16) -> FlowId {
    FlowId {
        proto: Protocol::TCP,
        src_ip: ip(src),
        src_port: sport,
        dst_ip: ip(dst),
        dst_port: dport,
    }
}

/// A selector on addresses alone.
pub fn sel(src: &str, dst: &str) -> Selector {
    Selector::new(cidr(src), cidr(dst), None, None, None).unwrap()
}

/// A TCP selector; a port of `None` is ANY.
pub fn sel_tcp(
    src: &str,
    sport: Option<u16>,
    dst: &str,
    dport: Option<u16>,
) -> Selector {
    Selector::new(cidr(src), cidr(dst), Some(Protocol::TCP), sport, dport)
        .unwrap()
}

/// The host selector a packet of `flow` is looked up with.
pub fn flow_sel(flow: &FlowId) -> Selector {
    Selector::try_from(flow).unwrap()
}

pub fn policy(dir: Direction, sel: Selector, disp: Disposition) -> PolicySpec {
    PolicySpec::new(dir, sel, disp)
}

pub fn ipsec_policy(
    dir: Direction,
    sel: Selector,
    requests: Vec<IpsecRequestSpec>,
) -> PolicySpec {
    let mut spec = PolicySpec::new(dir, sel, Disposition::Ipsec);
    spec.requests = requests;
    spec
}

/// A tunnel-mode request towards the tunnel endpoint `dst`.
pub fn tunnel(proto: SecProto, dst: &str, level: Level) -> IpsecRequestSpec {
    IpsecRequestSpec {
        proto,
        mode: Mode::Tunnel,
        level,
        dst: Some(ip(dst)),
        peer: None,
    }
}

pub fn transport(proto: SecProto, level: Level) -> IpsecRequestSpec {
    IpsecRequestSpec {
        proto,
        mode: Mode::Transport,
        level,
        dst: None,
        peer: None,
    }
}

/// The SAI a request needs for a packet of `flow`.
pub fn sai_for(req: &IpsecRequestSpec, flow: &FlowId) -> Sai {
    Sai {
        dst: req.dst.unwrap_or(flow.dst_ip),
        proto: req.proto,
        mode: req.mode,
        peer: req.peer.unwrap_or(flow.src_ip),
    }
}

/// An [`Ipsec`] along with the recording collaborators it was built
/// with and the counters it is expected to show.
pub struct IpsecAndState {
    pub ipsec: Ipsec,
    pub sad: Arc<MemSad>,
    pub xform: Arc<RecordingXform>,
    pub km: Arc<RecordingKm>,
    pub st: IpsecState,
}

impl IpsecAndState {
    pub fn new(cfg: IpsecCfg) -> Self {
        let sad = Arc::new(MemSad::new());
        let xform = Arc::new(RecordingXform::default());
        let km = Arc::new(RecordingKm::default());

        let ipsec = Ipsec::spd_init(
            cfg,
            test_logger(),
            Arc::clone(&sad) as Arc<dyn SecurityAssociationDb>,
            Arc::clone(&xform) as _,
            Arc::clone(&km) as _,
        )
        .unwrap();

        let st = IpsecState::new(&ipsec);
        Self { ipsec, sad, xform, km, st }
    }
}

impl Default for IpsecAndState {
    fn default() -> Self {
        Self::new(IpsecCfg::default())
    }
}
