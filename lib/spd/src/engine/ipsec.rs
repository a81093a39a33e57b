// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The IPsec policy engine.
//!
//! [`Ipsec`] is the process-wide IPsec state: the SPD, the acquire
//! queue, the statistics table, and handles to the SAD, the transform
//! engine, and key management. It is created once with
//! [`Ipsec::spd_init()`] and passed by reference to everything which
//! processes packets.
//!
//! ### Outbound
//!
//! [`Ipsec::output()`] finds the policy for the packet (the socket's
//! own policy, its cached lookup, or the SPD), then either drops the
//! packet, releases it in the clear, or resolves the policy's request
//! chain to SAs and runs each through the transform engine in chain
//! order.
//!
//! ### Inbound
//!
//! [`Ipsec::input()`] is handed the SAs whose headers were found on
//! the packet, outermost first. Each is verified in that order, and
//! the resulting transform history is then checked against the
//! inbound policy for the packet.
//!
//! Every packet-path decision is final: a dropped packet is never
//! retried or released in the clear as a fallback.

use super::acquire::AcquireEntry;
use super::acquire::AcquireQueue;
use super::acquire::AcquireResult;
use super::acquire::KeyManager;
use super::pcb::CacheHint;
use super::pcb::CacheOutcome;
use super::pcb::PcbPolicy;
use super::policy::PolicyRef;
use super::request::DefaultLevels;
use super::request::history_satisfies;
use super::request::resolve_chain;
use super::sad::SaHandle;
use super::sad::SaId;
use super::sad::SecurityAssociation;
use super::sad::SecurityAssociationDb;
use super::spd::Resolved;
use super::spd::Spd;
use super::stat::IpsecStats;
use super::stat::IpsecStatsSnap;
use super::xform::TransformEngine;
use super::xform::XformError;
use crate::sys::kstat;
use crate::sys::kstat::KStatNamed;
use crate::sys::kstat::KStatProvider;
use crate::sys::kstat::KStatU64;
use crate::sys::time::Moment;
use crate::sys::time::Ttl;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use spd_api::DefaultPolicy;
use spd_api::Direction;
use spd_api::Disposition;
use spd_api::DumpSpdResp;
use spd_api::FlowId;
use spd_api::IpsecCfg;
use spd_api::PolicyId;
use spd_api::PolicySpec;
use spd_api::Sai;
use spd_api::SaSpec;
use spd_api::Selector;
use spd_api::SpdError;
use std::sync::Arc;
use thiserror::Error;

/// Why a packet was dropped.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum IpsecError {
    /// The packet's policy (or the default) says DISCARD, or an
    /// inbound packet was not protected the way its policy demands.
    /// `policy` is `None` when the system default applied.
    #[error("{dir} policy violation (policy {policy:?})")]
    PolicyViolation { dir: Direction, policy: Option<PolicyId> },

    #[error("no security association for {0}")]
    NoSecurityAssociation(Sai),

    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("replay detected on SA {sa}: sequence {seq}")]
    ReplayDetected { sa: SaId, seq: u32 },

    #[error("authentication failed on SA {0}")]
    AuthenticationFailed(SaId),

    #[error("transform failed on SA {sa}: {msg}")]
    Transform { sa: SaId, msg: String },

    #[error("out of resources")]
    ResourceExhausted,
}

/// What to do with an outbound packet which passed policy.
#[derive(Debug)]
pub enum OutputAction {
    /// Send it in the clear.
    Clear,

    /// Send it; these SAs were applied to it, in order. The list may
    /// be shorter than the policy's chain, or even empty, when
    /// requests at the USE level had no SA.
    Protected(Vec<SaHandle>),
}

#[derive(Clone, Copy, Debug)]
#[repr(usize)]
enum LogKind {
    InPolvio,
    OutPolvio,
    InNoSa,
    OutNoSa,
}

const NUM_LOG_KINDS: usize = 4;

/// Allows one log message per kind per interval.
struct LogLimiter {
    base: Moment,
    interval_ms: u64,
    // Milliseconds after `base`, plus one, of the last message; zero
    // if none has been logged.
    last: [AtomicU64; NUM_LOG_KINDS],
}

impl LogLimiter {
    fn new(interval_ms: u64, base: Moment) -> Self {
        Self { base, interval_ms, last: Default::default() }
    }

    fn allow(&self, kind: LogKind, now: Moment) -> bool {
        let t = now.delta_as_millis(self.base) + 1;
        let last = &self.last[kind as usize];
        let prev = last.load(Ordering::Relaxed);

        if prev != 0 && t.saturating_sub(prev) < self.interval_ms {
            return false;
        }

        last.compare_exchange(prev, t, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

pub struct Ipsec {
    log: Logger,
    cfg: IpsecCfg,
    spd: Spd,
    sad: Arc<dyn SecurityAssociationDb>,
    xform: Arc<dyn TransformEngine>,
    km: Arc<dyn KeyManager>,
    acquires: AcquireQueue,
    levels: DefaultLevels,
    stats: KStatNamed<IpsecStats>,
    limiter: LogLimiter,
}

impl Ipsec {
    /// Bring up the IPsec state with an empty SPD.
    ///
    /// Default levels which make no sense as defaults are coerced to
    /// `use`, with a warning for each.
    pub fn spd_init(
        cfg: IpsecCfg,
        log: Logger,
        sad: Arc<dyn SecurityAssociationDb>,
        xform: Arc<dyn TransformEngine>,
        km: Arc<dyn KeyManager>,
    ) -> Result<Self, kstat::Error> {
        let log = log.new(o!("component" => "ipsec"));
        let stats = KStatNamed::new("ipsec", "spd", IpsecStats::new())?;

        let (levels, coerced) = DefaultLevels::from_cfg(&cfg);
        for setting in &coerced {
            warn!(
                log,
                "default level coerced to use";
                "setting" => *setting,
            );
        }
        stats.vals.cfg_coerced.incr(coerced.len() as u64);

        let spd = Spd::new(&cfg, log.new(o!("component" => "spd")));
        let acquires = AcquireQueue::new(
            Ttl::new_seconds(cfg.acquire_lifetime_secs),
            cfg.acquire_block_count,
        );
        let limiter = LogLimiter::new(cfg.log_rate_limit_ms, Moment::now());

        info!(
            log,
            "IPsec initialized";
            "stats" => format!("{}:{}", stats.module(), stats.name()),
            "default_policy" => %cfg.default_policy,
            "max_entries" => cfg.spd_max_entries,
        );

        Ok(Self {
            log,
            cfg,
            spd,
            sad,
            xform,
            km,
            acquires,
            levels,
            stats,
            limiter,
        })
    }

    /// Tear down the IPsec state, flushing the SPD so that anyone
    /// still holding a policy sees it DEAD.
    pub fn teardown(self) {
        let flushed = self.spd.flush();
        info!(
            self.log,
            "IPsec torn down";
            "policies" => flushed,
            "acquires" => self.acquires.len(),
        );
    }

    pub fn cfg(&self) -> &IpsecCfg {
        &self.cfg
    }

    pub fn spd(&self) -> &Spd {
        &self.spd
    }

    pub fn sad(&self) -> &Arc<dyn SecurityAssociationDb> {
        &self.sad
    }

    pub fn levels(&self) -> &DefaultLevels {
        &self.levels
    }

    pub fn acquires(&self) -> Vec<(Selector, AcquireEntry)> {
        self.acquires.dump()
    }

    // ================================================================
    // Administration
    // ================================================================

    pub fn spd_insert(
        &self,
        spec: &PolicySpec,
        now: Moment,
    ) -> Result<PolicyId, SpdError> {
        let id = self.spd.insert(spec, now)?;
        self.stats.vals.spd_insert.incr(1);
        Ok(id)
    }

    pub fn spd_delete(&self, id: PolicyId) -> Result<(), SpdError> {
        self.spd.delete(id)?;
        self.stats.vals.spd_delete.incr(1);
        Ok(())
    }

    pub fn spd_replace(
        &self,
        id: PolicyId,
        spec: &PolicySpec,
        now: Moment,
    ) -> Result<(), SpdError> {
        self.spd.replace(id, spec, now)?;
        self.stats.vals.spd_replace.incr(1);
        Ok(())
    }

    pub fn spd_flush(&self) -> usize {
        let n = self.spd.flush();
        self.stats.vals.spd_flush.incr(1);
        n
    }

    pub fn spd_lookup(
        &self,
        dir: Direction,
        sel: &Selector,
        now: Moment,
    ) -> Option<PolicyRef> {
        let res = self.spd.lookup(dir, sel, now);
        if res.is_none() {
            self.stats.vals.spd_lookup_miss.incr(1);
        }
        res
    }

    pub fn spd_get(&self, id: PolicyId) -> Option<PolicyRef> {
        self.spd.get(id)
    }

    pub fn spd_dump(&self, now: Moment) -> DumpSpdResp {
        self.spd.dump(now)
    }

    /// Run the periodic housekeeping: expire policies past their
    /// lifetime or valid time, telling key management about each, and
    /// prune old acquires. Returns the ids of the expired policies.
    pub fn expire(&self, now: Moment) -> Vec<PolicyId> {
        let expired = self.spd.expire(now);
        self.stats.vals.spd_expired.incr(expired.len() as u64);
        for id in &expired {
            self.km.on_policy_expire(*id);
        }

        let pruned = self.acquires.prune(now);
        self.stats.vals.acquire_pruned.incr(pruned as u64);
        if pruned > 0 {
            debug!(self.log, "acquires pruned"; "count" => pruned);
        }

        let unpinned = self.spd.prune_pins(&*self.sad);
        if unpinned > 0 {
            debug!(self.log, "stale SA pins dropped"; "count" => unpinned);
        }

        expired
    }

    /// Install an SA on behalf of key management.
    pub fn sa_install(
        &self,
        spec: SaSpec,
        now: Moment,
    ) -> Result<SaHandle, SpdError> {
        let sa = self.sad.install(SecurityAssociation::new(spec, now))?;
        self.sa_installed(sa.sai());
        Ok(sa)
    }

    /// An SA for `sai` is now available: drop the acquires waiting on
    /// it. Returns the number dropped.
    pub fn sa_installed(&self, sai: &Sai) -> usize {
        let n = self.acquires.satisfied(sai);
        if n > 0 {
            debug!(self.log, "acquires satisfied"; "sai" => %sai, "count" => n);
        }
        n
    }

    pub fn pcb_set_policy(
        &self,
        pcb: &mut PcbPolicy,
        dir: Direction,
        bytes: &[u8],
        now: Moment,
    ) -> Result<(), SpdError> {
        pcb.set_policy(dir, bytes, now)?;
        debug!(self.log, "socket policy set"; "dir" => %dir);
        Ok(())
    }

    pub fn pcb_get_policy(
        &self,
        pcb: &PcbPolicy,
        dir: Direction,
    ) -> Result<Vec<u8>, SpdError> {
        pcb.get_policy(dir)
    }

    /// The socket's fast-path answer for `sel`; see
    /// [`PcbPolicy::check()`].
    pub fn check_policy(
        &self,
        pcb: &PcbPolicy,
        dir: Direction,
        sel: &Selector,
    ) -> CacheHint {
        pcb.check(dir, sel, self.spd.generation())
    }

    /// Every counter, in table order.
    pub fn stats(&self) -> Vec<(&'static str, u64)> {
        self.stats.vals.entries()
    }

    pub fn stats_snap(&self) -> IpsecStatsSnap {
        self.stats.vals.snapshot()
    }

    // ================================================================
    // Packet processing
    // ================================================================

    fn selector(
        &self,
        flow: &FlowId,
        inval: &KStatU64,
    ) -> Result<Selector, IpsecError> {
        Selector::try_from(flow).map_err(|e| {
            inval.incr(1);
            IpsecError::InvalidSelector(e.to_string())
        })
    }

    fn resolve(
        &self,
        pcb: Option<&mut PcbPolicy>,
        dir: Direction,
        sel: &Selector,
        now: Moment,
    ) -> Resolved {
        let stats = &self.stats.vals;
        let (res, fresh) = match pcb {
            Some(pcb) => {
                let (res, outcome) = pcb.resolve(&self.spd, dir, sel, now);
                match outcome {
                    CacheOutcome::Override => (),
                    CacheOutcome::Hit => stats.pcb_cache_hit.incr(1),
                    CacheOutcome::Miss => stats.pcb_cache_miss.incr(1),
                    CacheOutcome::Stale => stats.pcb_cache_stale.incr(1),
                }
                let fresh = matches!(
                    outcome,
                    CacheOutcome::Miss | CacheOutcome::Stale
                );
                (res, fresh)
            }

            None => (self.spd.resolve(dir, sel, now), true),
        };

        if fresh && matches!(res, Resolved::Default(_)) {
            stats.spd_lookup_miss.incr(1);
        }

        res
    }

    fn violation(
        &self,
        kind: LogKind,
        dir: Direction,
        policy: Option<PolicyId>,
        flow: &FlowId,
        now: Moment,
    ) -> IpsecError {
        match dir {
            Direction::In => self.stats.vals.in_polvio.incr(1),
            _ => self.stats.vals.out_polvio.incr(1),
        }

        if self.limiter.allow(kind, now) {
            debug!(
                self.log,
                "policy violation";
                "dir" => %dir,
                "policy" => ?policy,
                "flow" => %flow,
            );
        }

        IpsecError::PolicyViolation { dir, policy }
    }

    fn acquire(&self, sel: &Selector, sai: &Sai, now: Moment) {
        match self.acquires.acquire(sel, sai, now) {
            AcquireResult::Sent => {
                self.stats.vals.acquire_sent.incr(1);
                debug!(
                    self.log,
                    "acquire";
                    "selector" => %sel,
                    "sai" => %sai,
                );
                self.km.on_acquire(sel, sai);
            }

            AcquireResult::Suppressed => {
                self.stats.vals.acquire_suppressed.incr(1);
            }
        }
    }

    /// Decide the fate of an outbound packet of `flow`, protecting
    /// `pkt` in place if its policy calls for it.
    ///
    /// `pcb` is the sending socket's state, when there is a socket.
    pub fn output(
        &self,
        pcb: Option<&mut PcbPolicy>,
        flow: &FlowId,
        pkt: &mut Vec<u8>,
        now: Moment,
    ) -> Result<OutputAction, IpsecError> {
        let stats = &self.stats.vals;
        let sel = self.selector(flow, &stats.out_inval)?;

        let policy = match self.resolve(pcb, Direction::Out, &sel, now) {
            Resolved::Default(DefaultPolicy::Discard) => {
                let (kind, dir) = (LogKind::OutPolvio, Direction::Out);
                return Err(self.violation(kind, dir, None, flow, now));
            }

            Resolved::Default(DefaultPolicy::None) => {
                stats.out_bypass.incr(1);
                stats.out_success.incr(1);
                return Ok(OutputAction::Clear);
            }

            Resolved::Policy(p) => p,
        };

        match policy.disposition() {
            Disposition::Discard => {
                let (kind, id) = (LogKind::OutPolvio, Some(policy.id()));
                return Err(self.violation(kind, Direction::Out, id, flow, now));
            }

            Disposition::Bypass => {
                stats.out_bypass.incr(1);
                stats.out_success.incr(1);
                return Ok(OutputAction::Clear);
            }

            Disposition::Ipsec => (),
        }

        let res = resolve_chain(&policy, flow, &self.levels, &*self.sad);

        // Every missing SA is asked for, each deduplicated on its own.
        for sai in &res.missing {
            self.acquire(&sel, sai, now);
        }

        if let Some(sai) = res.blocked {
            stats.out_nosa.incr(1);
            if self.limiter.allow(LogKind::OutNoSa, now) {
                debug!(
                    self.log,
                    "no SA for required request";
                    "policy" => policy.id(),
                    "sai" => %sai,
                    "flow" => %flow,
                );
            }
            return Err(IpsecError::NoSecurityAssociation(sai));
        }

        for sa in &res.sas {
            if let Err(e) = self.xform.apply(sa, pkt) {
                stats.out_xform_err.incr(1);
                return Err(xform_err(sa, e));
            }
        }

        stats.out_success.incr(1);
        Ok(OutputAction::Protected(res.sas))
    }

    /// Verify an inbound packet of `flow`.
    ///
    /// `sas` are the SAs of the IPsec headers found on `pkt`, outermost
    /// first; each is verified and unwrapped in that order before the
    /// result is checked against the inbound policy.
    pub fn input(
        &self,
        pcb: Option<&mut PcbPolicy>,
        flow: &FlowId,
        sas: &[SaHandle],
        pkt: &mut Vec<u8>,
        now: Moment,
    ) -> Result<(), IpsecError> {
        let stats = &self.stats.vals;
        let sel = self.selector(flow, &stats.in_inval)?;
        let mut history = Vec::with_capacity(sas.len());

        for sa in sas {
            let sai = sa.sai();
            if sa.is_dead() {
                stats.in_nosa.incr(1);
                if self.limiter.allow(LogKind::InNoSa, now) {
                    debug!(
                        self.log,
                        "packet for dead SA";
                        "sa" => %sa.id(),
                        "flow" => %flow,
                    );
                }
                return Err(IpsecError::NoSecurityAssociation(*sai));
            }

            match self.xform.verify(sa, pkt) {
                Ok(()) => stats.auth_ok(sai.proto).incr(1),

                Err(XformError::AuthFailed) => {
                    stats.auth_fail(sai.proto).incr(1);
                    return Err(IpsecError::AuthenticationFailed(sa.id()));
                }

                Err(XformError::Replay(seq)) => {
                    stats.in_replay.incr(1);
                    return Err(IpsecError::ReplayDetected { sa: sa.id(), seq });
                }

                Err(e) => {
                    stats.in_xform_err.incr(1);
                    return Err(xform_err(sa, e));
                }
            }

            history.push((sai.proto, sai.mode));
        }

        let policy = match self.resolve(pcb, Direction::In, &sel, now) {
            Resolved::Default(DefaultPolicy::Discard) => {
                let (kind, dir) = (LogKind::InPolvio, Direction::In);
                return Err(self.violation(kind, dir, None, flow, now));
            }

            Resolved::Default(DefaultPolicy::None) => {
                stats.in_success.incr(1);
                return Ok(());
            }

            Resolved::Policy(p) => p,
        };

        let ok = match policy.disposition() {
            Disposition::Discard => false,
            Disposition::Bypass => true,
            Disposition::Ipsec => {
                history_satisfies(policy.chain(), &history, &self.levels)
            }
        };

        if !ok {
            let (kind, id) = (LogKind::InPolvio, Some(policy.id()));
            return Err(self.violation(kind, Direction::In, id, flow, now));
        }

        stats.in_success.incr(1);
        Ok(())
    }
}

fn xform_err(sa: &SecurityAssociation, e: XformError) -> IpsecError {
    match e {
        XformError::AuthFailed => IpsecError::AuthenticationFailed(sa.id()),
        XformError::Replay(seq) => {
            IpsecError::ReplayDetected { sa: sa.id(), seq }
        }
        XformError::NoResources => IpsecError::ResourceExhausted,
        XformError::Other(msg) => IpsecError::Transform { sa: sa.id(), msg },
    }
}
