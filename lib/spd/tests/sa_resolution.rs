// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Tests for IPsec processing proper: resolving a policy's request
//! chain to SAs, asking key management for missing ones, applying
//! transforms on the way out, and verifying them on the way in.

use common::*;
use core::time::Duration;
use spd::engine::xform::XformError;
use spd_test_utils as common;
use std::sync::Arc;

const PAYLOAD: &[u8] = b"some data";
const GW: &str = "203.0.113.1";

fn client_flow() -> FlowId {
    tcp4("10.0.0.7", 40000, "198.51.100.9", 443)
}

fn esp_tunnel_policy(level: Level) -> PolicySpec {
    ipsec_policy(
        Out,
        sel("10.0.0.0/24", "0.0.0.0/0"),
        vec![tunnel(SecProto::Esp, GW, level)],
    )
}

fn protected(res: Result<OutputAction, IpsecError>) -> Vec<SaHandle> {
    match res {
        Ok(OutputAction::Protected(sas)) => sas,
        res => panic!("expected protected output: {res:?}"),
    }
}

fn ids(sas: &[SaHandle]) -> Vec<SaId> {
    sas.iter().map(|sa| sa.id()).collect()
}

// Scenario: a REQUIRE policy with no SA drops the packet and queues a
// single acquire for the packet's selector. Once the SA shows up the
// packet goes out protected by it.
#[test]
fn acquire_then_protect() {
    let mut g = IpsecAndState::default();
    let now = Moment::now();
    let flow = client_flow();
    let req = tunnel(SecProto::Esp, GW, Level::Require);
    let sai = sai_for(&req, &flow);

    g.ipsec.spd_insert(&esp_tunnel_policy(Level::Require), now).unwrap();
    incr!(g, ["spd_insert", "generation"]);

    let mut pkt = PAYLOAD.to_vec();
    let res = g.ipsec.output(None, &flow, &mut pkt, now);
    assert_eq!(res.unwrap_err(), IpsecError::NoSecurityAssociation(sai));
    assert_eq!(pkt, PAYLOAD);
    incr!(g, ["acquire_sent", "out_nosa"]);

    let acquires = g.ipsec.acquires();
    assert_eq!(acquires.len(), 1);
    assert_eq!(acquires[0].0, flow_sel(&flow));
    assert_eq!(acquires[0].1.sai, sai);
    assert_eq!(g.km.acquires(), vec![(flow_sel(&flow), sai)]);
    assert!(g.xform.applied().is_empty());

    // Key management does its thing.
    let sa = g.ipsec.sa_install(SaSpec::new(sai, 0x1000), now).unwrap();
    assert!(g.ipsec.acquires().is_empty());
    assert_stats!(g);

    let sas = protected(g.ipsec.output(None, &flow, &mut pkt, now));
    incr!(g, ["out_success"]);
    assert_eq!(sas.len(), 1);
    assert!(Arc::ptr_eq(&sas[0], &sa));
    assert_eq!(g.xform.applied(), vec![SaId(0x1000)]);

    let mut expected = 1u32.to_be_bytes().to_vec();
    expected.extend_from_slice(PAYLOAD);
    assert_eq!(pkt, expected);
    assert_eq!(g.km.acquires().len(), 1);
}

// A second packet within the acquire lifetime doesn't signal key
// management again; one after it does.
#[test]
fn acquire_dedup_and_timeout() {
    let cfg = IpsecCfg { acquire_lifetime_secs: 5, ..Default::default() };
    let mut g = IpsecAndState::new(cfg);
    let now = Moment::now();
    let flow = client_flow();

    g.ipsec.spd_insert(&esp_tunnel_policy(Level::Require), now).unwrap();
    incr!(g, ["spd_insert", "generation"]);

    let mut pkt = PAYLOAD.to_vec();
    let _ = g.ipsec.output(None, &flow, &mut pkt, now);
    incr!(g, ["acquire_sent", "out_nosa"]);

    let t1 = now + Duration::from_secs(1);
    let _ = g.ipsec.output(None, &flow, &mut pkt, t1);
    incr!(g, ["acquire_suppressed", "out_nosa"]);
    assert_eq!(g.km.acquires().len(), 1);

    let t6 = now + Duration::from_secs(6);
    let _ = g.ipsec.output(None, &flow, &mut pkt, t6);
    incr!(g, ["acquire_sent", "out_nosa"]);
    assert_eq!(g.km.acquires().len(), 2);
    assert_eq!(g.ipsec.acquires().len(), 1);

    // A different flow under the same policy is its own acquire.
    let flow2 = tcp4("10.0.0.8", 40000, "198.51.100.9", 443);
    let _ = g.ipsec.output(None, &flow2, &mut pkt, t6);
    incr!(g, ["acquire_sent", "out_nosa"]);
    assert_eq!(g.km.acquires().len(), 3);

    // Housekeeping ages out what nobody answered.
    let t12 = now + Duration::from_secs(12);
    assert!(g.ipsec.expire(t12).is_empty());
    set!(g, ["acquire_pruned=2"]);
    assert!(g.ipsec.acquires().is_empty());
}

// After `acquire_block_count` suppressed acquires, key management is
// signalled again even though the entry hasn't expired.
#[test]
fn acquire_block_count() {
    let cfg = IpsecCfg { acquire_block_count: 2, ..Default::default() };
    let mut g = IpsecAndState::new(cfg);
    let now = Moment::now();
    let flow = client_flow();

    g.ipsec.spd_insert(&esp_tunnel_policy(Level::Require), now).unwrap();
    incr!(g, ["spd_insert", "generation"]);

    let mut pkt = PAYLOAD.to_vec();
    for _ in 0..7 {
        let _ = g.ipsec.output(None, &flow, &mut pkt, now);
    }
    set!(g, ["acquire_sent=3", "acquire_suppressed=4", "out_nosa=7"]);
    assert_eq!(g.km.acquires().len(), 3);
}

// A UNIQUE request sticks with the first SA it was given for as long
// as that SA lives. Once it is gone the packet at hand is dropped and
// the next one binds to the replacement.
#[test]
fn unique_pins_sa() {
    let mut g = IpsecAndState::default();
    let now = Moment::now();
    let flow = tcp4("10.0.0.7", 33000, "10.0.1.5", 443);
    let req = transport(SecProto::Esp, Level::Unique);
    let sai = sai_for(&req, &flow);

    let spec =
        ipsec_policy(Out, sel("0.0.0.0/0", "10.0.1.0/24"), vec![req]);
    g.ipsec.spd_insert(&spec, now).unwrap();
    incr!(g, ["spd_insert", "generation"]);

    g.ipsec.sa_install(SaSpec::new(sai, 100), now).unwrap();

    let mut pkt = PAYLOAD.to_vec();
    let first = protected(g.ipsec.output(None, &flow, &mut pkt, now));
    incr!(g, ["out_success"]);

    g.ipsec.sa_install(SaSpec::new(sai, 200), now).unwrap();
    let second = protected(g.ipsec.output(None, &flow, &mut pkt, now));
    incr!(g, ["out_success"]);
    assert_eq!(ids(&first), vec![SaId(100)]);
    assert_eq!(ids(&second), ids(&first));

    // Both SAs are torn down and a new one negotiated.
    assert_eq!(g.sad.expire(&sai), 2);
    g.ipsec.sa_install(SaSpec::new(sai, 300), now).unwrap();
    assert!(g.sad.resolve(&sai).is_some());

    let res = g.ipsec.output(None, &flow, &mut pkt, now);
    assert_eq!(res.unwrap_err(), IpsecError::NoSecurityAssociation(sai));
    incr!(g, ["acquire_sent", "out_nosa"]);

    let third = protected(g.ipsec.output(None, &flow, &mut pkt, now));
    incr!(g, ["out_success"]);
    assert_eq!(ids(&third), vec![SaId(300)]);
    assert_eq!(g.xform.applied(), vec![SaId(100), SaId(100), SaId(300)]);
}

// Housekeeping forgets the UNIQUE bindings of SAs which are gone, so
// one binding per peer does not outlive the peer.
#[test]
fn unique_pins_released_on_expire() {
    let mut g = IpsecAndState::default();
    let now = Moment::now();
    let req = transport(SecProto::Esp, Level::Unique);
    let spec = ipsec_policy(
        Out,
        sel("0.0.0.0/0", "10.0.1.0/24"),
        vec![req.clone()],
    );
    let id = g.ipsec.spd_insert(&spec, now).unwrap();
    incr!(g, ["spd_insert", "generation"]);

    let flows: Vec<FlowId> = (1..=8)
        .map(|host| tcp4("10.0.0.7", 33000, &format!("10.0.1.{host}"), 443))
        .collect();
    for (spi, flow) in (1..).zip(&flows) {
        let sai = sai_for(&req, flow);
        g.ipsec.sa_install(SaSpec::new(sai, spi), now).unwrap();
        let mut pkt = PAYLOAD.to_vec();
        protected(g.ipsec.output(None, flow, &mut pkt, now));
        incr!(g, ["out_success"]);
    }

    let p = g.ipsec.spd_get(id).unwrap();
    assert_eq!(p.chain()[0].pin_count(), flows.len());
    assert!(g.ipsec.expire(now).is_empty());
    assert_eq!(p.chain()[0].pin_count(), flows.len());

    for flow in &flows[..6] {
        assert_eq!(g.sad.expire(&sai_for(&req, flow)), 1);
    }
    assert!(g.ipsec.expire(now).is_empty());
    assert_eq!(p.chain()[0].pin_count(), 2);
    let sai = sai_for(&req, &flows[7]);
    assert_eq!(p.chain()[0].pinned(&sai), Some(SaId(8)));
}

// Key management is asked for every SA a chain lacks, not just the
// one blocking the packet, and each is deduplicated on its own.
#[test]
fn acquire_every_missing_sa() {
    let mut g = IpsecAndState::default();
    let now = Moment::now();
    let flow = client_flow();
    let esp_req = transport(SecProto::Esp, Level::Use);
    let ah_req = tunnel(SecProto::Ah, GW, Level::Require);
    let esp = sai_for(&esp_req, &flow);
    let ah = sai_for(&ah_req, &flow);

    let spec = ipsec_policy(
        Out,
        sel("10.0.0.0/24", "0.0.0.0/0"),
        vec![esp_req, ah_req],
    );
    g.ipsec.spd_insert(&spec, now).unwrap();
    incr!(g, ["spd_insert", "generation"]);

    let mut pkt = PAYLOAD.to_vec();
    let res = g.ipsec.output(None, &flow, &mut pkt, now);
    assert_eq!(res.unwrap_err(), IpsecError::NoSecurityAssociation(ah));
    incr!(g, ["acquire_sent", "acquire_sent", "out_nosa"]);
    let fsel = flow_sel(&flow);
    assert_eq!(g.km.acquires(), vec![(fsel, esp), (fsel, ah)]);
    assert_eq!(g.ipsec.acquires().len(), 2);

    let res = g.ipsec.output(None, &flow, &mut pkt, now);
    assert!(res.is_err());
    incr!(g, ["acquire_suppressed", "acquire_suppressed", "out_nosa"]);

    // With the required SA in place the packet goes out under it alone,
    // while the optional one is still pending.
    let ah_sa = g.ipsec.sa_install(SaSpec::new(ah, 0x300), now).unwrap();
    assert_eq!(g.ipsec.acquires().len(), 1);
    let sas = protected(g.ipsec.output(None, &flow, &mut pkt, now));
    incr!(g, ["acquire_suppressed", "out_success"]);
    assert_eq!(ids(&sas), vec![ah_sa.id()]);
    assert_eq!(g.km.acquires().len(), 2);
}

// A REQUIRE request simply takes whichever SA the SAD offers.
#[test]
fn require_follows_sad() {
    let mut g = IpsecAndState::default();
    let now = Moment::now();
    let flow = tcp4("10.0.0.7", 33000, "10.0.1.5", 443);
    let req = transport(SecProto::Esp, Level::Require);
    let sai = sai_for(&req, &flow);

    let spec =
        ipsec_policy(Out, sel("0.0.0.0/0", "10.0.1.0/24"), vec![req]);
    g.ipsec.spd_insert(&spec, now).unwrap();
    incr!(g, ["spd_insert", "generation"]);

    g.ipsec.sa_install(SaSpec::new(sai, 100), now).unwrap();
    let mut pkt = PAYLOAD.to_vec();
    let sas = protected(g.ipsec.output(None, &flow, &mut pkt, now));
    assert_eq!(ids(&sas), vec![SaId(100)]);

    g.sad.expire(&sai);
    g.ipsec.sa_install(SaSpec::new(sai, 300), now).unwrap();
    let sas = protected(g.ipsec.output(None, &flow, &mut pkt, now));
    assert_eq!(ids(&sas), vec![SaId(300)]);
    incr!(g, ["out_success", "out_success"]);
}

// A request at the `default` level follows the configured default for
// its protocol and mode.
#[test]
fn default_level_from_cfg() {
    let now = Moment::now();
    let flow = tcp4("10.0.0.7", 33000, "10.0.1.5", 443);
    let spec = ipsec_policy(
        Out,
        sel("0.0.0.0/0", "10.0.1.0/24"),
        vec![transport(SecProto::Esp, Level::Default)],
    );

    let g = IpsecAndState::default();
    g.ipsec.spd_insert(&spec, now).unwrap();
    let mut pkt = PAYLOAD.to_vec();
    let sas = protected(g.ipsec.output(None, &flow, &mut pkt, now));
    assert!(sas.is_empty());
    assert_eq!(pkt, PAYLOAD);

    let cfg =
        IpsecCfg { esp_trans_deflev: Level::Require, ..Default::default() };
    let mut g = IpsecAndState::new(cfg);
    g.ipsec.spd_insert(&spec, now).unwrap();
    let res = g.ipsec.output(None, &flow, &mut pkt, now);
    assert!(matches!(res, Err(IpsecError::NoSecurityAssociation(_))));
    incr!(g, ["spd_insert", "generation", "acquire_sent", "out_nosa"]);
}

struct TwoHop {
    g: IpsecAndState,
    flow: FlowId,
    ah: SaHandle,
    esp: SaHandle,
    in_id: PolicyId,
}

// AH transport wrapped in ESP tunnel, in both directions, with both
// SAs installed.
fn two_hop(in_chain: Vec<IpsecRequestSpec>) -> TwoHop {
    let mut g = IpsecAndState::default();
    let now = Moment::now();
    let flow = client_flow();
    let s = sel("10.0.0.0/24", "0.0.0.0/0");
    let ah_req = transport(SecProto::Ah, Level::Require);
    let esp_req = tunnel(SecProto::Esp, GW, Level::Require);

    let out_chain = vec![ah_req.clone(), esp_req.clone()];
    g.ipsec.spd_insert(&ipsec_policy(Out, s, out_chain), now).unwrap();
    let in_spec = ipsec_policy(In, s, in_chain);
    let in_id = g.ipsec.spd_insert(&in_spec, now).unwrap();
    incr!(g, ["spd_insert", "spd_insert", "generation", "generation"]);

    let ah = g
        .ipsec
        .sa_install(SaSpec::new(sai_for(&ah_req, &flow), 0x100), now)
        .unwrap();
    let esp = g
        .ipsec
        .sa_install(SaSpec::new(sai_for(&esp_req, &flow), 0x200), now)
        .unwrap();

    TwoHop { g, flow, ah, esp, in_id }
}

fn two_hop_chain() -> Vec<IpsecRequestSpec> {
    vec![
        transport(SecProto::Ah, Level::Require),
        tunnel(SecProto::Esp, GW, Level::Require),
    ]
}

// The first request of the chain is applied first, and so ends up
// innermost; the inbound side unwraps from the outside in.
#[test]
fn chain_round_trip() {
    let TwoHop { mut g, flow, ah, esp, .. } = two_hop(two_hop_chain());
    let now = Moment::now();

    let mut pkt = PAYLOAD.to_vec();
    let sas = protected(g.ipsec.output(None, &flow, &mut pkt, now));
    incr!(g, ["out_success"]);
    assert_eq!(ids(&sas), vec![ah.id(), esp.id()]);
    assert_eq!(g.xform.applied(), vec![ah.id(), esp.id()]);
    assert_eq!(pkt.len(), PAYLOAD.len() + 8);

    let wire = pkt.clone();
    let headers: Vec<SaHandle> = sas.iter().rev().cloned().collect();
    g.ipsec.input(None, &flow, &headers, &mut pkt, now).unwrap();
    incr!(g, ["in_esp_auth_ok", "in_ah_auth_ok", "in_success"]);
    assert_eq!(pkt, PAYLOAD);
    assert_eq!(g.xform.verified(), vec![esp.id(), ah.id()]);

    // The same packet again is a replay.
    let mut pkt = wire;
    let res = g.ipsec.input(None, &flow, &headers, &mut pkt, now);
    assert_eq!(
        res.unwrap_err(),
        IpsecError::ReplayDetected { sa: esp.id(), seq: 1 }
    );
    incr!(g, ["in_replay"]);
}

// Inbound packets missing a required layer are policy violations,
// as are packets in the clear.
#[test]
fn inbound_missing_layer() {
    let TwoHop { mut g, flow, esp, in_id, .. } = two_hop(two_hop_chain());
    let now = Moment::now();

    let mut pkt = 5u32.to_be_bytes().to_vec();
    pkt.extend_from_slice(PAYLOAD);
    let res = g.ipsec.input(None, &flow, &[esp], &mut pkt, now);
    assert_eq!(
        res.unwrap_err(),
        IpsecError::PolicyViolation { dir: In, policy: Some(in_id) }
    );
    incr!(g, ["in_esp_auth_ok", "in_polvio"]);

    let mut pkt = PAYLOAD.to_vec();
    let res = g.ipsec.input(None, &flow, &[], &mut pkt, now);
    assert!(matches!(res, Err(IpsecError::PolicyViolation { .. })));
    incr!(g, ["in_polvio"]);
}

// An inbound USE request may be absent from the packet.
#[test]
fn inbound_use_optional() {
    let chain = vec![
        transport(SecProto::Ah, Level::Use),
        tunnel(SecProto::Esp, GW, Level::Require),
    ];
    let TwoHop { mut g, flow, esp, .. } = two_hop(chain);
    let now = Moment::now();

    let mut pkt = 1u32.to_be_bytes().to_vec();
    pkt.extend_from_slice(PAYLOAD);
    g.ipsec.input(None, &flow, &[esp], &mut pkt, now).unwrap();
    incr!(g, ["in_esp_auth_ok", "in_success"]);
    assert_eq!(pkt, PAYLOAD);
}

// Transform failures in either direction drop the packet and are
// counted by kind.
#[test]
fn transform_failures() {
    let TwoHop { mut g, flow, ah, esp, .. } = two_hop(two_hop_chain());
    let now = Moment::now();

    g.xform.fail_next(XformError::Other("no buffer".to_string()));
    let mut pkt = PAYLOAD.to_vec();
    let res = g.ipsec.output(None, &flow, &mut pkt, now);
    assert_eq!(
        res.unwrap_err(),
        IpsecError::Transform { sa: ah.id(), msg: "no buffer".to_string() }
    );
    incr!(g, ["out_xform_err"]);

    g.xform.fail_next(XformError::NoResources);
    let res = g.ipsec.output(None, &flow, &mut pkt, now);
    assert_eq!(res.unwrap_err(), IpsecError::ResourceExhausted);
    incr!(g, ["out_xform_err"]);

    let mut pkt = PAYLOAD.to_vec();
    let sas = protected(g.ipsec.output(None, &flow, &mut pkt, now));
    incr!(g, ["out_success"]);

    let headers: Vec<SaHandle> = sas.iter().rev().cloned().collect();
    g.xform.fail_next(XformError::AuthFailed);
    let res = g.ipsec.input(None, &flow, &headers, &mut pkt, now);
    assert_eq!(res.unwrap_err(), IpsecError::AuthenticationFailed(esp.id()));
    incr!(g, ["in_esp_auth_fail"]);
}

// A packet for an SA which has since been torn down is dropped.
#[test]
fn inbound_dead_sa() {
    let TwoHop { mut g, flow, esp, .. } = two_hop(two_hop_chain());
    let now = Moment::now();

    let mut pkt = PAYLOAD.to_vec();
    let sas = protected(g.ipsec.output(None, &flow, &mut pkt, now));
    incr!(g, ["out_success"]);

    assert_eq!(g.sad.expire(esp.sai()), 1);
    let headers: Vec<SaHandle> = sas.iter().rev().cloned().collect();
    let res = g.ipsec.input(None, &flow, &headers, &mut pkt, now);
    assert_eq!(
        res.unwrap_err(),
        IpsecError::NoSecurityAssociation(*esp.sai())
    );
    incr!(g, ["in_nosa"]);
    assert!(g.xform.verified().is_empty());
}
