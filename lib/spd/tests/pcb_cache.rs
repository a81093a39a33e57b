// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Per-socket policy and lookup cache tests.

use common::*;
use spd_test_utils as common;

fn bypass_subnet() -> PolicySpec {
    policy(Out, sel("0.0.0.0/0", "10.0.1.0/24"), Disposition::Bypass)
}

// Any change to the SPD invalidates every socket's cached answer,
// even though the socket itself did nothing in between.
#[test]
fn spd_change_makes_cache_stale() {
    let mut g = IpsecAndState::default();
    let now = Moment::now();
    let mut pcb = PcbPolicy::new(false);
    let flow = tcp4("10.0.0.7", 33000, "10.0.1.5", 443);
    let fsel = flow_sel(&flow);

    g.ipsec.spd_insert(&bypass_subnet(), now).unwrap();
    incr!(g, ["spd_insert", "generation"]);
    assert_eq!(g.ipsec.check_policy(&pcb, Out, &fsel), CacheHint::Maybe);

    let mut pkt = vec![0; 8];
    let res = g.ipsec.output(Some(&mut pcb), &flow, &mut pkt, now);
    assert!(matches!(res, Ok(OutputAction::Clear)));
    incr!(g, ["pcb_cache_miss", "out_bypass", "out_success"]);
    assert_eq!(g.ipsec.check_policy(&pcb, Out, &fsel), CacheHint::No);

    let res = g.ipsec.output(Some(&mut pcb), &flow, &mut pkt, now);
    assert!(matches!(res, Ok(OutputAction::Clear)));
    incr!(g, ["pcb_cache_hit", "out_bypass", "out_success"]);

    // Someone else adds an unrelated policy.
    let other =
        policy(In, sel("0.0.0.0/0", "0.0.0.0/0"), Disposition::Bypass);
    let other_id = g.ipsec.spd_insert(&other, now).unwrap();
    incr!(g, ["spd_insert", "generation"]);
    assert_eq!(g.ipsec.check_policy(&pcb, Out, &fsel), CacheHint::Maybe);

    let res = g.ipsec.output(Some(&mut pcb), &flow, &mut pkt, now);
    assert!(matches!(res, Ok(OutputAction::Clear)));
    incr!(g, ["pcb_cache_stale", "out_bypass", "out_success"]);
    assert_eq!(g.ipsec.check_policy(&pcb, Out, &fsel), CacheHint::No);

    // And deletes it again.
    g.ipsec.spd_delete(other_id).unwrap();
    incr!(g, ["spd_delete", "generation"]);
    assert_eq!(g.ipsec.check_policy(&pcb, Out, &fsel), CacheHint::Maybe);
}

// A deleted policy is never used from the cache: after the delete
// the socket sees the DISCARD default.
#[test]
fn deleted_policy_not_served_from_cache() {
    let mut g = IpsecAndState::default();
    let now = Moment::now();
    let mut pcb = PcbPolicy::new(false);
    let flow = tcp4("10.0.0.7", 33000, "10.0.1.5", 443);

    let id = g.ipsec.spd_insert(&bypass_subnet(), now).unwrap();
    incr!(g, ["spd_insert", "generation"]);

    let mut pkt = vec![0; 8];
    let res = g.ipsec.output(Some(&mut pcb), &flow, &mut pkt, now);
    assert!(matches!(res, Ok(OutputAction::Clear)));
    incr!(g, ["pcb_cache_miss", "out_bypass", "out_success"]);

    g.ipsec.spd_delete(id).unwrap();
    incr!(g, ["spd_delete", "generation"]);

    let res = g.ipsec.output(Some(&mut pcb), &flow, &mut pkt, now);
    assert_eq!(
        res.unwrap_err(),
        IpsecError::PolicyViolation { dir: Out, policy: None }
    );
    incr!(g, ["pcb_cache_stale", "spd_lookup_miss", "out_polvio"]);

    // The cached DISCARD default is served like any other answer.
    let res = g.ipsec.output(Some(&mut pcb), &flow, &mut pkt, now);
    assert!(matches!(res, Err(IpsecError::PolicyViolation { .. })));
    incr!(g, ["pcb_cache_hit", "out_polvio"]);
}

// A slot only answers for the selector it was filled with.
#[test]
fn cache_keyed_on_selector() {
    let mut g = IpsecAndState::default();
    let now = Moment::now();
    let mut pcb = PcbPolicy::new(false);
    let flow1 = tcp4("10.0.0.7", 33000, "10.0.1.5", 443);
    let flow2 = tcp4("10.0.0.7", 33001, "10.0.1.5", 443);

    g.ipsec.spd_insert(&bypass_subnet(), now).unwrap();
    incr!(g, ["spd_insert", "generation"]);

    let mut pkt = vec![0; 8];
    g.ipsec.output(Some(&mut pcb), &flow1, &mut pkt, now).unwrap();
    incr!(g, ["pcb_cache_miss", "out_bypass", "out_success"]);
    assert_eq!(
        g.ipsec.check_policy(&pcb, Out, &flow_sel(&flow1)),
        CacheHint::No
    );
    assert_eq!(
        g.ipsec.check_policy(&pcb, Out, &flow_sel(&flow2)),
        CacheHint::Maybe
    );

    // The inbound slot is separate.
    assert_eq!(
        g.ipsec.check_policy(&pcb, In, &flow_sel(&flow1)),
        CacheHint::Maybe
    );

    g.ipsec.output(Some(&mut pcb), &flow2, &mut pkt, now).unwrap();
    incr!(g, ["pcb_cache_miss", "out_bypass", "out_success"]);
    assert_eq!(
        g.ipsec.check_policy(&pcb, Out, &flow_sel(&flow1)),
        CacheHint::Maybe
    );
}

// An IPsec policy caches as YES.
#[test]
fn ipsec_policy_hint() {
    let mut g = IpsecAndState::default();
    let now = Moment::now();
    let mut pcb = PcbPolicy::new(false);
    let flow = tcp4("10.0.0.7", 33000, "10.0.1.5", 443);

    let spec = ipsec_policy(
        Out,
        sel("0.0.0.0/0", "10.0.1.0/24"),
        vec![transport(SecProto::Esp, Level::Use)],
    );
    g.ipsec.spd_insert(&spec, now).unwrap();
    incr!(g, ["spd_insert", "generation"]);

    // At the USE level a missing SA means the packet goes out without
    // the step, though key management is still asked for one.
    let mut pkt = vec![0; 8];
    let res = g.ipsec.output(Some(&mut pcb), &flow, &mut pkt, now);
    match res {
        Ok(OutputAction::Protected(sas)) => assert!(sas.is_empty()),
        res => panic!("unexpected result: {res:?}"),
    }
    incr!(g, ["pcb_cache_miss", "acquire_sent", "out_success"]);
    assert_eq!(
        g.ipsec.check_policy(&pcb, Out, &flow_sel(&flow)),
        CacheHint::Yes
    );
}

// The socket's own policy takes precedence over the SPD and the
// cache, and its hint never goes stale.
#[test]
fn socket_policy_overrides_spd() {
    let mut g = IpsecAndState::default();
    let now = Moment::now();
    let mut pcb = PcbPolicy::new(false);
    let flow = tcp4("10.0.0.7", 33000, "10.0.1.5", 443);
    let fsel = flow_sel(&flow);

    g.ipsec.spd_insert(&bypass_subnet(), now).unwrap();
    incr!(g, ["spd_insert", "generation"]);

    let esp = transport(SecProto::Esp, Level::Require);
    let bytes = PcbPolicySpec::ipsec(vec![esp.clone()]).to_bytes().unwrap();
    g.ipsec.pcb_set_policy(&mut pcb, Out, &bytes, now).unwrap();
    assert_eq!(g.ipsec.pcb_get_policy(&pcb, Out).unwrap(), bytes);
    assert_eq!(g.ipsec.check_policy(&pcb, Out, &fsel), CacheHint::Yes);

    let mut pkt = vec![0; 8];
    let res = g.ipsec.output(Some(&mut pcb), &flow, &mut pkt, now);
    let sai = sai_for(&esp, &flow);
    assert_eq!(res.unwrap_err(), IpsecError::NoSecurityAssociation(sai));
    incr!(g, ["acquire_sent", "out_nosa"]);

    g.ipsec.spd_flush();
    incr!(g, ["spd_flush", "generation"]);
    assert_eq!(g.ipsec.check_policy(&pcb, Out, &fsel), CacheHint::Yes);

    // Handing the decision back to the SPD.
    let entrust = PcbPolicySpec::entrust().to_bytes().unwrap();
    g.ipsec.pcb_set_policy(&mut pcb, Out, &entrust, now).unwrap();
    assert_eq!(g.ipsec.check_policy(&pcb, Out, &fsel), CacheHint::Maybe);
    let res = g.ipsec.output(Some(&mut pcb), &flow, &mut pkt, now);
    assert!(matches!(res, Err(IpsecError::PolicyViolation { .. })));
    incr!(g, ["pcb_cache_miss", "spd_lookup_miss", "out_polvio"]);
}

// Only a privileged socket may opt out of IPsec.
#[test]
fn socket_bypass() {
    let mut g = IpsecAndState::default();
    let now = Moment::now();
    let flow = tcp4("10.0.0.7", 33000, "10.0.1.5", 443);
    let bypass = PcbPolicySpec::bypass().to_bytes().unwrap();

    let mut pcb = PcbPolicy::new(false);
    assert_eq!(
        g.ipsec.pcb_set_policy(&mut pcb, Out, &bypass, now),
        Err(SpdError::PermissionDenied)
    );
    assert!(pcb.policy(Out).is_none());

    let mut pcb = PcbPolicy::new(true);
    g.ipsec.pcb_set_policy(&mut pcb, Out, &bypass, now).unwrap();
    assert_eq!(
        g.ipsec.check_policy(&pcb, Out, &flow_sel(&flow)),
        CacheHint::No
    );

    // The SPD is empty and its default is DISCARD, yet out it goes.
    let mut pkt = vec![0; 8];
    let res = g.ipsec.output(Some(&mut pcb), &flow, &mut pkt, now);
    assert!(matches!(res, Ok(OutputAction::Clear)));
    incr!(g, ["out_bypass", "out_success"]);

    // The inbound side is unaffected.
    let res = g.ipsec.input(Some(&mut pcb), &flow, &[], &mut pkt, now);
    assert!(matches!(res, Err(IpsecError::PolicyViolation { .. })));
    incr!(g, ["pcb_cache_miss", "spd_lookup_miss", "in_polvio"]);
}

// DISCARD and NONE make no sense on a socket; neither does a policy
// for both directions at once.
#[test]
fn socket_policy_rejects() {
    let g = IpsecAndState::default();
    let now = Moment::now();
    let mut pcb = PcbPolicy::new(true);

    for kind in [PolicyKind::Discard, PolicyKind::None] {
        let bytes =
            PcbPolicySpec { kind, requests: vec![] }.to_bytes().unwrap();
        assert!(matches!(
            g.ipsec.pcb_set_policy(&mut pcb, In, &bytes, now),
            Err(SpdError::InvalidPolicy(_))
        ));
    }

    let entrust = PcbPolicySpec::entrust().to_bytes().unwrap();
    assert!(matches!(
        g.ipsec.pcb_set_policy(&mut pcb, Any, &entrust, now),
        Err(SpdError::InvalidPolicy(_))
    ));

    assert!(matches!(
        g.ipsec.pcb_set_policy(&mut pcb, In, &[0xff, 0xff, 0xff], now),
        Err(SpdError::DeserPolicy(_))
    ));

    // An IPsec socket policy must carry a chain.
    let empty = PcbPolicySpec::ipsec(vec![]).to_bytes().unwrap();
    assert!(matches!(
        g.ipsec.pcb_set_policy(&mut pcb, In, &empty, now),
        Err(SpdError::InvalidPolicy(_))
    ));

    assert!(pcb.policy(In).is_none());
    assert_eq!(g.ipsec.pcb_get_policy(&pcb, In).unwrap(), entrust);
}
