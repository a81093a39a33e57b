// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Build an IPsec engine from a policy file.
//!
//! A policy file is TOML of the form:
//!
//! ```toml
//! [config]
//! default_policy = "discard"
//!
//! [[policies]]
//! dir = "out"
//! selector = { src = "10.0.0.0/24", dst = "0.0.0.0/0" }
//! disposition = "ipsec"
//! requests = [{ proto = "esp", mode = "tunnel", dst = "203.0.113.1" }]
//!
//! [[sas]]
//! dst = "203.0.113.1"
//! peer = "10.0.0.7"
//! proto = "esp"
//! mode = "tunnel"
//! spi = 4096
//! ```
//!
//! Every section is optional.

use anyhow::Context;
use anyhow::anyhow;
use serde::Deserialize;
use slog::Logger;
use spd::api::DefaultPolicy;
use spd::api::Direction;
use spd::api::FlowId;
use spd::api::IpsecCfg;
use spd::api::PolicyDump;
use spd::api::PolicySpec;
use spd::api::SaSpec;
use spd::api::Selector;
use spd::engine::acquire::NoKeyManager;
use spd::engine::ipsec::Ipsec;
use spd::engine::ipsec::IpsecError;
use spd::engine::ipsec::OutputAction;
use spd::engine::sad::MemSad;
use spd::engine::sad::SecurityAssociationDb;
use spd::engine::xform::NullXform;
use spd::print::sa_chain;
use spd::sys::time::Moment;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SpdFile {
    pub config: IpsecCfg,
    pub policies: Vec<PolicySpec>,
    pub sas: Vec<SaSpec>,
}

impl SpdFile {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("failed to parse policy file")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&s)
    }
}

/// What the SPD says about a selector.
#[derive(Debug)]
pub enum LookupResult {
    Policy(PolicyDump),
    Default(DefaultPolicy),
}

/// An engine loaded from a policy file, with an in-memory SAD, no
/// transforms, and nobody listening for acquires.
pub struct SpdAdm {
    pub ipsec: Ipsec,
    pub sad: Arc<MemSad>,
}

impl SpdAdm {
    pub fn build(
        file: SpdFile,
        log: Logger,
        now: Moment,
    ) -> anyhow::Result<Self> {
        let sad = Arc::new(MemSad::new());
        let ipsec = Ipsec::spd_init(
            file.config,
            log,
            Arc::clone(&sad) as Arc<dyn SecurityAssociationDb>,
            Arc::new(NullXform),
            Arc::new(NoKeyManager),
        )
        .map_err(|e| anyhow!("failed to create IPsec stats: {e}"))?;

        for (i, spec) in file.policies.iter().enumerate() {
            ipsec
                .spd_insert(spec, now)
                .with_context(|| format!("policy #{i} ({})", spec.selector))?;
        }

        for (i, spec) in file.sas.into_iter().enumerate() {
            let spi = spec.spi;
            ipsec
                .sa_install(spec, now)
                .with_context(|| format!("SA #{i} (SPI {spi:#x})"))?;
        }

        Ok(Self { ipsec, sad })
    }

    pub fn lookup(
        &self,
        dir: Direction,
        sel: &Selector,
        now: Moment,
    ) -> LookupResult {
        // Report the policy as the dump shows it, without our own
        // reference counted against it.
        let found = self.ipsec.spd_lookup(dir, sel, now).and_then(|p| {
            let id = p.id();
            drop(p);
            let policies = self.ipsec.spd_dump(now).policies;
            policies.into_iter().find(|d| d.id == id)
        });

        match found {
            Some(dump) => LookupResult::Policy(dump),
            None => LookupResult::Default(self.ipsec.spd().default_policy()),
        }
    }

    /// Run an outbound packet of `flow` through the engine, returning
    /// a one-line description of its fate.
    pub fn dispatch(&self, flow: &FlowId, now: Moment) -> String {
        let mut pkt = vec![];
        match self.ipsec.output(None, flow, &mut pkt, now) {
            Ok(OutputAction::Clear) => "sent in the clear".to_string(),
            Ok(OutputAction::Protected(sas)) => {
                format!("sent protected: {}", sa_chain(&sas))
            }
            Err(e @ IpsecError::NoSecurityAssociation(_)) => {
                format!("held: {e}")
            }
            Err(e) => format!("dropped: {e}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use spd::api::Disposition;
    use spd::api::Protocol;

    const FILE: &str = r#"
        [config]
        default_policy = "discard"
        acquire_block_count = 3

        [[policies]]
        dir = "out"
        selector = { src = "10.0.0.0/24", dst = "0.0.0.0/0" }
        disposition = "ipsec"
        requests = [
            { proto = "esp", mode = "tunnel", level = "require", dst = "203.0.113.1" },
        ]

        [[policies]]
        id = 100
        dir = "any"
        selector = { src = "10.0.0.0/24", dst = "10.0.1.0/24", proto = "TCP", dst_port = 22 }
        disposition = "bypass"

        [[sas]]
        dst = "203.0.113.1"
        peer = "10.0.0.7"
        proto = "esp"
        mode = "tunnel"
        spi = 4096
    "#;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn flow(src: &str, dst: &str, dport: u16) -> FlowId {
        FlowId {
            proto: Protocol::TCP,
            src_ip: src.parse().unwrap(),
            src_port: 40000,
            dst_ip: dst.parse().unwrap(),
            dst_port: dport,
        }
    }

    #[test]
    fn load_file() {
        let file = SpdFile::parse(FILE).unwrap();
        assert_eq!(file.config.acquire_block_count, 3);
        assert_eq!(file.policies.len(), 2);
        assert_eq!(file.sas.len(), 1);

        let adm = SpdAdm::build(file, log(), Moment::now()).unwrap();
        assert_eq!(adm.ipsec.spd().len(), 2);
        assert_eq!(adm.sad.len(), 1);
    }

    #[test]
    fn empty_file() {
        let file = SpdFile::parse("").unwrap();
        assert_eq!(file.config, IpsecCfg::default());
        let adm = SpdAdm::build(file, log(), Moment::now()).unwrap();
        assert!(adm.ipsec.spd().is_empty());
    }

    #[test]
    fn bad_files() {
        let bad_cfg = "[config]\ndefault_policy = \"ipsec\"";
        assert!(SpdFile::parse(bad_cfg).is_err());

        // A selector mixing address families.
        let bad_sel = r#"
            [[policies]]
            dir = "out"
            selector = { src = "10.0.0.0/24", dst = "::/0" }
            disposition = "discard"
        "#;
        assert!(SpdFile::parse(bad_sel).is_err());

        // Parses, but won't build.
        let empty_chain = r#"
            [[policies]]
            dir = "out"
            selector = { src = "10.0.0.0/24", dst = "0.0.0.0/0" }
            disposition = "ipsec"
        "#;
        let file = SpdFile::parse(empty_chain).unwrap();
        let err = SpdAdm::build(file, log(), Moment::now()).err().unwrap();
        assert!(format!("{err:#}").starts_with("policy #0"));
    }

    #[test]
    fn lookup_and_dispatch() {
        let now = Moment::now();
        let file = SpdFile::parse(FILE).unwrap();
        let adm = SpdAdm::build(file, log(), now).unwrap();

        let ssh = flow("10.0.0.7", "10.0.1.5", 22);
        let sel = Selector::try_from(&ssh).unwrap();
        match adm.lookup(Direction::Out, &sel, now) {
            LookupResult::Policy(p) => {
                assert_eq!(p.id, 100);
                assert_eq!(p.disposition, Disposition::Bypass);
            }
            res => panic!("unexpected lookup result: {res:?}"),
        }
        assert_eq!(adm.dispatch(&ssh, now), "sent in the clear");

        let web = flow("10.0.0.7", "198.51.100.9", 443);
        assert_eq!(adm.dispatch(&web, now), "sent protected: ESP[0x00001000]");

        let other = flow("10.0.0.8", "198.51.100.9", 443);
        assert!(adm.dispatch(&other, now).starts_with("held: "));
        assert_eq!(adm.ipsec.acquires().len(), 1);

        let stray = flow("192.168.0.1", "198.51.100.9", 443);
        let sel = Selector::try_from(&stray).unwrap();
        assert!(matches!(
            adm.lookup(Direction::Out, &sel, now),
            LookupResult::Default(DefaultPolicy::Discard)
        ));
        assert!(adm.dispatch(&stray, now).starts_with("dropped: "));
    }
}
