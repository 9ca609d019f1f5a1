//! Dispatchers: named classifiers owning an ordered rule list.

use std::sync::Arc;

use crate::rule::{Rule, RuleDraft};
use crate::types::PacketContext;
use crate::zone::Zone;

/// A frozen dispatcher inside a snapshot. Rules are ordered by strictly
/// increasing id; evaluation is first match wins.
#[derive(Debug)]
pub struct Dispatcher {
    name: String,
    instance_id: u32,
    alloc_rules: u32,
    rules: Vec<Rule>,
}

impl Dispatcher {
    pub(crate) fn new(name: String, instance_id: u32, alloc_rules: u32, rules: Vec<Rule>) -> Self {
        Self {
            name,
            instance_id,
            alloc_rules,
            rules,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    /// Rule slots declared at creation time.
    pub fn alloc_rules(&self) -> u32 {
        self.alloc_rules
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// First rule in id order matching the packet, if any.
    pub fn eval(
        &self,
        pkt: &PacketContext,
        src_zones: &[Arc<Zone>],
        dst_zones: &[Arc<Zone>],
    ) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|rule| rule.matches(pkt, src_zones, dst_zones))
    }

    /// Back to staging form, for carrying into a new snapshot.
    pub(crate) fn draft(&self) -> DispatcherDraft {
        DispatcherDraft {
            name: self.name.clone(),
            instance_id: self.instance_id,
            alloc_rules: self.alloc_rules,
            rules: self.rules.iter().map(Rule::draft).collect(),
        }
    }
}

/// A staged dispatcher, mutable until commit.
#[derive(Debug, Clone)]
pub(crate) struct DispatcherDraft {
    pub name: String,
    pub instance_id: u32,
    pub alloc_rules: u32,
    pub rules: Vec<RuleDraft>,
}

impl DispatcherDraft {
    pub fn rule_mut(&mut self, id: u32) -> Option<&mut RuleDraft> {
        self.rules.iter_mut().find(|r| r.id == id)
    }

    pub fn last_rule_id(&self) -> Option<u32> {
        self.rules.last().map(|r| r.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleEntries;
    use crate::service::{Service, ServiceKind, SessionCounter};
    use crate::types::{Iface, PortRange};

    fn service(name: &str) -> Arc<Service> {
        Arc::new(Service::new(
            1,
            1,
            name.to_owned(),
            0,
            ServiceKind::Proxy,
            SessionCounter::default(),
        ))
    }

    fn pkt(dst_port: u16) -> PacketContext {
        PacketContext {
            ingress: Iface::new("eth0", 0),
            egress: None,
            proto: 6,
            src: "10.0.0.1".parse().unwrap(),
            src_port: 1234,
            dst: "192.0.2.1".parse().unwrap(),
            dst_port,
            reqids: Vec::new(),
        }
    }

    fn port_rule(id: u32, svc: &str, from: u16, to: u16) -> Rule {
        let entries = RuleEntries {
            dst_port: vec![PortRange::new(from, to).unwrap()],
            ..RuleEntries::default()
        };
        Rule {
            id,
            service: service(svc),
            entries,
        }
    }

    #[test]
    fn first_match_in_id_order_wins() {
        // rules 1 and 2 both match port 80; rule 1 must win
        let d = Dispatcher::new(
            "d".to_owned(),
            1,
            2,
            vec![port_rule(1, "narrow", 80, 80), port_rule(2, "wide", 1, 1024)],
        );
        let hit = d.eval(&pkt(80), &[], &[]).unwrap();
        assert_eq!(hit.id, 1);
        assert_eq!(hit.service.name(), "narrow");

        // only rule 2 matches port 443
        let hit = d.eval(&pkt(443), &[], &[]).unwrap();
        assert_eq!(hit.id, 2);
    }

    #[test]
    fn no_rule_matches_yields_none() {
        let d = Dispatcher::new("d".to_owned(), 1, 1, vec![port_rule(1, "web", 80, 80)]);
        assert!(d.eval(&pkt(8080), &[], &[]).is_none());
    }

    #[test]
    fn draft_preserves_rule_order() {
        let d = Dispatcher::new(
            "d".to_owned(),
            1,
            2,
            vec![port_rule(3, "a", 1, 2), port_rule(9, "b", 3, 4)],
        );
        let draft = d.draft();
        let ids: Vec<u32> = draft.rules.iter().map(|r| r.id).collect();
        assert_eq!(ids, [3, 9]);
        assert_eq!(draft.alloc_rules, 2);
    }
}
