//! Explicit handle registry replacing the source's weakly-held flow set
//! (spec.md §9 design note).
//!
//! A `Flow`'s lifetime is the handle's presence in the registry, not garbage
//! collection: `FlowRegistry::remove` is the explicit destroy.

use std::collections::HashMap;

use crate::flow::Flow;

/// Dense integer handle identifying a registered flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(u32);

/// Process-wide set of live flows.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    next_id: u32,
    flows: HashMap<FlowId, Flow>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow, returning its handle.
    pub fn insert(&mut self, flow: Flow) -> FlowId {
        let id = FlowId(self.next_id);
        self.next_id += 1;
        self.flows.insert(id, flow);
        id
    }

    pub fn get(&self, id: FlowId) -> Option<&Flow> {
        self.flows.get(&id)
    }

    pub fn get_mut(&mut self, id: FlowId) -> Option<&mut Flow> {
        self.flows.get_mut(&id)
    }

    /// Explicitly destroy a flow, dropping its endpoint controllers.
    pub fn remove(&mut self, id: FlowId) -> Option<Flow> {
        self.flows.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FlowId, &Flow)> {
        self.flows.iter().map(|(id, f)| (*id, f))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (FlowId, &mut Flow)> {
        self.flows.iter_mut().map(|(id, f)| (*id, f))
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{FlowSpec, Protocol};

    fn spec(name: &str) -> FlowSpec {
        FlowSpec {
            name: name.to_string(),
            receiver_host: "r".to_string(),
            sender_host: "s".to_string(),
            dest_addr: "10.0.0.1".parse().unwrap(),
            protocol: Protocol::Reliable,
            tos: "BE".to_string(),
            interval_secs: 0.5,
            duration_secs: 5,
            offered_load: None,
            window: "128K".to_string(),
            user: "root".to_string(),
        }
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let mut reg = FlowRegistry::new();
        let flow = Flow::new(&spec("A"), "iperf");
        let id = reg.insert(flow);
        assert!(reg.get(id).is_some());
        assert_eq!(reg.len(), 1);
        let removed = reg.remove(id);
        assert!(removed.is_some());
        assert!(reg.get(id).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn handles_are_distinct_and_increasing() {
        let mut reg = FlowRegistry::new();
        let id_a = reg.insert(Flow::new(&spec("A"), "iperf"));
        let id_b = reg.insert(Flow::new(&spec("B"), "iperf"));
        assert_ne!(id_a, id_b);
        assert!(id_a.0 < id_b.0);
    }
}
