use std::collections::BTreeSet;

use crate::message::Message;
use crate::node_addr::NodeAddr;

/// A membership view as published by the membership service: the ordered set
///  of endpoints that are currently part of the group. The delivery layer
///  uses it solely to prune connections to endpoints that left.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct View {
    members: BTreeSet<NodeAddr>,
}

impl View {
    pub fn new(members: impl IntoIterator<Item = NodeAddr>) -> View {
        View {
            members: members.into_iter().collect(),
        }
    }

    pub fn contains(&self, addr: &NodeAddr) -> bool {
        self.members.contains(addr)
    }

    pub fn members(&self) -> &BTreeSet<NodeAddr> {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// The events flowing through the layer, in both directions. `Message` is
///  what this layer actually works on; the rest is consumed locally and
///  forwarded unchanged.
#[derive(Clone, Debug)]
pub enum Event {
    Message(Message),
    ViewChange(View),
    SetLocalAddress(NodeAddr),
    Connect,
    Disconnect,
}
