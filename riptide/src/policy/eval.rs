// Riptide: Compiling Network Policies into Flow-Table Updates
// Copyright (C) 2021  Tibor Schneider
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Module containing the interpreter of policies

use super::Policy;
use crate::classifier::{Sink, Trace};
use crate::packet::{Packet, PacketSet, INPORT, OUTPORT};

use log::*;

impl Policy {
    /// Evaluate the policy on a single packet. Packets sent to the controller or to buckets are
    /// not part of the result.
    pub fn eval(&self, pkt: &Packet) -> PacketSet {
        self.eval_traced(pkt, &mut Trace::new())
    }

    /// Evaluate the policy on a single packet, recording every packet that reaches a sink.
    pub fn eval_traced(&self, pkt: &Packet, trace: &mut Trace) -> PacketSet {
        match self {
            Policy::Identity => single(pkt.clone()),
            Policy::Drop => PacketSet::new(),
            Policy::Match(m) => {
                if m.eval(pkt) {
                    single(pkt.clone())
                } else {
                    PacketSet::new()
                }
            }
            Policy::Modify(fields) => single(pkt.modify_many(fields)),
            Policy::Controller => {
                trace.push((Sink::Controller, pkt.clone()));
                PacketSet::new()
            }
            Policy::Bucket(b) => {
                trace.push((Sink::Bucket(b.clone()), pkt.clone()));
                PacketSet::new()
            }
            Policy::Push(fields) => {
                single(fields.iter().fold(pkt.clone(), |p, (h, v)| p.push(h, v.clone())))
            }
            Policy::Pop(fields) => single(fields.iter().fold(pkt.clone(), |p, h| p.pop(h))),
            Policy::Move(pairs) => {
                single(pairs.iter().fold(pkt.clone(), |p, (dst, src)| p.move_field(dst, src)))
            }
            Policy::Negate(p) => {
                if p.eval_traced(pkt, trace).is_empty() {
                    single(pkt.clone())
                } else {
                    PacketSet::new()
                }
            }
            Policy::Union(ps) | Policy::Parallel(ps) => {
                ps.iter().flat_map(|p| p.eval_traced(pkt, trace)).collect()
            }
            Policy::Intersection(ps) | Policy::Sequential(ps) => eval_sequence(ps.iter(), pkt, trace),
            Policy::Difference(p, q) => {
                if q.eval_traced(pkt, trace).is_empty() {
                    p.eval_traced(pkt, trace)
                } else {
                    PacketSet::new()
                }
            }
            Policy::If(pred, t, f) => {
                if pred.eval_traced(pkt, trace).is_empty() {
                    f.eval_traced(pkt, trace)
                } else {
                    t.eval_traced(pkt, trace)
                }
            }
            Policy::Fwd(port) => single(pkt.clone().with(OUTPORT, *port)),
            Policy::XFwd(port) => {
                if pkt.get_int(INPORT) == Some(*port) {
                    PacketSet::new()
                } else {
                    single(pkt.clone().with(OUTPORT, *port))
                }
            }
            Policy::MatchModify(field, from, to) => {
                if pkt.get(field).map(|v| from.accepts(v)).unwrap_or_else(|| from.is_absent()) {
                    single(pkt.modify(field, to.clone()))
                } else {
                    single(pkt.clone())
                }
            }
            Policy::Dynamic(d) => d.policy().eval_traced(pkt, trace),
            Policy::Recurse(r) => match r.upgrade() {
                Some(d) => d.policy().eval_traced(pkt, trace),
                None => {
                    warn!("Recursive reference to a dropped dynamic policy");
                    PacketSet::new()
                }
            },
        }
    }
}

fn single(pkt: Packet) -> PacketSet {
    let mut set = PacketSet::new();
    set.insert(pkt);
    set
}

/// Feed the output of every policy into the next one
fn eval_sequence<'a, I>(policies: I, pkt: &Packet, trace: &mut Trace) -> PacketSet
where
    I: Iterator<Item = &'a Policy>,
{
    policies.fold(single(pkt.clone()), |input, p| {
        input.iter().flat_map(|k| p.eval_traced(k, trace)).collect()
    })
}
