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

//! Module for printing policies in a human readable form

use super::Policy;

use std::fmt;

fn write_list(f: &mut fmt::Formatter<'_>, name: &str, ps: &[Policy], sep: &str) -> fmt::Result {
    if ps.len() == 1 {
        return write!(f, "{}({})", name, ps[0]);
    }
    write!(f, "(")?;
    for (i, p) in ps.iter().enumerate() {
        if i > 0 {
            write!(f, " {} ", sep)?;
        }
        write!(f, "{}", p)?;
    }
    write!(f, ")")
}

fn write_fields<I>(f: &mut fmt::Formatter<'_>, name: &str, fields: I) -> fmt::Result
where
    I: Iterator<Item = String>,
{
    write!(f, "{}(", name)?;
    for (i, s) in fields.enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", s)?;
    }
    write!(f, ")")
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Identity => write!(f, "identity"),
            Policy::Drop => write!(f, "drop"),
            Policy::Match(m) => write!(f, "{}", m),
            Policy::Modify(fields) => {
                write_fields(f, "modify", fields.iter().map(|(k, v)| format!("{}={}", k, v)))
            }
            Policy::Controller => write!(f, "Controller"),
            Policy::Bucket(b) => write!(f, "{:?}", b),
            Policy::Push(fields) => {
                write_fields(f, "push", fields.iter().map(|(k, v)| format!("{}={}", k, v)))
            }
            Policy::Pop(fields) => write_fields(f, "pop", fields.iter().cloned()),
            Policy::Move(pairs) => write_fields(
                f,
                "move",
                pairs.iter().map(|(dst, src)| format!("{}<-{}", dst, src)),
            ),
            Policy::Negate(p) => write!(f, "~{}", p),
            Policy::Union(ps) => write_list(f, "union", ps, "|"),
            Policy::Intersection(ps) => write_list(f, "intersection", ps, "&"),
            Policy::Difference(p, q) => write!(f, "({} - {})", p, q),
            Policy::Parallel(ps) => write_list(f, "parallel", ps, "+"),
            Policy::Sequential(ps) => write_list(f, "sequential", ps, ">>"),
            Policy::If(p, t, e) => write!(f, "if_({}, {}, {})", p, t, e),
            Policy::Fwd(port) => write!(f, "fwd({})", port),
            Policy::XFwd(port) => write!(f, "xfwd({})", port),
            Policy::MatchModify(field, from, to) => {
                write!(f, "match_modify({}, {}, {})", field, from, to)
            }
            Policy::Dynamic(d) => write!(f, "[{}] {}", d.name(), d.policy()),
            Policy::Recurse(r) => write!(f, "{:?}", r),
        }
    }
}
