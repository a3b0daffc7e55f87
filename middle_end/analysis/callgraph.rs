//! Whole-program call-graph construction and queries.
//!
//! The graph itself is two flat arrays (vertices and edges) addressed by
//! integer indices, so growing it during construction never invalidates a
//! handle.  Multi-edges are allowed as long as they carry distinct call
//! sites; the `(caller, callee, site)` triple is unique.

pub mod builder;
pub mod icfg;
pub mod resolver;

#[cfg(test)]
mod tests;

use std::fmt;
use std::str::FromStr;

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::middle_end::lir::{FuncId, InstId};

pub use icfg::{Icfg, IcfgError};
pub use resolver::Resolver;

/// The call-graph algorithm to construct with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallGraphAnalysisType {
    NoResolve,
    CHA,
    RTA,
    DTA,
    VTA,
    OTF,
    // parseable, but rejected at configuration time
    Invalid,
}

impl fmt::Display for CallGraphAnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CallGraphAnalysisType::NoResolve => "noresolve",
            CallGraphAnalysisType::CHA => "cha",
            CallGraphAnalysisType::RTA => "rta",
            CallGraphAnalysisType::DTA => "dta",
            CallGraphAnalysisType::VTA => "vta",
            CallGraphAnalysisType::OTF => "otf",
            CallGraphAnalysisType::Invalid => "invalid",
        };
        write!(f, "{s}")
    }
}

impl FromStr for CallGraphAnalysisType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s {
            "noresolve" => CallGraphAnalysisType::NoResolve,
            "cha" => CallGraphAnalysisType::CHA,
            "rta" => CallGraphAnalysisType::RTA,
            "dta" => CallGraphAnalysisType::DTA,
            "vta" => CallGraphAnalysisType::VTA,
            "otf" => CallGraphAnalysisType::OTF,
            "invalid" => CallGraphAnalysisType::Invalid,
            _ => return Err(format!("unknown call-graph analysis: {s}")),
        };

        Ok(ty)
    }
}

pub type VertexId = usize;

#[derive(Clone, Debug)]
pub struct Vertex {
    pub func: FuncId,
    out_edges: Vec<usize>,
    in_edges: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Edge {
    pub caller: VertexId,
    pub callee: VertexId,
    pub site: InstId,
}

#[derive(Clone, Debug, Default)]
pub struct CallGraph {
    vertices: Vec<Vertex>,
    edges: Vec<Edge>,
    function_vertex_map: Map<FuncId, VertexId>,
    // duplicate suppression for (caller, callee, site) triples
    edge_index: Set<(VertexId, VertexId, InstId)>,
}

impl CallGraph {
    pub fn new() -> Self {
        CallGraph::default()
    }

    /// The vertex of `f`, created on first request.  Vertices are never
    /// removed.
    pub fn get_or_add_vertex(&mut self, f: &FuncId) -> VertexId {
        if let Some(&v) = self.function_vertex_map.get(f) {
            return v;
        }
        let v = self.vertices.len();
        self.vertices.push(Vertex {
            func: f.clone(),
            out_edges: vec![],
            in_edges: vec![],
        });
        self.function_vertex_map.insert(f.clone(), v);
        v
    }

    pub fn vertex_of(&self, f: &FuncId) -> Option<VertexId> {
        self.function_vertex_map.get(f).copied()
    }

    /// Append an edge.  A second call with an identical `(caller, callee,
    /// site)` triple is a no-op; returns whether the edge was added.
    pub fn add_edge(&mut self, caller: VertexId, callee: VertexId, site: InstId) -> bool {
        if !self
            .edge_index
            .insert((caller, callee, site.clone()))
        {
            return false;
        }
        let e = self.edges.len();
        self.edges.push(Edge {
            caller,
            callee,
            site,
        });
        self.vertices[caller].out_edges.push(e);
        self.vertices[callee].in_edges.push(e);
        true
    }

    pub fn func(&self, v: VertexId) -> &FuncId {
        &self.vertices[v].func
    }

    pub fn out_edges(&self, v: VertexId) -> impl Iterator<Item = &Edge> {
        self.vertices[v].out_edges.iter().map(|&e| &self.edges[e])
    }

    pub fn in_edges(&self, v: VertexId) -> impl Iterator<Item = &Edge> {
        self.vertices[v].in_edges.iter().map(|&e| &self.edges[e])
    }

    pub fn vertices(&self) -> impl Iterator<Item = (VertexId, &Vertex)> {
        self.vertices.iter().enumerate()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }
}
