//! The interprocedural CFG: the constructed call graph plus its query
//! surface.  Queries never mutate the graph and never fail; unknown handles
//! yield empty results.

use std::cell::RefCell;

use derive_more::Display;

use std::collections::BTreeMap as Map;

use crate::commons::{MaybeOwned, Soundness};
use crate::middle_end::analysis::points_to::{PointerAnalysisType, PointsToInfo};
use crate::middle_end::analysis::type_hierarchy::TypeHierarchy;
use crate::middle_end::analysis::Cfg;
use crate::middle_end::irdb::{InstRef, IrDb};
use crate::middle_end::lir::*;

use super::builder::Builder;
use super::{resolver, CallGraph, CallGraphAnalysisType};

/// Key of the adjacency object in the JSON rendering.
pub const CG_JSON_KEY: &str = "CallGraph";

#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct IcfgError(pub String);
impl std::error::Error for IcfgError {}

pub struct Icfg<'db> {
    irdb: &'db IrDb,
    th: Option<MaybeOwned<'db, TypeHierarchy>>,
    pt: Option<MaybeOwned<'db, RefCell<PointsToInfo>>>,
    call_graph: CallGraph,
    indirect_calls: Map<InstId, usize>,
}

impl<'db> Icfg<'db> {
    /// Construct the call graph for `irdb` with the given algorithm, rooted
    /// at `entry_points`.  The type hierarchy and points-to oracle are
    /// borrowed when supplied and constructed on demand otherwise;
    /// `pa_type` selects the on-demand pointer analysis for OTF.
    ///
    /// `include_globals` synthesizes the globals-constructor model as the
    /// sole root and requires a single-module database.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        irdb: &'db mut IrDb,
        cg_type: CallGraphAnalysisType,
        entry_points: &[String],
        th: Option<&'db TypeHierarchy>,
        pt: Option<&'db RefCell<PointsToInfo>>,
        pa_type: PointerAnalysisType,
        soundness: Soundness,
        include_globals: bool,
    ) -> Result<Self, IcfgError> {
        if cg_type == CallGraphAnalysisType::Invalid {
            return Err(IcfgError(
                "'invalid' is not a valid call-graph analysis".to_string(),
            ));
        }
        if pa_type == PointerAnalysisType::Invalid {
            return Err(IcfgError(
                "'invalid' is not a valid pointer analysis".to_string(),
            ));
        }
        if soundness == Soundness::Invalid {
            return Err(IcfgError(
                "'invalid' is not a valid soundness level".to_string(),
            ));
        }

        let user_entry_points = Builder::collect_entry_points(irdb, entry_points);

        let globals_model = if include_globals {
            if irdb.num_modules() != 1 {
                return Err(IcfgError(
                    "global-constructor modeling requires a single-module analysis".to_string(),
                ));
            }
            Some(irdb.build_runtime_globals_model(&user_entry_points))
        } else {
            None
        };

        // construction only reads from here on
        let irdb: &'db IrDb = irdb;

        let th = match th {
            Some(th) => Some(MaybeOwned::Borrowed(th)),
            None if cg_type != CallGraphAnalysisType::NoResolve => {
                Some(MaybeOwned::Owned(Box::new(TypeHierarchy::new(irdb))))
            }
            None => None,
        };
        let pt = match pt {
            Some(pt) => Some(MaybeOwned::Borrowed(pt)),
            None if cg_type == CallGraphAnalysisType::OTF => Some(MaybeOwned::Owned(Box::new(
                RefCell::new(PointsToInfo::new(irdb, pa_type)),
            ))),
            None => None,
        };

        // the resolver lives exactly as long as the construction
        let (call_graph, indirect_calls) = {
            let th_ref = th.as_ref().map(|t| &**t);
            let pt_ref = pt.as_ref().map(|p| &**p);
            let res = resolver::create(cg_type, irdb, th_ref, pt_ref, soundness);
            let mut builder = Builder::new(irdb, th_ref, res, user_entry_points);
            builder.init_work_list(globals_model);
            let call_graph = builder.build_call_graph(soundness);
            (call_graph, builder.indirect_calls)
        };

        Ok(Icfg {
            irdb,
            th,
            pt,
            call_graph,
            indirect_calls,
        })
    }

    pub fn call_graph(&self) -> &CallGraph {
        &self.call_graph
    }

    pub fn irdb(&self) -> &IrDb {
        self.irdb
    }

    pub fn type_hierarchy(&self) -> Option<&TypeHierarchy> {
        self.th.as_ref().map(|t| &**t)
    }

    pub fn points_to_info(&self) -> Option<&RefCell<PointsToInfo>> {
        self.pt.as_ref().map(|p| &**p)
    }

    // SECTION: queries

    /// Every function in the database, not only the reachable ones.
    pub fn get_all_functions(&self) -> Vec<FuncId> {
        self.irdb.get_all_functions()
    }

    pub fn get_function(&self, name: &str) -> Option<FuncId> {
        self.irdb.get_function(name)
    }

    /// Whether `n` is a call through a pointer that does not directly name a
    /// database function.
    pub fn is_indirect_function_call(&self, n: &InstId) -> bool {
        match self.irdb.instruction(n) {
            Some(InstRef::Term(Terminal::CallIndirect { callee, .. })) => {
                !(callee.scope().is_none() && self.irdb.get_function(callee.name()).is_some())
            }
            _ => false,
        }
    }

    pub fn is_virtual_function_call(&self, n: &InstId) -> bool {
        match self.type_hierarchy() {
            Some(th) => resolver::is_virtual_call(self.irdb, th, n),
            None => false,
        }
    }

    /// The possible callees recorded for the call site `n`.
    pub fn get_callees_of_call_at(&self, n: &InstId) -> Vec<FuncId> {
        if !matches!(self.irdb.instruction(n), Some(r) if r.is_call()) {
            return vec![];
        }
        let Some(v) = self.call_graph.vertex_of(&n.func) else {
            return vec![];
        };
        self.call_graph
            .out_edges(v)
            .filter(|e| e.site == *n)
            .map(|e| self.call_graph.func(e.callee).clone())
            .collect()
    }

    /// The call sites that may reach `f`; the calling function is
    /// recoverable from each site.
    pub fn get_callers_of(&self, f: &FuncId) -> Vec<InstId> {
        let Some(v) = self.call_graph.vertex_of(f) else {
            return vec![];
        };
        self.call_graph.in_edges(v).map(|e| e.site.clone()).collect()
    }

    /// Every call-like site in `f`, in program order.  Purely syntactic.
    pub fn get_calls_from_within(&self, f: &FuncId) -> Vec<InstId> {
        let Some(def) = self.irdb.function_body(f) else {
            return vec![];
        };
        let mut sites = vec![];
        for (bbid, bb) in &def.body {
            for (idx, inst) in bb.insts.iter().enumerate() {
                if inst.is_call() {
                    sites.push(inst_id(f.clone(), bbid.clone(), idx));
                }
            }
            if bb.term.is_call() {
                sites.push(inst_id(f.clone(), bbid.clone(), bb.insts.len()));
            }
        }
        sites
    }

    /// The intra-procedural successors of the call at `n`.  Normal and
    /// exceptional return form a single successor set; LIR calls carry no
    /// unwind edge, so nothing is lost by the merge.
    pub fn get_return_sites_of_call_at(&self, n: &InstId) -> Vec<InstId> {
        self.get_succs_of(n)
    }

    pub fn get_succs_of(&self, n: &InstId) -> Vec<InstId> {
        let Some(def) = self.irdb.function_body(&n.func) else {
            return vec![];
        };
        let Some(bb) = def.body.get(&n.bb) else {
            return vec![];
        };
        if n.idx < bb.insts.len() {
            return vec![inst_id(n.func.clone(), n.bb.clone(), n.idx + 1)];
        }
        // a terminal's successors are the first instructions of its
        // successor blocks, per the function's CFG
        let cfg = Cfg::new(def);
        cfg.succ(&n.bb)
            .map(|succ| inst_id(n.func.clone(), succ.clone(), 0))
            .collect()
    }

    /// Every instruction that is neither call-like nor the start node of its
    /// function.
    pub fn all_non_call_start_nodes(&self) -> Vec<InstId> {
        let mut nodes = vec![];
        for def in self.irdb.definitions() {
            let start = inst_id(def.id.clone(), bb_id("entry"), 0);
            for (bbid, bb) in &def.body {
                for (idx, inst) in bb.insts.iter().enumerate() {
                    let n = inst_id(def.id.clone(), bbid.clone(), idx);
                    if !inst.is_call() && n != start {
                        nodes.push(n);
                    }
                }
                let n = inst_id(def.id.clone(), bbid.clone(), bb.insts.len());
                if !bb.term.is_call() && n != start {
                    nodes.push(n);
                }
            }
        }
        nodes
    }

    /// The functions that have a vertex: the reachable set.
    pub fn get_all_vertex_functions(&self) -> Vec<FuncId> {
        self.call_graph
            .vertices()
            .map(|(_, v)| v.func.clone())
            .collect()
    }

    /// The final target count of a recorded indirect site.
    pub fn num_indirect_call_targets(&self, n: &InstId) -> Option<usize> {
        self.indirect_calls.get(n).copied()
    }

    /// All recorded indirect sites with their final target counts.
    pub fn indirect_calls(&self) -> &Map<InstId, usize> {
        &self.indirect_calls
    }

    // SECTION: rendering

    pub fn as_dot(&self) -> String {
        let mut out = String::from("digraph CallGraph{\n");
        for (vid, v) in self.call_graph.vertices() {
            out.push_str(&format!("{vid}[label=\"{}\"];\n", escape(v.func.name())));
            for e in self.call_graph.out_edges(vid) {
                out.push_str(&format!(
                    "{vid}->{}[label=\"{}\"];\n",
                    e.callee,
                    escape(&self.stable_site_string(&e.site))
                ));
            }
        }
        out.push_str("}\n");
        out
    }

    pub fn as_json(&self) -> serde_json::Value {
        let mut adjacency = serde_json::Map::new();
        for (vid, v) in self.call_graph.vertices() {
            let callees: Vec<serde_json::Value> = self
                .call_graph
                .out_edges(vid)
                .map(|e| {
                    serde_json::Value::String(self.call_graph.func(e.callee).name().to_string())
                })
                .collect();
            adjacency.insert(v.func.name().to_string(), serde_json::Value::Array(callees));
        }

        let mut root = serde_json::Map::new();
        root.insert(
            CG_JSON_KEY.to_string(),
            serde_json::Value::Object(adjacency),
        );
        serde_json::Value::Object(root)
    }

    pub fn as_text(&self) -> String {
        let mut out = String::new();
        for e in self.call_graph.edges() {
            out.push_str(&format!(
                "{} -> {} [{}]\n",
                self.call_graph.func(e.caller),
                self.call_graph.func(e.callee),
                self.stable_site_string(&e.site)
            ));
        }
        out
    }

    // The stable text of the call instruction behind a site.
    fn stable_site_string(&self, site: &InstId) -> String {
        match self.irdb.instruction(site) {
            Some(r) => r.to_string(),
            None => site.to_string(),
        }
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
