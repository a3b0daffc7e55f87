//! The fixed-point call-graph builder.
//!
//! Functions are scanned at most once; every call site runs the resolver's
//! hook sequence; indirect sites are recorded and re-resolved after each
//! worklist drain until a full outer pass neither scans a new function nor
//! finds a new indirect target.

use tracing::{debug, error, info, warn};

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::commons::Soundness;
use crate::middle_end::analysis::type_hierarchy::TypeHierarchy;
use crate::middle_end::irdb::IrDb;
use crate::middle_end::lir::*;

use super::resolver::{self, Resolver};
use super::{CallGraph, VertexId};

pub(crate) struct Builder<'a> {
    irdb: &'a IrDb,
    th: Option<&'a TypeHierarchy>,
    res: Box<dyn Resolver + 'a>,
    visited_functions: Set<FuncId>,
    user_entry_points: Vec<FuncId>,
    // the worklist for direct callee resolution; duplicates are tolerated
    function_wl: Vec<FuncId>,
    // indirect call sites, mapped to the number of targets found so far;
    // fixpoint is not reached while more targets keep appearing
    pub(crate) indirect_calls: Map<InstId, usize>,
}

impl<'a> Builder<'a> {
    pub fn new(
        irdb: &'a IrDb,
        th: Option<&'a TypeHierarchy>,
        res: Box<dyn Resolver + 'a>,
        user_entry_points: Vec<FuncId>,
    ) -> Self {
        Builder {
            irdb,
            th,
            res,
            visited_functions: Set::new(),
            user_entry_points,
            function_wl: vec![],
            indirect_calls: Map::new(),
        }
    }

    /// Resolve the user-nominated entry points.  The single sentinel
    /// `__ALL__` selects every definition; unknown names warn and are
    /// skipped.
    pub fn collect_entry_points(irdb: &IrDb, entry_points: &[String]) -> Vec<FuncId> {
        if entry_points.len() == 1 && entry_points[0] == "__ALL__" {
            return irdb.definitions().map(|f| f.id.clone()).collect();
        }

        let mut entries = vec![];
        for name in entry_points {
            match irdb.get_function_definition(name) {
                Some(def) => entries.push(def.id.clone()),
                None => warn!("could not retrieve function for entry point '{name}'"),
            }
        }
        entries
    }

    /// Seed the worklist: the globals-constructor model when one was built,
    /// the user entries otherwise.
    pub fn init_work_list(&mut self, globals_model: Option<FuncId>) {
        match globals_model {
            Some(ctor) => self.function_wl.push(ctor),
            None => self
                .function_wl
                .extend(self.user_entry_points.iter().cloned()),
        }
    }

    pub fn build_call_graph(&mut self, _s: Soundness) -> CallGraph {
        info!("starting call-graph construction: {}", self.res.name());

        let mut callgraph = CallGraph::new();
        loop {
            let mut fixpoint_reached = true;

            while let Some(f) = self.function_wl.pop() {
                fixpoint_reached &= self.process_function(&mut callgraph, &f);
            }

            // Working on an indirect-calls delta would be faster, but the
            // points-to info mutates during traversal, so every recorded
            // site is re-checked each round.
            let sites: Vec<InstId> = self.indirect_calls.keys().cloned().collect();
            for site in sites {
                fixpoint_reached &= !self.construct_dynamic_call(&mut callgraph, &site);
            }

            if fixpoint_reached {
                break;
            }
        }

        for (site, targets) in &self.indirect_calls {
            if *targets == 0 {
                warn!("no callees found for call site {site}");
            }
        }
        info!(
            "call graph has been constructed: {} vertices, {} edges",
            callgraph.num_vertices(),
            callgraph.num_edges()
        );

        callgraph
    }

    // Scan one function.  Returns whether the scan kept the fixpoint (it did
    // not discover a new indirect site).
    fn process_function(&mut self, callgraph: &mut CallGraph, f: &FuncId) -> bool {
        debug!("walking in function {f}");
        let irdb = self.irdb;
        let Some(def) = irdb.function_body(f) else {
            debug!("function is only a declaration: {f}");
            return true;
        };
        if !self.visited_functions.insert(f.clone()) {
            debug!("function already visited: {f}");
            return true;
        }

        let this_vertex = callgraph.get_or_add_vertex(f);
        let mut fixpoint_reached = true;

        for (bbid, bb) in &def.body {
            for (idx, inst) in bb.insts.iter().enumerate() {
                let site = inst_id(f.clone(), bbid.clone(), idx);
                match inst {
                    Instruction::CallExt { ext_callee, .. } => {
                        self.res.pre_call(&site);
                        debug!("found static call site {site}");
                        let targets = Set::from([ext_callee.clone()]);
                        self.connect(callgraph, this_vertex, &site, &targets);
                        self.res.post_call(&site);
                    }
                    // inline assembly transfers control to no function the
                    // database knows; skipped
                    Instruction::Asm { .. } => self.res.pre_call(&site),
                    _ => self.res.other_inst(&site),
                }
            }

            let site = inst_id(f.clone(), bbid.clone(), bb.insts.len());
            match &bb.term {
                Terminal::CallDirect { callee, .. } => {
                    self.res.pre_call(&site);
                    debug!("found static call site {site}");
                    let targets = Set::from([callee.clone()]);
                    self.connect(callgraph, this_vertex, &site, &targets);
                    self.res.post_call(&site);
                }
                Terminal::CallIndirect { callee, .. } => {
                    self.res.pre_call(&site);
                    // an unscoped callee that names a database function still
                    // resolves statically
                    if let Some(target) = self.static_callee(callee) {
                        debug!("found static call site {site}");
                        let targets = Set::from([target]);
                        self.connect(callgraph, this_vertex, &site, &targets);
                        self.res.post_call(&site);
                    } else {
                        debug!("found dynamic call site {site}");
                        self.indirect_calls.entry(site).or_insert(0);
                        fixpoint_reached = false;
                    }
                }
                _ => self.res.other_inst(&site),
            }
        }

        fixpoint_reached
    }

    // Re-resolve one recorded indirect site.  Returns whether new targets
    // were found.
    fn construct_dynamic_call(&mut self, callgraph: &mut CallGraph, site: &InstId) -> bool {
        let mut new_targets_found = false;

        // An indirect site is only recorded after its function was scanned,
        // so the caller's vertex must exist; a miss means the graph is
        // corrupt and there is no way to continue.
        let Some(this_vertex) = callgraph.vertex_of(&site.func) else {
            error!(
                "construct_dynamic_call: did not find vertex of calling function {} \
                 at call site {site}",
                site.func
            );
            panic!("call graph has no vertex for {}", site.func);
        };

        self.res.pre_call(site);
        debug!("looking into dynamic call site {site}");

        let irdb = self.irdb;
        let is_virtual = match self.th {
            Some(th) => resolver::is_virtual_call(irdb, th, site),
            None => false,
        };
        let mut possible_targets = if is_virtual {
            self.res.resolve_virtual_call(site)
        } else {
            self.res.resolve_function_pointer(site)
        };

        let num_ind_calls = self
            .indirect_calls
            .get_mut(site)
            .expect("indirect call site was never recorded");

        if *num_ind_calls < possible_targets.len() {
            debug!(
                "found {} new possible target(s)",
                possible_targets.len() - *num_ind_calls
            );
            *num_ind_calls = possible_targets.len();
            new_targets_found = true;
        }
        if !new_targets_found {
            return new_targets_found;
        }

        // throw out already found targets
        for e in callgraph.out_edges(this_vertex) {
            if e.site == *site {
                possible_targets.remove(callgraph.func(e.callee));
            }
        }

        self.res.handle_possible_targets(site, &possible_targets);
        for target in &possible_targets {
            let target_vertex = callgraph.get_or_add_vertex(target);
            callgraph.add_edge(this_vertex, target_vertex, site.clone());
            self.function_wl.push(target.clone());
        }
        self.res.post_call(site);

        new_targets_found
    }

    // Run the post-resolution hooks for a statically resolved site, insert
    // the targets and their edges, and enqueue the targets.
    fn connect(
        &mut self,
        callgraph: &mut CallGraph,
        caller: VertexId,
        site: &InstId,
        targets: &Set<FuncId>,
    ) {
        debug!("found {} possible target(s)", targets.len());
        self.res.handle_possible_targets(site, targets);
        for target in targets {
            let target_vertex = callgraph.get_or_add_vertex(target);
            callgraph.add_edge(caller, target_vertex, site.clone());
            self.function_wl.push(target.clone());
        }
    }

    fn static_callee(&self, callee: &VarId) -> Option<FuncId> {
        if callee.scope().is_some() {
            return None;
        }
        self.irdb.get_function(callee.name())
    }
}
