//! Static analysis of lir programs.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use super::lir::*;

pub mod callgraph;
pub mod points_to;
pub mod type_hierarchy;

/// The control-flow graph *for a function*: block-level successor and
/// predecessor edges.  Interprocedural queries on the call graph delegate
/// their intra-procedural parts here.
#[derive(Clone, Debug)]
pub struct Cfg {
    pub entry: BbId,
    pub exit: BbId,
    succ_edges: Map<BbId, Set<BbId>>,
    pred_edges: Map<BbId, Set<BbId>>,
}

impl Cfg {
    // construct a Cfg from the given function's basic blocks.
    pub fn new(function: &Function) -> Self {
        fn insert_edge(map: &mut Map<BbId, Set<BbId>>, key_bbid: &BbId, value_bbid: &BbId) {
            map.entry(key_bbid.clone())
                .and_modify(|s| {
                    s.insert(value_bbid.clone());
                })
                .or_insert([value_bbid.clone()].into());
        }

        let entry = bb_id("entry");
        let mut exit = bb_id("exit");
        let mut succ_edges: Map<BbId, Set<BbId>> = Map::new();
        let mut pred_edges: Map<BbId, Set<BbId>> = Map::new();

        pred_edges.insert(entry.clone(), [].into());

        for (bbid, bb) in &function.body {
            let succs = bb.term.successors();
            if succs.is_empty() {
                succ_edges.insert(bbid.clone(), [].into());
                exit = bbid.clone();
            }
            for next_bb in succs {
                insert_edge(&mut succ_edges, bbid, next_bb);
                insert_edge(&mut pred_edges, next_bb, bbid);
            }
        }

        Cfg {
            entry,
            exit,
            succ_edges,
            pred_edges,
        }
    }

    // an iterator over the successor edges of bb.
    pub fn succ(&self, bb: &BbId) -> impl Iterator<Item = &BbId> {
        self.succ_edges.get(bb).into_iter().flatten()
    }

    // an iterator over the predecessor edges of bb.
    pub fn pred(&self, bb: &BbId) -> impl Iterator<Item = &BbId> {
        self.pred_edges.get(bb).into_iter().flatten()
    }
}
