//! Flow-insensitive, field-insensitive points-to analysis over LIR
//! assignments.
//!
//! Two variants: inclusion-based (`CFLAnders`, a constraint graph driven to a
//! fixed point by a worklist) and unification-based (`CFLSteens`, a union-find
//! over equivalence classes with one pointee class each).  Both can be grown
//! on the fly: observing more instructions adds constraints, and later
//! queries re-solve to the new least fixed point.

use std::fmt;
use std::str::FromStr;

use std::collections::{BTreeMap as Map, BTreeSet as Set, VecDeque};

use crate::middle_end::irdb::IrDb;
use crate::middle_end::lir::*;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PointerAnalysisType {
    CFLSteens,
    CFLAnders,
    // parseable, but rejected at configuration time
    Invalid,
}

impl fmt::Display for PointerAnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            PointerAnalysisType::CFLSteens => "cflsteens",
            PointerAnalysisType::CFLAnders => "cflanders",
            PointerAnalysisType::Invalid => "invalid",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PointerAnalysisType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s {
            "cflsteens" => PointerAnalysisType::CFLSteens,
            "cflanders" => PointerAnalysisType::CFLAnders,
            "invalid" => PointerAnalysisType::Invalid,
            _ => return Err(format!("unknown pointer analysis: {s}")),
        };

        Ok(ty)
    }
}

/// What a pointer may refer to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PtTarget {
    /// a function, reached by using its name as a value
    Func(FuncId),
    /// a heap allocation site, tagged with the struct type it allocates
    Site { id: VarId, ty: Option<StructId> },
    /// an address-taken variable
    Loc(VarId),
}

impl PtTarget {
    pub fn as_func(&self) -> Option<&FuncId> {
        match self {
            PtTarget::Func(f) => Some(f),
            _ => None,
        }
    }

    pub fn site_type(&self) -> Option<&StructId> {
        match self {
            PtTarget::Site { ty, .. } => ty.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Display for PtTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PtTarget::Func(id) => write!(f, "{id}"),
            PtTarget::Site { id, .. } => write!(f, "{}", id.with_funcid()),
            PtTarget::Loc(v) => write!(f, "{}", v.with_funcid()),
        }
    }
}

// SECTION: inclusion-based solver

// Nodes of the constraint graph: variables, and one memory cell per
// allocation site.  Address-taken variables are their own cells.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Node {
    Var(VarId),
    Cell(VarId),
}

#[derive(Debug, Default)]
struct Anders {
    pts: Map<Node, Set<PtTarget>>,
    succs: Map<Node, Set<Node>>,
    // pending dereferences: loads[p] = variables assigned `*p`, stores[p] =
    // variables stored through `*p`
    loads: Map<VarId, Set<VarId>>,
    stores: Map<VarId, Set<VarId>>,
    worklist: VecDeque<Node>,
}

impl Anders {
    fn cell_node(t: &PtTarget) -> Option<Node> {
        match t {
            PtTarget::Loc(v) => Some(Node::Var(v.clone())),
            PtTarget::Site { id, .. } => Some(Node::Cell(id.clone())),
            PtTarget::Func(_) => None,
        }
    }

    fn add_target(&mut self, n: Node, t: PtTarget) {
        if self.pts.entry(n.clone()).or_default().insert(t) {
            self.worklist.push_back(n);
        }
    }

    fn add_edge(&mut self, from: Node, to: Node) {
        if self.succs.entry(from.clone()).or_default().insert(to) {
            self.worklist.push_back(from);
        }
    }

    fn add_load(&mut self, src: &VarId, lhs: &VarId) {
        if self
            .loads
            .entry(src.clone())
            .or_default()
            .insert(lhs.clone())
        {
            self.worklist.push_back(Node::Var(src.clone()));
        }
    }

    fn add_store(&mut self, dst: &VarId, op: &VarId) {
        if self
            .stores
            .entry(dst.clone())
            .or_default()
            .insert(op.clone())
        {
            self.worklist.push_back(Node::Var(dst.clone()));
        }
    }

    fn solve(&mut self) {
        while let Some(n) = self.worklist.pop_front() {
            let targets = self.pts.get(&n).cloned().unwrap_or_default();

            if let Node::Var(v) = &n {
                for lhs in self.loads.get(v).cloned().unwrap_or_default() {
                    for t in &targets {
                        if let Some(cell) = Self::cell_node(t) {
                            self.add_edge(cell, Node::Var(lhs.clone()));
                        }
                    }
                }
                for op in self.stores.get(v).cloned().unwrap_or_default() {
                    for t in &targets {
                        if let Some(cell) = Self::cell_node(t) {
                            self.add_edge(Node::Var(op.clone()), cell);
                        }
                    }
                }
            }

            for s in self.succs.get(&n).cloned().unwrap_or_default() {
                for t in targets.iter().cloned() {
                    self.add_target(s.clone(), t);
                }
            }
        }
    }
}

// SECTION: unification-based solver

#[derive(Debug)]
struct SteensNode {
    parent: usize,
    pointee: Option<usize>,
    labels: Set<PtTarget>,
}

#[derive(Debug, Default)]
struct Steens {
    nodes: Vec<SteensNode>,
    index: Map<VarId, usize>,
}

impl Steens {
    fn fresh(&mut self) -> usize {
        let i = self.nodes.len();
        self.nodes.push(SteensNode {
            parent: i,
            pointee: None,
            labels: Set::new(),
        });
        i
    }

    fn node(&mut self, v: &VarId) -> usize {
        if let Some(&i) = self.index.get(v) {
            return i;
        }
        let i = self.fresh();
        self.index.insert(v.clone(), i);
        i
    }

    fn find(&mut self, i: usize) -> usize {
        let mut root = i;
        while self.nodes[root].parent != root {
            root = self.nodes[root].parent;
        }
        // path compression
        let mut cur = i;
        while self.nodes[cur].parent != cur {
            let next = self.nodes[cur].parent;
            self.nodes[cur].parent = root;
            cur = next;
        }
        root
    }

    fn pointee_of(&mut self, i: usize) -> usize {
        let r = self.find(i);
        match self.nodes[r].pointee {
            Some(p) => self.find(p),
            None => {
                let p = self.fresh();
                self.nodes[r].pointee = Some(p);
                p
            }
        }
    }

    fn union(&mut self, a: usize, b: usize) -> usize {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return ra;
        }

        self.nodes[rb].parent = ra;
        let labels = std::mem::take(&mut self.nodes[rb].labels);
        self.nodes[ra].labels.extend(labels);

        let pb = self.nodes[rb].pointee.take();
        match (self.nodes[ra].pointee, pb) {
            (Some(pa), Some(pb)) => {
                self.union(pa, pb);
            }
            (None, Some(pb)) => self.nodes[ra].pointee = Some(pb),
            _ => (),
        }

        ra
    }

    fn add_label(&mut self, at: usize, label: PtTarget) {
        let r = self.find(at);
        self.nodes[r].labels.insert(label);
    }

    fn labels_of_pointee(&mut self, v: &VarId) -> Set<PtTarget> {
        match self.index.get(v) {
            Some(&i) => {
                let r = self.find(i);
                match self.nodes[r].pointee {
                    Some(p) => {
                        let pr = self.find(p);
                        self.nodes[pr].labels.clone()
                    }
                    None => Set::new(),
                }
            }
            None => Set::new(),
        }
    }
}

enum Solver {
    Anders(Anders),
    Steens(Steens),
}

// SECTION: public interface

/// The points-to oracle consumed by the call-graph resolvers.
pub struct PointsToInfo {
    kind: PointerAnalysisType,
    fn_ids: Set<FuncId>,
    address_taken: Set<FuncId>,
    solver: Solver,
}

impl PointsToInfo {
    /// An empty oracle over the given database.  Constraints are added
    /// through [PointsToInfo::observe_function] / [PointsToInfo::observe_inst].
    pub fn new(irdb: &IrDb, kind: PointerAnalysisType) -> Self {
        let solver = match kind {
            PointerAnalysisType::CFLSteens => Solver::Steens(Steens::default()),
            _ => Solver::Anders(Anders::default()),
        };

        PointsToInfo {
            kind,
            fn_ids: irdb.get_all_functions().into_iter().collect(),
            address_taken: Set::new(),
            solver,
        }
    }

    /// A whole-program oracle: every definition's constraints plus the
    /// parameter and return bindings of all direct calls.
    pub fn from_irdb(irdb: &IrDb, kind: PointerAnalysisType) -> Self {
        let mut pt = PointsToInfo::new(irdb, kind);
        for f in irdb.definitions() {
            pt.observe_function(f);
            for bb in f.body.values() {
                for inst in &bb.insts {
                    if let Instruction::CallExt {
                        lhs,
                        ext_callee,
                        args,
                    } = inst
                    {
                        if let Some(def) = irdb.function_body(ext_callee) {
                            pt.bind_call(lhs, args, def);
                        }
                    }
                }
                if let Terminal::CallDirect {
                    lhs, callee, args, ..
                } = &bb.term
                {
                    if let Some(def) = irdb.function_body(callee) {
                        pt.bind_call(lhs, args, def);
                    }
                }
            }
        }
        pt
    }

    pub fn kind(&self) -> PointerAnalysisType {
        self.kind
    }

    pub fn observe_function(&mut self, f: &Function) {
        for bb in f.body.values() {
            for inst in &bb.insts {
                self.observe_inst(inst);
            }
        }
    }

    /// Add the constraints of one instruction.
    pub fn observe_inst(&mut self, inst: &Instruction) {
        use Instruction::*;
        match inst {
            Copy {
                lhs,
                op: Operand::Var(v),
            } => {
                self.seed_if_fn(v);
                self.add_assign(v, lhs);
            }
            AddrOf { lhs, op } => match &mut self.solver {
                Solver::Anders(a) => {
                    a.add_target(Node::Var(lhs.clone()), PtTarget::Loc(op.clone()));
                }
                Solver::Steens(s) => {
                    let lhsn = s.node(lhs);
                    let pe = s.pointee_of(lhsn);
                    let opn = s.node(op);
                    let r = s.union(pe, opn);
                    s.add_label(r, PtTarget::Loc(op.clone()));
                }
            },
            Alloc { lhs, id, .. } => {
                let ty = lhs.typ().as_struct_ptr().cloned();
                let site = PtTarget::Site {
                    id: id.clone(),
                    ty,
                };
                match &mut self.solver {
                    Solver::Anders(a) => a.add_target(Node::Var(lhs.clone()), site),
                    Solver::Steens(s) => {
                        let lhsn = s.node(lhs);
                        let pe = s.pointee_of(lhsn);
                        let idn = s.node(id);
                        let r = s.union(pe, idn);
                        s.add_label(r, site);
                    }
                }
            }
            Load { lhs, src } => match &mut self.solver {
                Solver::Anders(a) => a.add_load(src, lhs),
                Solver::Steens(s) => {
                    let srcn = s.node(src);
                    let pe = s.pointee_of(srcn);
                    let lhsn = s.node(lhs);
                    s.union(lhsn, pe);
                }
            },
            Store {
                dst,
                op: Operand::Var(v),
            } => {
                self.seed_if_fn(v);
                match &mut self.solver {
                    Solver::Anders(a) => a.add_store(dst, v),
                    Solver::Steens(s) => {
                        let dstn = s.node(dst);
                        let pe = s.pointee_of(dstn);
                        let vn = s.node(v);
                        s.union(vn, pe);
                    }
                }
            }
            Gep { lhs, src, .. } | Gfp { lhs, src, .. } => self.add_assign(src, lhs),
            _ => (),
        }
    }

    /// Bind a call's arguments to the callee's parameters and the callee's
    /// returns to the call's result.
    pub fn bind_call(&mut self, lhs: &Option<VarId>, args: &[Operand], callee: &Function) {
        for (arg, param) in args.iter().zip(callee.params.clone()) {
            if let Operand::Var(a) = arg {
                self.seed_if_fn(a);
                self.add_assign(a, &param);
            }
        }
        if let Some(l) = lhs {
            for bb in callee.body.values() {
                if let Terminal::Ret(Some(Operand::Var(rv))) = &bb.term {
                    self.add_assign(rv, l);
                }
            }
        }
    }

    /// The subset constraint `pts(src) ⊆ pts(dst)`.
    pub fn add_assign(&mut self, src: &VarId, dst: &VarId) {
        match &mut self.solver {
            Solver::Anders(a) => a.add_edge(Node::Var(src.clone()), Node::Var(dst.clone())),
            Solver::Steens(s) => {
                let sn = s.node(src);
                let dn = s.node(dst);
                s.union(sn, dn);
            }
        }
    }

    /// The points-to set of a variable under the constraints seen so far.
    pub fn points_to(&mut self, v: &VarId) -> Set<PtTarget> {
        match &mut self.solver {
            Solver::Anders(a) => {
                a.solve();
                a.pts.get(&Node::Var(v.clone())).cloned().unwrap_or_default()
            }
            Solver::Steens(s) => s.labels_of_pointee(v),
        }
    }

    /// Every function whose name has been observed used as a value.
    pub fn address_taken_functions(&self) -> &Set<FuncId> {
        &self.address_taken
    }

    pub fn as_json(&mut self) -> serde_json::Value {
        let vars: Vec<VarId> = match &self.solver {
            Solver::Anders(a) => a
                .pts
                .keys()
                .filter_map(|n| match n {
                    Node::Var(v) => Some(v.clone()),
                    Node::Cell(_) => None,
                })
                .collect(),
            Solver::Steens(s) => s.index.keys().cloned().collect(),
        };

        let mut map = serde_json::Map::new();
        for v in vars {
            let targets: Vec<serde_json::Value> = self
                .points_to(&v)
                .iter()
                .map(|t| serde_json::Value::String(t.to_string()))
                .collect();
            map.insert(v.with_funcid(), serde_json::Value::Array(targets));
        }
        serde_json::Value::Object(map)
    }

    // A variable named like a function denotes that function's address.
    fn seed_if_fn(&mut self, v: &VarId) {
        if v.scope().is_some() {
            return;
        }
        let id = func_id(v.name());
        if !self.fn_ids.contains(&id) {
            return;
        }
        self.address_taken.insert(id.clone());
        match &mut self.solver {
            Solver::Anders(a) => a.add_target(Node::Var(v.clone()), PtTarget::Func(id)),
            Solver::Steens(s) => {
                let vn = s.node(v);
                let pe = s.pointee_of(vn);
                s.add_label(pe, PtTarget::Func(id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle_end::irdb::{IrDb, Module};
    use pretty_assertions::assert_eq;

    fn db(src: &str) -> IrDb {
        let program: Program = src.parse().unwrap();
        IrDb::new(vec![Module {
            path: "<test>".to_string(),
            program: program.validate().unwrap(),
        }])
    }

    fn var_of(irdb: &IrDb, func: &str, name: &str) -> VarId {
        let f = irdb.get_function_definition(func).unwrap();
        f.params
            .iter()
            .chain(f.locals.iter())
            .find(|v| v.name() == name)
            .cloned()
            .unwrap()
    }

    const FNPTR: &str = r#"
fn h() -> _ {
  entry:
    $ret
}

fn main() -> _ {
  let p: &() -> _, q: &() -> _
  entry:
    p = $copy h
    q = $copy p
    $ret
}
"#;

    #[test]
    fn copies_propagate_function_targets() {
        let irdb = db(FNPTR);
        let mut pt = PointsToInfo::from_irdb(&irdb, PointerAnalysisType::CFLAnders);

        let q = var_of(&irdb, "main", "q");
        let pts = pt.points_to(&q);
        assert_eq!(pts, Set::from([PtTarget::Func(func_id("h"))]));
        assert!(pt.address_taken_functions().contains(&func_id("h")));
    }

    #[test]
    fn loads_see_stored_targets() {
        let src = r#"
fn h() -> _ {
  entry:
    $ret
}

fn main() -> _ {
  let cell: &() -> _, p: &&() -> _, got: &() -> _
  entry:
    p = $addrof cell
    $store p h
    got = $load p
    $ret
}
"#;
        let irdb = db(src);
        let mut pt = PointsToInfo::from_irdb(&irdb, PointerAnalysisType::CFLAnders);

        let got = var_of(&irdb, "main", "got");
        assert_eq!(pt.points_to(&got), Set::from([PtTarget::Func(func_id("h"))]));
    }

    #[test]
    fn allocation_sites_carry_struct_types() {
        let src = r#"
struct node {
  tag: int
}

fn main() -> _ {
  let a: &node, b: &node
  entry:
    a = $alloc 1 [_a1]
    b = $copy a
    $ret
}
"#;
        let irdb = db(src);
        let mut pt = PointsToInfo::from_irdb(&irdb, PointerAnalysisType::CFLAnders);

        let b = var_of(&irdb, "main", "b");
        let pts = pt.points_to(&b);
        assert_eq!(pts.len(), 1);
        assert_eq!(
            pts.first().unwrap().site_type(),
            Some(&struct_id("node"))
        );
    }

    #[test]
    fn arguments_flow_into_parameters() {
        let src = r#"
fn h() -> _ {
  entry:
    $ret
}

fn callee(fp: &() -> _) -> _ {
  entry:
    $ret
}

fn main() -> _ {
  entry:
    $call_dir callee(h) then exit
  exit:
    $ret
}
"#;
        let irdb = db(src);
        let mut pt = PointsToInfo::from_irdb(&irdb, PointerAnalysisType::CFLAnders);

        let fp = var_of(&irdb, "callee", "fp");
        assert_eq!(pt.points_to(&fp), Set::from([PtTarget::Func(func_id("h"))]));
    }

    #[test]
    fn steensgaard_unifies_what_anders_keeps_apart() {
        let src = r#"
fn f() -> _ {
  entry:
    $ret
}

fn g() -> _ {
  entry:
    $ret
}

fn main() -> _ {
  let p: &() -> _, q: &() -> _
  entry:
    p = $copy f
    q = $copy p
    q = $copy g
    $ret
}
"#;
        let irdb = db(src);

        // inclusion keeps the flow directed: nothing flows back into p
        let mut anders = PointsToInfo::from_irdb(&irdb, PointerAnalysisType::CFLAnders);
        let p = var_of(&irdb, "main", "p");
        assert_eq!(
            anders.points_to(&p),
            Set::from([PtTarget::Func(func_id("f"))])
        );

        // unification merges p and q, so g bleeds into p
        let mut steens = PointsToInfo::from_irdb(&irdb, PointerAnalysisType::CFLSteens);
        assert_eq!(
            steens.points_to(&p),
            Set::from([PtTarget::Func(func_id("f")), PtTarget::Func(func_id("g"))])
        );
    }
}
