//! Indirect-call resolution strategies.
//!
//! All six algorithms share one hook sequence, driven by the builder for
//! every call site: `pre_call`, then `resolve_virtual_call` or
//! `resolve_function_pointer` for indirect sites, then
//! `handle_possible_targets`, then `post_call`.  Non-call instructions are
//! announced through `other_inst` in program order, which is how the
//! stateful strategies watch the program grow.

use std::cell::RefCell;

use std::collections::BTreeSet as Set;

use crate::commons::Soundness;
use crate::middle_end::analysis::points_to::{PointerAnalysisType, PointsToInfo, PtTarget};
use crate::middle_end::analysis::type_hierarchy::TypeHierarchy;
use crate::middle_end::irdb::{InstRef, IrDb};
use crate::middle_end::lir::*;

use super::CallGraphAnalysisType;

pub trait Resolver {
    fn pre_call(&mut self, _site: &InstId) {}

    /// Candidate targets of a site classified as virtual dispatch.
    fn resolve_virtual_call(&mut self, site: &InstId) -> Set<FuncId>;

    /// Candidate targets of any other indirect site.
    fn resolve_function_pointer(&mut self, site: &InstId) -> Set<FuncId>;

    fn handle_possible_targets(&mut self, _site: &InstId, _targets: &Set<FuncId>) {}

    fn post_call(&mut self, _site: &InstId) {}

    fn other_inst(&mut self, _site: &InstId) {}

    fn name(&self) -> &'static str;
}

pub fn create<'a>(
    ty: CallGraphAnalysisType,
    irdb: &'a IrDb,
    th: Option<&'a TypeHierarchy>,
    pt: Option<&'a RefCell<PointsToInfo>>,
    soundness: Soundness,
) -> Box<dyn Resolver + 'a> {
    use CallGraphAnalysisType::*;

    match ty {
        NoResolve => Box::new(NoResolver),
        CHA => Box::new(ChaResolver {
            irdb,
            th: th.expect("CHA requires a type hierarchy"),
        }),
        RTA => Box::new(RtaResolver {
            irdb,
            th: th.expect("RTA requires a type hierarchy"),
            constructed: Set::new(),
        }),
        DTA => Box::new(DtaResolver {
            irdb,
            th: th.expect("DTA requires a type hierarchy"),
        }),
        VTA => Box::new(VtaResolver {
            irdb,
            th: th.expect("VTA requires a type hierarchy"),
            pt: PointsToInfo::from_irdb(irdb, PointerAnalysisType::CFLAnders),
        }),
        OTF => Box::new(OtfResolver {
            irdb,
            th: th.expect("OTF requires a type hierarchy"),
            pt: pt.expect("OTF requires points-to information"),
            soundness,
        }),
        Invalid => unreachable!("'invalid' is rejected at configuration time"),
    }
}

// SECTION: call-site inspection

// The parts of an indirect call site.
pub(crate) struct IndirectSite<'a> {
    pub callee: &'a VarId,
    pub args: &'a [Operand],
}

pub(crate) fn indirect_site<'a>(irdb: &'a IrDb, site: &InstId) -> Option<IndirectSite<'a>> {
    match irdb.instruction(site)? {
        InstRef::Term(Terminal::CallIndirect { callee, args, .. }) => Some(IndirectSite {
            callee,
            args: args.as_slice(),
        }),
        _ => None,
    }
}

// The receiver of a call, identified from its ABI shape: the first argument,
// if it is a pointer to a struct.
pub(crate) fn receiver_type(irdb: &IrDb, site: &InstId) -> Option<StructId> {
    let cs = indirect_site(irdb, site)?;
    let recv = cs.args.first()?.as_var()?;
    recv.typ().as_struct_ptr().cloned()
}

// The vtable index of a call's indexing sequence: the nearest in-block
// definition of the callee variable must be a `$vload`.
pub(crate) fn vft_index(irdb: &IrDb, site: &InstId) -> Option<usize> {
    let callee = indirect_site(irdb, site)?.callee.clone();
    let bb = irdb.function_body(&site.func)?.body.get(&site.bb)?;
    let in_scope = &bb.insts[..site.idx.min(bb.insts.len())];
    for inst in in_scope.iter().rev() {
        if inst.defined_var() == Some(&callee) {
            return match inst {
                Instruction::VtLoad { slot, .. } => Some(*slot),
                _ => None,
            };
        }
    }
    None
}

/// The virtual-call test: an indirect site with an identifiable receiver
/// whose static type is a known, vtable'd class, and whose callee is read
/// from a vtable slot.
pub fn is_virtual_call(irdb: &IrDb, th: &TypeHierarchy, site: &InstId) -> bool {
    virtual_site(irdb, th, site).is_some()
}

// Receiver type and slot index of a virtual site.
pub(crate) fn virtual_site(
    irdb: &IrDb,
    th: &TypeHierarchy,
    site: &InstId,
) -> Option<(StructId, usize)> {
    let recv_ty = receiver_type(irdb, site)?;
    if !th.has_type(&recv_ty) || !th.has_vftable(&recv_ty) {
        return None;
    }
    let slot = vft_index(irdb, site)?;
    Some((recv_ty, slot))
}

// The result variable and arguments of any call-like site.
pub(crate) fn call_parts(irdb: &IrDb, site: &InstId) -> Option<(Option<VarId>, Vec<Operand>)> {
    match irdb.instruction(site)? {
        InstRef::Inst(Instruction::CallExt { lhs, args, .. }) => {
            Some((lhs.clone(), args.clone()))
        }
        InstRef::Term(Terminal::CallDirect { lhs, args, .. })
        | InstRef::Term(Terminal::CallIndirect { lhs, args, .. }) => {
            Some((lhs.clone(), args.clone()))
        }
        _ => None,
    }
}

// Parameter count of a definition or declaration.
fn param_count(irdb: &IrDb, f: &FuncId) -> Option<usize> {
    if let Some(def) = irdb.function_body(f) {
        return Some(def.params.len());
    }
    match irdb.extern_type(f).map(|t| &*t.0) {
        Some(LirType::Function { param_ty, .. }) => Some(param_ty.len()),
        _ => None,
    }
}

// SECTION: the strategies

/// Leaves every indirect site unresolved.
struct NoResolver;

impl Resolver for NoResolver {
    fn resolve_virtual_call(&mut self, _site: &InstId) -> Set<FuncId> {
        Set::new()
    }

    fn resolve_function_pointer(&mut self, _site: &InstId) -> Set<FuncId> {
        Set::new()
    }

    fn name(&self) -> &'static str {
        "noresolve"
    }
}

/// Class-hierarchy analysis: every subtype of the receiver's static type
/// with a matching vtable slot.
struct ChaResolver<'a> {
    irdb: &'a IrDb,
    th: &'a TypeHierarchy,
}

fn cha_targets(
    th: &TypeHierarchy,
    recv_ty: &StructId,
    slot: usize,
    keep: impl Fn(&StructId) -> bool,
) -> Set<FuncId> {
    th.subtypes_of(recv_ty)
        .iter()
        .filter(|t| keep(t))
        .filter_map(|t| th.vft_entry(t, slot))
        .cloned()
        .collect()
}

impl Resolver for ChaResolver<'_> {
    fn resolve_virtual_call(&mut self, site: &InstId) -> Set<FuncId> {
        match virtual_site(self.irdb, self.th, site) {
            Some((recv_ty, slot)) => cha_targets(self.th, &recv_ty, slot, |_| true),
            None => Set::new(),
        }
    }

    fn resolve_function_pointer(&mut self, _site: &InstId) -> Set<FuncId> {
        Set::new()
    }

    fn name(&self) -> &'static str {
        "cha"
    }
}

/// Rapid type analysis: CHA, intersected with the set of types whose
/// allocation has been observed reachable.
struct RtaResolver<'a> {
    irdb: &'a IrDb,
    th: &'a TypeHierarchy,
    constructed: Set<StructId>,
}

impl Resolver for RtaResolver<'_> {
    fn resolve_virtual_call(&mut self, site: &InstId) -> Set<FuncId> {
        match virtual_site(self.irdb, self.th, site) {
            Some((recv_ty, slot)) => {
                cha_targets(self.th, &recv_ty, slot, |t| self.constructed.contains(t))
            }
            None => Set::new(),
        }
    }

    fn resolve_function_pointer(&mut self, _site: &InstId) -> Set<FuncId> {
        Set::new()
    }

    fn other_inst(&mut self, site: &InstId) {
        if let Some(InstRef::Inst(Instruction::Alloc { lhs, .. })) = self.irdb.instruction(site) {
            if let Some(s) = lhs.typ().as_struct_ptr() {
                self.constructed.insert(s.clone());
            }
        }
    }

    fn name(&self) -> &'static str {
        "rta"
    }
}

/// Declared-type analysis: CHA restricted to the declared static type of the
/// receiver.
struct DtaResolver<'a> {
    irdb: &'a IrDb,
    th: &'a TypeHierarchy,
}

impl Resolver for DtaResolver<'_> {
    fn resolve_virtual_call(&mut self, site: &InstId) -> Set<FuncId> {
        match virtual_site(self.irdb, self.th, site) {
            Some((recv_ty, slot)) => {
                self.th.vft_entry(&recv_ty, slot).cloned().into_iter().collect()
            }
            None => Set::new(),
        }
    }

    fn resolve_function_pointer(&mut self, _site: &InstId) -> Set<FuncId> {
        Set::new()
    }

    fn name(&self) -> &'static str {
        "dta"
    }
}

/// Variable-type analysis: the types that flow into the receiver variable,
/// computed once up front by a whole-program flow-insensitive points-to
/// pass.
struct VtaResolver<'a> {
    irdb: &'a IrDb,
    th: &'a TypeHierarchy,
    pt: PointsToInfo,
}

fn pts_targets(
    pt: &mut PointsToInfo,
    th: &TypeHierarchy,
    recv: &VarId,
    recv_ty: &StructId,
    slot: usize,
) -> Set<FuncId> {
    let subtypes = th.subtypes_of(recv_ty);
    pt.points_to(recv)
        .iter()
        .filter_map(PtTarget::site_type)
        .filter(|s| subtypes.contains(*s))
        .filter_map(|s| th.vft_entry(s, slot))
        .cloned()
        .collect()
}

impl Resolver for VtaResolver<'_> {
    fn resolve_virtual_call(&mut self, site: &InstId) -> Set<FuncId> {
        let Some((recv_ty, slot)) = virtual_site(self.irdb, self.th, site) else {
            return Set::new();
        };
        let Some(recv) = indirect_site(self.irdb, site)
            .and_then(|cs| cs.args.first().and_then(Operand::as_var).cloned())
        else {
            return Set::new();
        };
        pts_targets(&mut self.pt, self.th, &recv, &recv_ty, slot)
    }

    fn resolve_function_pointer(&mut self, _site: &InstId) -> Set<FuncId> {
        Set::new()
    }

    fn name(&self) -> &'static str {
        "vta"
    }
}

/// On-the-fly resolution: both kinds of indirect site are answered from a
/// points-to view that grows as the builder uncovers more of the program.
struct OtfResolver<'a> {
    irdb: &'a IrDb,
    th: &'a TypeHierarchy,
    pt: &'a RefCell<PointsToInfo>,
    soundness: Soundness,
}

impl Resolver for OtfResolver<'_> {
    fn resolve_virtual_call(&mut self, site: &InstId) -> Set<FuncId> {
        let Some((recv_ty, slot)) = virtual_site(self.irdb, self.th, site) else {
            return Set::new();
        };
        let Some(recv) = indirect_site(self.irdb, site)
            .and_then(|cs| cs.args.first().and_then(Operand::as_var).cloned())
        else {
            return Set::new();
        };
        pts_targets(&mut self.pt.borrow_mut(), self.th, &recv, &recv_ty, slot)
    }

    fn resolve_function_pointer(&mut self, site: &InstId) -> Set<FuncId> {
        let Some(cs) = indirect_site(self.irdb, site) else {
            return Set::new();
        };
        let nargs = cs.args.len();
        let callee = cs.callee.clone();

        // a target must not take more parameters than the call supplies;
        // extra arguments are tolerated
        let targets: Set<FuncId> = self
            .pt
            .borrow_mut()
            .points_to(&callee)
            .iter()
            .filter_map(PtTarget::as_func)
            .filter(|f| matches!(param_count(self.irdb, f), Some(n) if n <= nargs))
            .cloned()
            .collect();

        if targets.is_empty() && self.soundness == Soundness::Sound {
            // conservative fallback: every address-taken function the call
            // could reach, by the same arity rule
            return self
                .pt
                .borrow()
                .address_taken_functions()
                .iter()
                .filter(|f| matches!(param_count(self.irdb, f), Some(n) if n <= nargs))
                .cloned()
                .collect();
        }

        targets
    }

    fn handle_possible_targets(&mut self, site: &InstId, targets: &Set<FuncId>) {
        let Some((lhs, args)) = call_parts(self.irdb, site) else {
            return;
        };
        for target in targets {
            if let Some(def) = self.irdb.function_body(target) {
                self.pt.borrow_mut().bind_call(&lhs, &args, def);
            }
        }
    }

    fn other_inst(&mut self, site: &InstId) {
        if let Some(InstRef::Inst(inst)) = self.irdb.instruction(site) {
            self.pt.borrow_mut().observe_inst(inst);
        }
    }

    fn name(&self) -> &'static str {
        "otf"
    }
}
