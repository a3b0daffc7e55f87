//! The LIR data model: typed, register-based programs made of basic blocks.
//!
//! A module-level program carries struct layouts, virtual tables, global
//! constructor lists, extern declarations, globals, and function definitions.
//! Programs are parsed from their textual form (see [parse_impl]) and must be
//! validated into a `Valid<Program>` before analysis.

pub mod cfg_dump_impl;
pub mod parse_impl;

use std::fmt;
use std::sync::Arc;

use derive_more::Display;

use crate::commons::Valid;

use std::collections::{BTreeMap as Map, BTreeSet as Set};

pub use cfg_dump_impl::{dump_cfg, dump_cfg_of_whole_program};

// SECTION: identifiers

#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncId(Arc<str>);

#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BbId(Arc<str>);

#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StructId(Arc<str>);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId {
    pub name: String,
    pub typ: Type,
}

pub fn func_id(name: &str) -> FuncId {
    FuncId(name.into())
}

pub fn bb_id(name: &str) -> BbId {
    BbId(name.into())
}

pub fn struct_id(name: &str) -> StructId {
    StructId(name.into())
}

pub fn field_id(name: &str, typ: Type) -> FieldId {
    FieldId {
        name: name.to_string(),
        typ,
    }
}

impl FuncId {
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl BbId {
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl StructId {
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

// SECTION: variables

/// A variable: a name, a type, and the function it is scoped to (`None` for
/// globals and for references to functions by name).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub Arc<VarInner>);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInner {
    pub name: String,
    pub typ: Type,
    pub scope: Option<FuncId>,
}

pub fn var_id(name: &str, typ: Type, scope: Option<FuncId>) -> VarId {
    VarId(Arc::new(VarInner {
        name: name.to_string(),
        typ,
        scope,
    }))
}

impl VarId {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn typ(&self) -> Type {
        self.0.typ.clone()
    }

    pub fn scope(&self) -> Option<&FuncId> {
        self.0.scope.as_ref()
    }

    // The scope-qualified spelling, used where same-named locals of different
    // functions must stay distinct (points-to exports, diagnostics).
    pub fn with_funcid(&self) -> String {
        if let Some(funcid) = &self.0.scope {
            format!("{}.{}", funcid, self)
        } else {
            self.to_string()
        }
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

// SECTION: types

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Type(pub Arc<LirType>);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LirType {
    Int,
    Struct(StructId),
    Pointer(Type),
    Function {
        ret_ty: Option<Type>,
        param_ty: Vec<Type>,
    },
}

pub fn int_ty() -> Type {
    Type(Arc::new(LirType::Int))
}

pub fn struct_ty(id: StructId) -> Type {
    Type(Arc::new(LirType::Struct(id)))
}

pub fn ptr_ty(inner: Type) -> Type {
    Type(Arc::new(LirType::Pointer(inner)))
}

pub fn func_ty(ret_ty: Option<Type>, param_ty: Vec<Type>) -> Type {
    Type(Arc::new(LirType::Function { ret_ty, param_ty }))
}

impl Type {
    pub fn is_int(&self) -> bool {
        matches!(&*self.0, LirType::Int)
    }

    pub fn is_ptr(&self) -> bool {
        matches!(&*self.0, LirType::Pointer(_))
    }

    // The pointed-to type, if this is a pointer.
    pub fn pointee(&self) -> Option<&Type> {
        match &*self.0 {
            LirType::Pointer(inner) => Some(inner),
            _ => None,
        }
    }

    // The struct a pointer points to, if any (`&S` gives `S`).
    pub fn as_struct_ptr(&self) -> Option<&StructId> {
        match self.pointee().map(|t| &*t.0) {
            Some(LirType::Struct(s)) => Some(s),
            _ => None,
        }
    }

    // Whether this is a pointer to a function type.
    pub fn is_fn_ptr(&self) -> bool {
        matches!(
            self.pointee().map(|t| &*t.0),
            Some(LirType::Function { .. })
        )
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &*self.0 {
            LirType::Int => write!(f, "int"),
            LirType::Struct(s) => write!(f, "{s}"),
            LirType::Pointer(inner) => write!(f, "&{inner}"),
            LirType::Function { ret_ty, param_ty } => {
                write!(f, "(")?;
                for (i, t) in param_ty.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ") -> ")?;
                match ret_ty {
                    Some(t) => write!(f, "{t}"),
                    None => write!(f, "_"),
                }
            }
        }
    }
}

// SECTION: instructions

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operand {
    CInt(i64),
    Var(VarId),
}

impl Operand {
    pub fn as_var(&self) -> Option<&VarId> {
        match self {
            Operand::Var(v) => Some(v),
            Operand::CInt(_) => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operand::CInt(n) => write!(f, "{n}"),
            Operand::Var(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ArithOp::Add => "add",
            ArithOp::Subtract => "sub",
            ArithOp::Multiply => "mul",
            ArithOp::Divide => "div",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelaOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl fmt::Display for RelaOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            RelaOp::Eq => "eq",
            RelaOp::Neq => "neq",
            RelaOp::Lt => "lt",
            RelaOp::Lte => "lte",
            RelaOp::Gt => "gt",
            RelaOp::Gte => "gte",
        };
        write!(f, "{s}")
    }
}

/// Mid-block instructions.  `$call_ext` and `$asm` are call-like; everything
/// else transfers no control.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Instruction {
    AddrOf {
        lhs: VarId,
        op: VarId,
    },
    Alloc {
        lhs: VarId,
        num: Operand,
        id: VarId,
    },
    Arith {
        lhs: VarId,
        aop: ArithOp,
        op1: Operand,
        op2: Operand,
    },
    Cmp {
        lhs: VarId,
        rop: RelaOp,
        op1: Operand,
        op2: Operand,
    },
    CallExt {
        lhs: Option<VarId>,
        ext_callee: FuncId,
        args: Vec<Operand>,
    },
    Copy {
        lhs: VarId,
        op: Operand,
    },
    Gep {
        lhs: VarId,
        src: VarId,
        idx: Operand,
    },
    Gfp {
        lhs: VarId,
        src: VarId,
        field: FieldId,
    },
    Load {
        lhs: VarId,
        src: VarId,
    },
    Store {
        dst: VarId,
        op: Operand,
    },
    // read slot `slot` of the virtual table of the object `obj` points to
    VtLoad {
        lhs: VarId,
        obj: VarId,
        slot: usize,
    },
    // inline assembly; opaque to every analysis
    Asm {
        text: String,
    },
}

impl Instruction {
    // The variable this instruction defines, if any.
    pub fn defined_var(&self) -> Option<&VarId> {
        use Instruction::*;
        match self {
            AddrOf { lhs, .. }
            | Alloc { lhs, .. }
            | Arith { lhs, .. }
            | Cmp { lhs, .. }
            | Copy { lhs, .. }
            | Gep { lhs, .. }
            | Gfp { lhs, .. }
            | Load { lhs, .. }
            | VtLoad { lhs, .. } => Some(lhs),
            CallExt { lhs, .. } => lhs.as_ref(),
            Store { .. } | Asm { .. } => None,
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(
            self,
            Instruction::CallExt { .. } | Instruction::Asm { .. }
        )
    }
}

fn write_args(f: &mut fmt::Formatter, args: &[Operand]) -> fmt::Result {
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{a}")?;
    }
    Ok(())
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Instruction::*;
        match self {
            AddrOf { lhs, op } => write!(f, "{lhs} = $addrof {op}"),
            Alloc { lhs, num, id } => write!(f, "{lhs} = $alloc {num} [{id}]"),
            Arith { lhs, aop, op1, op2 } => write!(f, "{lhs} = $arith {aop} {op1} {op2}"),
            Cmp { lhs, rop, op1, op2 } => write!(f, "{lhs} = $cmp {rop} {op1} {op2}"),
            CallExt {
                lhs,
                ext_callee,
                args,
            } => {
                if let Some(lhs) = lhs {
                    write!(f, "{lhs} = ")?;
                }
                write!(f, "$call_ext {ext_callee}(")?;
                write_args(f, args)?;
                write!(f, ")")
            }
            Copy { lhs, op } => write!(f, "{lhs} = $copy {op}"),
            Gep { lhs, src, idx } => write!(f, "{lhs} = $gep {src} {idx}"),
            Gfp { lhs, src, field } => write!(f, "{lhs} = $gfp {src} {field}"),
            Load { lhs, src } => write!(f, "{lhs} = $load {src}"),
            Store { dst, op } => write!(f, "$store {dst} {op}"),
            VtLoad { lhs, obj, slot } => write!(f, "{lhs} = $vload {obj} {slot}"),
            Asm { text } => write!(f, "$asm \"{text}\""),
        }
    }
}

/// Block terminators.  `$call_dir` and `$call_idt` are call-like.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Terminal {
    Branch {
        cond: Operand,
        tt: BbId,
        ff: BbId,
    },
    CallDirect {
        lhs: Option<VarId>,
        callee: FuncId,
        args: Vec<Operand>,
        next_bb: BbId,
    },
    CallIndirect {
        lhs: Option<VarId>,
        callee: VarId,
        args: Vec<Operand>,
        next_bb: BbId,
    },
    Jump(BbId),
    Ret(Option<Operand>),
}

impl Terminal {
    pub fn is_call(&self) -> bool {
        matches!(
            self,
            Terminal::CallDirect { .. } | Terminal::CallIndirect { .. }
        )
    }

    // Successor blocks, in branch order.
    pub fn successors(&self) -> Vec<&BbId> {
        use Terminal::*;
        match self {
            Branch { tt, ff, .. } => vec![tt, ff],
            CallDirect { next_bb, .. } | CallIndirect { next_bb, .. } => vec![next_bb],
            Jump(next_bb) => vec![next_bb],
            Ret(_) => vec![],
        }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Terminal::*;
        match self {
            Branch { cond, tt, ff } => write!(f, "$branch {cond} {tt} {ff}"),
            CallDirect {
                lhs,
                callee,
                args,
                next_bb,
            } => {
                if let Some(lhs) = lhs {
                    write!(f, "{lhs} = ")?;
                }
                write!(f, "$call_dir {callee}(")?;
                write_args(f, args)?;
                write!(f, ") then {next_bb}")
            }
            CallIndirect {
                lhs,
                callee,
                args,
                next_bb,
            } => {
                if let Some(lhs) = lhs {
                    write!(f, "{lhs} = ")?;
                }
                write!(f, "$call_idt {callee}(")?;
                write_args(f, args)?;
                write!(f, ") then {next_bb}")
            }
            Jump(bb) => write!(f, "$jump {bb}"),
            Ret(None) => write!(f, "$ret"),
            Ret(Some(op)) => write!(f, "$ret {op}"),
        }
    }
}

// SECTION: instruction handles

/// A stable, program-wide identity for an instruction.  `idx` indexes into
/// the block's instruction list; `idx == insts.len()` addresses the block
/// terminal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstId {
    pub func: FuncId,
    pub bb: BbId,
    pub idx: usize,
}

pub fn inst_id(func: FuncId, bb: BbId, idx: usize) -> InstId {
    InstId { func, bb, idx }
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.func, self.bb, self.idx)
    }
}

// SECTION: blocks, functions, programs

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: BbId,
    pub insts: Vec<Instruction>,
    pub term: Terminal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub id: FuncId,
    pub ret_ty: Option<Type>,
    pub params: Vec<VarId>,
    pub locals: Set<VarId>,
    pub body: Map<BbId, BasicBlock>,
}

/// A virtual table declaration: the full slot table of one class, plus its
/// direct base class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VTable {
    pub parent: Option<StructId>,
    pub slots: Vec<FuncId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Program {
    pub structs: Map<StructId, Set<FieldId>>,
    pub vtables: Map<StructId, VTable>,
    pub ctors: Vec<FuncId>,
    pub globals: Set<VarId>,
    pub externs: Map<FuncId, Type>,
    pub functions: Map<FuncId, Function>,
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (id, fields) in &self.structs {
            writeln!(f, "struct {id} {{")?;
            for field in fields {
                writeln!(f, "  {}: {}", field.name, field.typ)?;
            }
            writeln!(f, "}}\n")?;
        }

        for (id, vt) in &self.vtables {
            write!(f, "vtable {id}")?;
            if let Some(parent) = &vt.parent {
                write!(f, " extends {parent}")?;
            }
            write!(f, " {{ ")?;
            for (i, slot) in vt.slots.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{slot}")?;
            }
            writeln!(f, " }}\n")?;
        }

        if !self.ctors.is_empty() {
            write!(f, "ctors {{ ")?;
            for (i, c) in self.ctors.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{c}")?;
            }
            writeln!(f, " }}\n")?;
        }

        for (id, typ) in &self.externs {
            writeln!(f, "extern {id}: {typ}")?;
        }
        if !self.externs.is_empty() {
            writeln!(f)?;
        }

        for g in &self.globals {
            writeln!(f, "global {g}: {}", g.typ())?;
        }
        if !self.globals.is_empty() {
            writeln!(f)?;
        }

        for func in self.functions.values() {
            write!(f, "fn {}(", func.id)?;
            for (i, p) in func.params.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{p}: {}", p.typ())?;
            }
            write!(f, ") -> ")?;
            match &func.ret_ty {
                Some(t) => writeln!(f, "{t} {{")?,
                None => writeln!(f, "_ {{")?,
            }

            if !func.locals.is_empty() {
                write!(f, "  let ")?;
                for (i, l) in func.locals.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{l}: {}", l.typ())?;
                }
                writeln!(f)?;
            }

            for (bbid, bb) in &func.body {
                writeln!(f, "  {bbid}:")?;
                for inst in &bb.insts {
                    writeln!(f, "    {inst}")?;
                }
                writeln!(f, "    {}", bb.term)?;
            }
            writeln!(f, "}}\n")?;
        }

        Ok(())
    }
}

// SECTION: validation

#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct ValidationError(pub String);
impl std::error::Error for ValidationError {}

impl Program {
    /// Structural validation: block targets resolve, direct callees are
    /// known, vtables and ctors reference known functions, indirect callees
    /// are function pointers.
    pub fn validate(self) -> Result<Valid<Program>, ValidationError> {
        let err = |msg: String| Err(ValidationError(msg));

        for (id, vt) in &self.vtables {
            if let Some(parent) = &vt.parent {
                if !self.vtables.contains_key(parent) {
                    return err(format!("vtable {id} extends unknown class {parent}"));
                }
            }
            for slot in &vt.slots {
                if !self.functions.contains_key(slot) && !self.externs.contains_key(slot) {
                    return err(format!("vtable {id} references unknown function {slot}"));
                }
            }
        }

        for c in &self.ctors {
            if !self.functions.contains_key(c) {
                return err(format!("ctors references unknown function {c}"));
            }
        }

        for (fid, func) in &self.functions {
            if !func.body.contains_key(&bb_id("entry")) {
                return err(format!("function {fid} has no entry block"));
            }

            for (bbid, bb) in &func.body {
                if *bbid != bb.id {
                    return err(format!("block {} of {fid} is keyed as {bbid}", bb.id));
                }
                for succ in bb.term.successors() {
                    if !func.body.contains_key(succ) {
                        return err(format!(
                            "terminal of {fid}.{bbid} targets unknown block {succ}"
                        ));
                    }
                }
                match &bb.term {
                    Terminal::CallDirect { callee, .. } => {
                        if !self.functions.contains_key(callee)
                            && !self.externs.contains_key(callee)
                        {
                            return err(format!(
                                "{fid}.{bbid} calls unknown function {callee}"
                            ));
                        }
                    }
                    Terminal::CallIndirect { callee, .. } => {
                        if !callee.typ().is_fn_ptr() {
                            return err(format!(
                                "{fid}.{bbid} makes an indirect call through \
                                 non-function-pointer {callee}"
                            ));
                        }
                    }
                    _ => (),
                }
                for inst in &bb.insts {
                    if let Instruction::CallExt { ext_callee, .. } = inst {
                        if !self.externs.contains_key(ext_callee)
                            && !self.functions.contains_key(ext_callee)
                        {
                            return err(format!(
                                "{fid}.{bbid} calls unknown extern {ext_callee}"
                            ));
                        }
                    }
                }
            }
        }

        Ok(Valid(self))
    }
}
