//! Textual LIR parsing: `str::parse::<Program>()`.
//!
//! Declarations may appear in any order; all type-level declarations are
//! collected before function bodies are resolved, so forward references are
//! fine.

use super::*;

use pest::error::Error;
use pest::iterators::Pair;
use pest::Parser;

#[derive(pest_derive::Parser)]
#[grammar_inline = r#"
WHITESPACE = _{ " " | "\t" | "\r" | "\n" }
COMMENT = _{ "//" ~ (!"\n" ~ ANY)* }

ident = @{ (ASCII_ALPHA | "_") ~ (ASCII_ALPHANUMERIC | "_")* }
int = @{ "-"? ~ ASCII_DIGIT+ }
string = @{ "\"" ~ (!"\"" ~ ANY)* ~ "\"" }

program = { SOI ~ decl* ~ EOI }
decl = _{ struct_def | vtable_def | ctors_def | extern_def | global_def | func_def }

struct_def = { "struct" ~ ident ~ "{" ~ field_decl* ~ "}" }
field_decl = { ident ~ ":" ~ type_ }

vtable_def = { "vtable" ~ ident ~ extends_clause? ~ "{" ~ name_list? ~ "}" }
extends_clause = { "extends" ~ ident }
ctors_def = { "ctors" ~ "{" ~ name_list? ~ "}" }
name_list = { ident ~ ("," ~ ident)* }

extern_def = { "extern" ~ ident ~ ":" ~ fn_type }
global_def = { "global" ~ ident ~ ":" ~ type_ }

type_ = { ptr_type | fn_type | base_type }
ptr_type = { "&" ~ type_ }
fn_type = { "(" ~ type_list? ~ ")" ~ "->" ~ ret_type }
type_list = { type_ ~ ("," ~ type_)* }
ret_type = { type_ }
base_type = @{ ident }

func_def = { "fn" ~ ident ~ "(" ~ param_list? ~ ")" ~ "->" ~ ret_type ~ "{" ~ let_decl* ~ basic_block+ ~ "}" }
param_list = { param ~ ("," ~ param)* }
param = { ident ~ ":" ~ type_ }
let_decl = { "let" ~ param ~ ("," ~ param)* }

basic_block = { ident ~ ":" ~ inst* ~ terminal }

inst = _{ addrof_i | alloc_i | arith_i | cmp_i | callext_i | copy_i | gep_i | gfp_i | load_i | store_i | vload_i | asm_i }
addrof_i = { ident ~ "=" ~ "$addrof" ~ ident }
alloc_i = { ident ~ "=" ~ "$alloc" ~ operand ~ "[" ~ ident ~ "]" }
arith_i = { ident ~ "=" ~ "$arith" ~ aop ~ operand ~ operand }
aop = { "add" | "sub" | "mul" | "div" }
cmp_i = { ident ~ "=" ~ "$cmp" ~ rop ~ operand ~ operand }
rop = { "eq" | "neq" | "lte" | "lt" | "gte" | "gt" }
callext_i = { call_lhs? ~ "$call_ext" ~ ident ~ "(" ~ arg_list? ~ ")" }
copy_i = { ident ~ "=" ~ "$copy" ~ operand }
gep_i = { ident ~ "=" ~ "$gep" ~ ident ~ operand }
gfp_i = { ident ~ "=" ~ "$gfp" ~ ident ~ ident }
load_i = { ident ~ "=" ~ "$load" ~ ident }
store_i = { "$store" ~ ident ~ operand }
vload_i = { ident ~ "=" ~ "$vload" ~ ident ~ int }
asm_i = { "$asm" ~ string }

call_lhs = { ident ~ "=" }
arg_list = { operand ~ ("," ~ operand)* }
operand = { int | ident }

terminal = _{ branch_t | jump_t | ret_t | calldir_t | callidt_t }
branch_t = { "$branch" ~ operand ~ ident ~ ident }
jump_t = { "$jump" ~ ident }
ret_t = { "$ret" ~ ret_val? }
ret_val = { operand ~ !":" }
calldir_t = { call_lhs? ~ "$call_dir" ~ ident ~ "(" ~ arg_list? ~ ")" ~ "then" ~ ident }
callidt_t = { call_lhs? ~ "$call_idt" ~ ident ~ "(" ~ arg_list? ~ ")" ~ "then" ~ ident }
"#]
struct LirParser;

#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum Errors {
    Parse(Box<Error<Rule>>),
    ContextSensitive(String),
}

impl std::error::Error for Errors {}

impl std::str::FromStr for Program {
    type Err = Errors;

    fn from_str(prog_str: &str) -> Result<Self, Self::Err> {
        match LirParser::parse(Rule::program, prog_str) {
            Ok(mut parse_tree) => create_program(parse_tree.next().unwrap()),
            Err(err) => Err(Errors::Parse(Box::new(err))),
        }
    }
}

fn bad(msg: String) -> Errors {
    Errors::ContextSensitive(msg)
}

// SECTION: types

fn parse_type(pair: Pair<Rule>) -> Result<Type, Errors> {
    let inner = pair.into_inner().next().unwrap();
    match inner.as_rule() {
        Rule::ptr_type => Ok(ptr_ty(parse_type(inner.into_inner().next().unwrap())?)),
        Rule::fn_type => parse_fn_type(inner),
        Rule::base_type => match inner.as_str() {
            "int" => Ok(int_ty()),
            name => Ok(struct_ty(struct_id(name))),
        },
        _ => unreachable!("not a type: {:#?}", inner),
    }
}

fn parse_fn_type(pair: Pair<Rule>) -> Result<Type, Errors> {
    let mut param_ty = vec![];
    let mut ret_ty = None;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::type_list => {
                for t in p.into_inner() {
                    param_ty.push(parse_type(t)?);
                }
            }
            Rule::ret_type => ret_ty = parse_ret_type(p)?,
            _ => unreachable!("not part of a function type: {:#?}", p),
        }
    }
    Ok(func_ty(ret_ty, param_ty))
}

// `_` in return position means "returns nothing".
fn parse_ret_type(pair: Pair<Rule>) -> Result<Option<Type>, Errors> {
    let t = pair.into_inner().next().unwrap();
    if t.as_str().trim() == "_" {
        Ok(None)
    } else {
        Ok(Some(parse_type(t)?))
    }
}

// SECTION: program assembly

// Symbol tables threaded through body parsing.
struct Symbols {
    structs: Map<StructId, Set<FieldId>>,
    globals: Map<String, VarId>,
    // function and extern names, typed as values (`&fn-type`)
    fn_refs: Map<String, VarId>,
}

impl Symbols {
    fn resolve(&self, ctx: &FnCtx, name: &str) -> Result<VarId, Errors> {
        if let Some(v) = ctx.vars.get(name) {
            return Ok(v.clone());
        }
        if let Some(v) = self.globals.get(name) {
            return Ok(v.clone());
        }
        if let Some(v) = self.fn_refs.get(name) {
            return Ok(v.clone());
        }
        Err(bad(format!(
            "undeclared variable {name} in function {}",
            ctx.scope
        )))
    }
}

struct FnCtx {
    scope: FuncId,
    vars: Map<String, VarId>,
}

fn create_program(parse_tree: Pair<Rule>) -> Result<Program, Errors> {
    let decls: Vec<Pair<Rule>> = parse_tree
        .into_inner()
        .filter(|p| p.as_rule() != Rule::EOI)
        .collect();

    let mut program = Program::default();

    // pass 1: everything except function bodies, so bodies can reference
    // declarations in any order.
    let mut fn_sigs: Map<String, Type> = Map::new();
    for decl in &decls {
        match decl.as_rule() {
            Rule::struct_def => {
                let mut inner = decl.clone().into_inner();
                let id = struct_id(inner.next().unwrap().as_str());
                let mut fields = Set::new();
                for fd in inner {
                    let mut fd = fd.into_inner();
                    let name = fd.next().unwrap().as_str();
                    let typ = parse_type(fd.next().unwrap())?;
                    fields.insert(field_id(name, typ));
                }
                program.structs.insert(id, fields);
            }
            Rule::vtable_def => {
                let mut inner = decl.clone().into_inner();
                let id = struct_id(inner.next().unwrap().as_str());
                let mut parent = None;
                let mut slots = vec![];
                for p in inner {
                    match p.as_rule() {
                        Rule::extends_clause => {
                            parent = Some(struct_id(p.into_inner().next().unwrap().as_str()));
                        }
                        Rule::name_list => {
                            slots = p.into_inner().map(|n| func_id(n.as_str())).collect();
                        }
                        _ => unreachable!("not part of a vtable: {:#?}", p),
                    }
                }
                program.vtables.insert(id, VTable { parent, slots });
            }
            Rule::ctors_def => {
                if let Some(list) = decl.clone().into_inner().next() {
                    program.ctors = list.into_inner().map(|n| func_id(n.as_str())).collect();
                }
            }
            Rule::extern_def => {
                let mut inner = decl.clone().into_inner();
                let id = func_id(inner.next().unwrap().as_str());
                let typ = parse_fn_type(inner.next().unwrap())?;
                program.externs.insert(id, typ);
            }
            Rule::global_def => {
                let mut inner = decl.clone().into_inner();
                let name = inner.next().unwrap().as_str();
                let typ = parse_type(inner.next().unwrap())?;
                program.globals.insert(var_id(name, typ, None));
            }
            Rule::func_def => {
                let mut inner = decl.clone().into_inner();
                let name = inner.next().unwrap().as_str();
                let mut param_ty = vec![];
                let mut ret_ty = None;
                for p in inner {
                    match p.as_rule() {
                        Rule::param_list => {
                            for param in p.into_inner() {
                                let t = param.into_inner().nth(1).unwrap();
                                param_ty.push(parse_type(t)?);
                            }
                        }
                        Rule::ret_type => {
                            ret_ty = parse_ret_type(p)?;
                            break;
                        }
                        _ => break,
                    }
                }
                fn_sigs.insert(name.to_string(), func_ty(ret_ty, param_ty));
            }
            _ => unreachable!("not a declaration: {:#?}", decl),
        }
    }

    let mut symbols = Symbols {
        structs: program.structs.clone(),
        globals: program
            .globals
            .iter()
            .map(|g| (g.name().to_string(), g.clone()))
            .collect(),
        fn_refs: Map::new(),
    };
    for (name, typ) in &fn_sigs {
        symbols
            .fn_refs
            .insert(name.clone(), var_id(name, ptr_ty(typ.clone()), None));
    }
    for (id, typ) in &program.externs {
        symbols
            .fn_refs
            .insert(id.name().to_string(), var_id(id.name(), ptr_ty(typ.clone()), None));
    }

    // pass 2: function bodies.
    for decl in decls {
        if decl.as_rule() == Rule::func_def {
            let func = create_function(decl, &symbols)?;
            program.functions.insert(func.id.clone(), func);
        }
    }

    Ok(program)
}

fn create_function(pair: Pair<Rule>, symbols: &Symbols) -> Result<Function, Errors> {
    let mut inner = pair.into_inner();
    let id = func_id(inner.next().unwrap().as_str());

    let mut ctx = FnCtx {
        scope: id.clone(),
        vars: Map::new(),
    };
    let mut params = vec![];
    let mut locals = Set::new();
    let mut ret_ty = None;
    let mut body = Map::new();

    for p in inner {
        match p.as_rule() {
            Rule::param_list => {
                for param in p.into_inner() {
                    let v = create_var(param, &ctx.scope)?;
                    ctx.vars.insert(v.name().to_string(), v.clone());
                    params.push(v);
                }
            }
            Rule::ret_type => ret_ty = parse_ret_type(p)?,
            Rule::let_decl => {
                for param in p.into_inner() {
                    let v = create_var(param, &ctx.scope)?;
                    ctx.vars.insert(v.name().to_string(), v.clone());
                    locals.insert(v);
                }
            }
            Rule::basic_block => {
                let bb = create_block(p, symbols, &ctx)?;
                body.insert(bb.id.clone(), bb);
            }
            _ => unreachable!("not part of a function: {:#?}", p),
        }
    }

    Ok(Function {
        id,
        ret_ty,
        params,
        locals,
        body,
    })
}

fn create_var(param: Pair<Rule>, scope: &FuncId) -> Result<VarId, Errors> {
    let mut inner = param.into_inner();
    let name = inner.next().unwrap().as_str();
    let typ = parse_type(inner.next().unwrap())?;
    Ok(var_id(name, typ, Some(scope.clone())))
}

fn create_block(pair: Pair<Rule>, symbols: &Symbols, ctx: &FnCtx) -> Result<BasicBlock, Errors> {
    let mut inner = pair.into_inner();
    let id = bb_id(inner.next().unwrap().as_str());

    let mut insts = vec![];
    let mut term = None;
    for p in inner {
        match p.as_rule() {
            Rule::branch_t | Rule::jump_t | Rule::ret_t | Rule::calldir_t | Rule::callidt_t => {
                term = Some(create_terminal(p, symbols, ctx)?);
            }
            _ => insts.push(create_inst(p, symbols, ctx)?),
        }
    }

    Ok(BasicBlock {
        id,
        insts,
        term: term.unwrap(),
    })
}

fn create_operand(pair: Pair<Rule>, symbols: &Symbols, ctx: &FnCtx) -> Result<Operand, Errors> {
    let inner = pair.into_inner().next().unwrap();
    match inner.as_rule() {
        Rule::int => Ok(Operand::CInt(inner.as_str().parse().unwrap())),
        Rule::ident => Ok(Operand::Var(symbols.resolve(ctx, inner.as_str())?)),
        _ => unreachable!("not an operand: {:#?}", inner),
    }
}

fn create_inst(pair: Pair<Rule>, symbols: &Symbols, ctx: &FnCtx) -> Result<Instruction, Errors> {
    let rule = pair.as_rule();
    let mut inner = pair.into_inner();

    let mut next_var = |inner: &mut pest::iterators::Pairs<Rule>| -> Result<VarId, Errors> {
        symbols.resolve(ctx, inner.next().unwrap().as_str())
    };

    let inst = match rule {
        Rule::addrof_i => {
            let lhs = next_var(&mut inner)?;
            let op = next_var(&mut inner)?;
            Instruction::AddrOf { lhs, op }
        }
        Rule::alloc_i => {
            let lhs = next_var(&mut inner)?;
            let num = create_operand(inner.next().unwrap(), symbols, ctx)?;
            // the allocation-site id is declared by use
            let id_name = inner.next().unwrap().as_str();
            let id = var_id(id_name, lhs.typ(), Some(ctx.scope.clone()));
            Instruction::Alloc { lhs, num, id }
        }
        Rule::arith_i => {
            let lhs = next_var(&mut inner)?;
            let aop = match inner.next().unwrap().as_str() {
                "add" => ArithOp::Add,
                "sub" => ArithOp::Subtract,
                "mul" => ArithOp::Multiply,
                "div" => ArithOp::Divide,
                op => unreachable!("unknown arithmetic operator {op}"),
            };
            let op1 = create_operand(inner.next().unwrap(), symbols, ctx)?;
            let op2 = create_operand(inner.next().unwrap(), symbols, ctx)?;
            Instruction::Arith { lhs, aop, op1, op2 }
        }
        Rule::cmp_i => {
            let lhs = next_var(&mut inner)?;
            let rop = match inner.next().unwrap().as_str() {
                "eq" => RelaOp::Eq,
                "neq" => RelaOp::Neq,
                "lt" => RelaOp::Lt,
                "lte" => RelaOp::Lte,
                "gt" => RelaOp::Gt,
                "gte" => RelaOp::Gte,
                op => unreachable!("unknown comparison operator {op}"),
            };
            let op1 = create_operand(inner.next().unwrap(), symbols, ctx)?;
            let op2 = create_operand(inner.next().unwrap(), symbols, ctx)?;
            Instruction::Cmp { lhs, rop, op1, op2 }
        }
        Rule::callext_i => {
            let mut lhs = None;
            let mut p = inner.next().unwrap();
            if p.as_rule() == Rule::call_lhs {
                lhs = Some(symbols.resolve(ctx, p.into_inner().next().unwrap().as_str())?);
                p = inner.next().unwrap();
            }
            let ext_callee = func_id(p.as_str());
            let args = create_args(inner.next(), symbols, ctx)?;
            Instruction::CallExt {
                lhs,
                ext_callee,
                args,
            }
        }
        Rule::copy_i => {
            let lhs = next_var(&mut inner)?;
            let op = create_operand(inner.next().unwrap(), symbols, ctx)?;
            Instruction::Copy { lhs, op }
        }
        Rule::gep_i => {
            let lhs = next_var(&mut inner)?;
            let src = next_var(&mut inner)?;
            let idx = create_operand(inner.next().unwrap(), symbols, ctx)?;
            Instruction::Gep { lhs, src, idx }
        }
        Rule::gfp_i => {
            let lhs = next_var(&mut inner)?;
            let src = next_var(&mut inner)?;
            let field_name = inner.next().unwrap().as_str();
            let field = resolve_field(symbols, ctx, &src, field_name)?;
            Instruction::Gfp { lhs, src, field }
        }
        Rule::load_i => {
            let lhs = next_var(&mut inner)?;
            let src = next_var(&mut inner)?;
            Instruction::Load { lhs, src }
        }
        Rule::store_i => {
            let dst = next_var(&mut inner)?;
            let op = create_operand(inner.next().unwrap(), symbols, ctx)?;
            Instruction::Store { dst, op }
        }
        Rule::vload_i => {
            let lhs = next_var(&mut inner)?;
            let obj = next_var(&mut inner)?;
            let slot_str = inner.next().unwrap().as_str();
            let slot = slot_str
                .parse::<usize>()
                .map_err(|_| bad(format!("invalid vtable slot {slot_str} in {}", ctx.scope)))?;
            Instruction::VtLoad { lhs, obj, slot }
        }
        Rule::asm_i => {
            let quoted = inner.next().unwrap().as_str();
            Instruction::Asm {
                text: quoted[1..quoted.len() - 1].to_string(),
            }
        }
        _ => unreachable!("not an instruction: {rule:?}"),
    };

    Ok(inst)
}

fn resolve_field(
    symbols: &Symbols,
    ctx: &FnCtx,
    src: &VarId,
    field_name: &str,
) -> Result<FieldId, Errors> {
    let sid = src.typ().as_struct_ptr().cloned().ok_or_else(|| {
        bad(format!(
            "$gfp through {src} in {}, which is not a struct pointer",
            ctx.scope
        ))
    })?;
    let fields = symbols
        .structs
        .get(&sid)
        .ok_or_else(|| bad(format!("$gfp into unknown struct {sid} in {}", ctx.scope)))?;
    fields
        .iter()
        .find(|f| f.name == field_name)
        .cloned()
        .ok_or_else(|| bad(format!("struct {sid} has no field {field_name}")))
}

fn create_args(
    pair: Option<Pair<Rule>>,
    symbols: &Symbols,
    ctx: &FnCtx,
) -> Result<Vec<Operand>, Errors> {
    match pair {
        Some(p) if p.as_rule() == Rule::arg_list => p
            .into_inner()
            .map(|a| create_operand(a, symbols, ctx))
            .collect(),
        _ => Ok(vec![]),
    }
}

fn create_terminal(pair: Pair<Rule>, symbols: &Symbols, ctx: &FnCtx) -> Result<Terminal, Errors> {
    let rule = pair.as_rule();
    let mut inner = pair.into_inner();

    let term = match rule {
        Rule::branch_t => {
            let cond = create_operand(inner.next().unwrap(), symbols, ctx)?;
            let tt = bb_id(inner.next().unwrap().as_str());
            let ff = bb_id(inner.next().unwrap().as_str());
            Terminal::Branch { cond, tt, ff }
        }
        Rule::jump_t => Terminal::Jump(bb_id(inner.next().unwrap().as_str())),
        Rule::ret_t => match inner.next() {
            Some(val) => Terminal::Ret(Some(create_operand(
                val.into_inner().next().unwrap(),
                symbols,
                ctx,
            )?)),
            None => Terminal::Ret(None),
        },
        Rule::calldir_t | Rule::callidt_t => {
            let mut lhs = None;
            let mut p = inner.next().unwrap();
            if p.as_rule() == Rule::call_lhs {
                lhs = Some(symbols.resolve(ctx, p.into_inner().next().unwrap().as_str())?);
                p = inner.next().unwrap();
            }
            let callee_name = p.as_str().to_string();
            let mut args = vec![];
            let mut next_bb = None;
            for rest in inner {
                match rest.as_rule() {
                    Rule::arg_list => args = create_args(Some(rest), symbols, ctx)?,
                    Rule::ident => next_bb = Some(bb_id(rest.as_str())),
                    _ => unreachable!("not part of a call: {:#?}", rest),
                }
            }
            let next_bb = next_bb.unwrap();
            if rule == Rule::calldir_t {
                Terminal::CallDirect {
                    lhs,
                    callee: func_id(&callee_name),
                    args,
                    next_bb,
                }
            } else {
                Terminal::CallIndirect {
                    lhs,
                    callee: symbols.resolve(ctx, &callee_name)?,
                    args,
                    next_bb,
                }
            }
        }
        _ => unreachable!("not a terminal: {rule:?}"),
    };

    Ok(term)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DISPATCH: &str = r#"
struct base {
  tag: int
}

vtable base { base_print }
vtable derived extends base { derived_print }

extern print: (int) -> _

fn base_print(self: &base) -> _ {
  entry:
    $ret
}

fn derived_print(self: &derived) -> _ {
  entry:
    $ret
}

fn main() -> int {
  let b: &derived, a: &base, m: &(&base) -> _, r: int
  entry:
    b = $alloc 1 [_b1]
    a = $copy b
    m = $vload a 0
    r = $call_idt m(a) then exit
  exit:
    $ret r
}
"#;

    #[test]
    fn parses_virtual_dispatch_module() {
        let program: Program = DISPATCH.parse().unwrap();
        assert_eq!(program.functions.len(), 3);
        assert_eq!(program.vtables.len(), 2);
        assert_eq!(
            program.vtables[&struct_id("derived")].parent,
            Some(struct_id("base"))
        );

        let main = &program.functions[&func_id("main")];
        let entry = &main.body[&bb_id("entry")];
        assert_eq!(entry.insts.len(), 3);
        assert!(matches!(
            entry.insts[2],
            Instruction::VtLoad { slot: 0, .. }
        ));
        assert!(matches!(entry.term, Terminal::CallIndirect { .. }));
    }

    #[test]
    fn function_names_resolve_as_operands() {
        let src = r#"
fn callee() -> _ {
  entry:
    $ret
}

fn main() -> _ {
  let p: &() -> _
  entry:
    p = $copy callee
    $call_idt p() then exit
  exit:
    $ret
}
"#;
        let program: Program = src.parse().unwrap();
        let main = &program.functions[&func_id("main")];
        match &main.body[&bb_id("entry")].insts[0] {
            Instruction::Copy {
                op: Operand::Var(v),
                ..
            } => {
                assert_eq!(v.name(), "callee");
                assert_eq!(v.scope(), None);
                assert!(v.typ().is_fn_ptr());
            }
            other => panic!("expected a copy of a function reference, got {other}"),
        }
    }

    #[test]
    fn undeclared_variables_are_rejected() {
        let src = r#"
fn main() -> _ {
  entry:
    x = $copy 1
    $ret
}
"#;
        assert!(matches!(
            src.parse::<Program>(),
            Err(Errors::ContextSensitive(_))
        ));
    }

    #[test]
    fn prints_and_reparses_to_the_same_program() {
        let program: Program = DISPATCH.parse().unwrap();
        let reparsed: Program = program.to_string().parse().unwrap();
        assert_eq!(program, reparsed);
    }
}
