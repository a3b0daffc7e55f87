//! The module database: owns the loaded LIR modules and hands out function
//! and instruction handles.  Every analysis borrows from here, so the
//! database must outlive the ICFG built on top of it.

use derive_more::Display;

use super::lir::*;
use crate::commons::Valid;

use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// The name of the synthesized function modeling global initialization.
pub const GLOBALS_MODEL_FN: &str = "__globals_init";

#[derive(Clone, Debug)]
pub struct Module {
    pub path: String,
    pub program: Valid<Program>,
}

#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct LoadError(pub String);
impl std::error::Error for LoadError {}

/// A function or terminal instruction resolved from an [InstId].
#[derive(Clone, Copy, Debug)]
pub enum InstRef<'a> {
    Inst(&'a Instruction),
    Term(&'a Terminal),
}

impl InstRef<'_> {
    pub fn is_call(&self) -> bool {
        match self {
            InstRef::Inst(i) => i.is_call(),
            InstRef::Term(t) => t.is_call(),
        }
    }
}

impl std::fmt::Display for InstRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InstRef::Inst(i) => write!(f, "{i}"),
            InstRef::Term(t) => write!(f, "{t}"),
        }
    }
}

#[derive(Debug)]
pub struct IrDb {
    modules: Vec<Module>,
    // function name -> index of the module holding its definition
    defs: Map<FuncId, usize>,
    // extern name -> index of the first module declaring it
    decls: Map<FuncId, usize>,
}

impl IrDb {
    pub fn new(modules: Vec<Module>) -> Self {
        let mut defs = Map::new();
        let mut decls = Map::new();
        for (i, m) in modules.iter().enumerate() {
            for f in m.program.0.functions.keys() {
                defs.entry(f.clone()).or_insert(i);
            }
            for f in m.program.0.externs.keys() {
                decls.entry(f.clone()).or_insert(i);
            }
        }

        IrDb {
            modules,
            defs,
            decls,
        }
    }

    /// Parse and validate the modules at the given paths.
    pub fn from_files(paths: &[String]) -> Result<Self, LoadError> {
        let mut modules = vec![];
        for path in paths {
            let src = std::fs::read_to_string(path)
                .map_err(|e| LoadError(format!("could not read module {path}: {e}")))?;
            let program = src
                .parse::<Program>()
                .map_err(|e| LoadError(format!("{path}: {e}")))?
                .validate()
                .map_err(|e| LoadError(format!("{path}: {e}")))?;
            modules.push(Module {
                path: path.clone(),
                program,
            });
        }

        Ok(IrDb::new(modules))
    }

    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    // The whole-program module.  Only meaningful for single-module analyses.
    pub fn get_wpa_module(&self) -> &Module {
        &self.modules[0]
    }

    /// Every function the database knows, definitions and declarations.
    pub fn get_all_functions(&self) -> Vec<FuncId> {
        let mut fns: Vec<FuncId> = self.defs.keys().cloned().collect();
        fns.extend(
            self.decls
                .keys()
                .filter(|f| !self.defs.contains_key(f))
                .cloned(),
        );
        fns
    }

    /// Look up a function or extern declaration by name.
    pub fn get_function(&self, name: &str) -> Option<FuncId> {
        let id = func_id(name);
        if self.defs.contains_key(&id) || self.decls.contains_key(&id) {
            Some(id)
        } else {
            None
        }
    }

    /// Look up a function definition by name.
    pub fn get_function_definition(&self, name: &str) -> Option<&Function> {
        self.function_body(&func_id(name))
    }

    /// The body of `f`, or `None` if `f` is a declaration or unknown.
    pub fn function_body(&self, f: &FuncId) -> Option<&Function> {
        let module = self.defs.get(f)?;
        self.modules[*module].program.0.functions.get(f)
    }

    pub fn is_declaration(&self, f: &FuncId) -> bool {
        !self.defs.contains_key(f)
    }

    pub fn extern_type(&self, f: &FuncId) -> Option<&Type> {
        let module = self.decls.get(f)?;
        self.modules[*module].program.0.externs.get(f)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &Function> {
        self.modules
            .iter()
            .flat_map(|m| m.program.0.functions.values())
    }

    /// Resolve an instruction handle.
    pub fn instruction(&self, n: &InstId) -> Option<InstRef<'_>> {
        let bb = self.function_body(&n.func)?.body.get(&n.bb)?;
        match n.idx.cmp(&bb.insts.len()) {
            std::cmp::Ordering::Less => Some(InstRef::Inst(&bb.insts[n.idx])),
            std::cmp::Ordering::Equal => Some(InstRef::Term(&bb.term)),
            std::cmp::Ordering::Greater => None,
        }
    }

    pub fn num_instructions(&self) -> usize {
        self.definitions()
            .flat_map(|f| f.body.values())
            .map(|bb| bb.insts.len() + 1)
            .sum()
    }

    pub fn num_call_sites(&self) -> usize {
        self.definitions()
            .flat_map(|f| f.body.values())
            .map(|bb| {
                bb.insts.iter().filter(|i| i.is_call()).count()
                    + usize::from(bb.term.is_call())
            })
            .sum()
    }

    /// Synthesize the function that models C-runtime global initialization:
    /// it calls every function in the first module's `ctors` list, then every
    /// user entry, and returns.  The function is added to the first module
    /// and its handle returned.
    pub fn build_runtime_globals_model(&mut self, entries: &[FuncId]) -> FuncId {
        let id = func_id(GLOBALS_MODEL_FN);
        let program = &mut self.modules[0].program.0;

        let mut callees = program.ctors.clone();
        callees.extend(entries.iter().cloned());

        let mut body = Map::new();
        if callees.is_empty() {
            body.insert(
                bb_id("entry"),
                BasicBlock {
                    id: bb_id("entry"),
                    insts: vec![],
                    term: Terminal::Ret(None),
                },
            );
        } else {
            for (i, callee) in callees.iter().enumerate() {
                let this = if i == 0 {
                    bb_id("entry")
                } else {
                    bb_id(&format!("bb{i}"))
                };
                let next = if i + 1 == callees.len() {
                    bb_id("exit")
                } else {
                    bb_id(&format!("bb{}", i + 1))
                };
                body.insert(
                    this.clone(),
                    BasicBlock {
                        id: this,
                        insts: vec![],
                        term: Terminal::CallDirect {
                            lhs: None,
                            callee: callee.clone(),
                            args: vec![],
                            next_bb: next,
                        },
                    },
                );
            }
            body.insert(
                bb_id("exit"),
                BasicBlock {
                    id: bb_id("exit"),
                    insts: vec![],
                    term: Terminal::Ret(None),
                },
            );
        }

        program.functions.insert(
            id.clone(),
            Function {
                id: id.clone(),
                ret_ty: None,
                params: vec![],
                locals: Set::new(),
                body,
            },
        );
        self.defs.insert(id.clone(), 0);

        id
    }
}
