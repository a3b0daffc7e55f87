//! The class-hierarchy analyzer: subtype closure and vtable-slot resolution
//! computed from the vtable declarations of all loaded modules.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::middle_end::irdb::IrDb;
use crate::middle_end::lir::*;

#[derive(Clone, Debug)]
pub struct TypeHierarchy {
    // every struct and class the modules declare
    types: Set<StructId>,
    // full slot tables, one per class
    vtables: Map<StructId, Vec<FuncId>>,
    // reflexive-transitive subtype sets, one per class
    subtypes: Map<StructId, Set<StructId>>,
}

impl TypeHierarchy {
    pub fn new(irdb: &IrDb) -> Self {
        let mut types = Set::new();
        let mut vtables: Map<StructId, Vec<FuncId>> = Map::new();
        let mut children: Map<StructId, Set<StructId>> = Map::new();

        for m in irdb.modules() {
            let program = &m.program.0;
            types.extend(program.structs.keys().cloned());
            for (id, vt) in &program.vtables {
                types.insert(id.clone());
                vtables.insert(id.clone(), vt.slots.clone());
                if let Some(parent) = &vt.parent {
                    children
                        .entry(parent.clone())
                        .or_default()
                        .insert(id.clone());
                }
            }
        }

        let mut subtypes = Map::new();
        for id in vtables.keys() {
            let mut seen = Set::new();
            let mut worklist = vec![id.clone()];
            while let Some(t) = worklist.pop() {
                if seen.insert(t.clone()) {
                    worklist.extend(children.get(&t).into_iter().flatten().cloned());
                }
            }
            subtypes.insert(id.clone(), seen);
        }

        TypeHierarchy {
            types,
            vtables,
            subtypes,
        }
    }

    pub fn has_type(&self, s: &StructId) -> bool {
        self.types.contains(s)
    }

    pub fn has_vftable(&self, s: &StructId) -> bool {
        self.vtables.contains_key(s)
    }

    /// The function in slot `slot` of `s`'s vtable.
    pub fn vft_entry(&self, s: &StructId, slot: usize) -> Option<&FuncId> {
        self.vtables.get(s)?.get(slot)
    }

    /// `s` and every transitive subtype of `s`.
    pub fn subtypes_of(&self, s: &StructId) -> Set<StructId> {
        self.subtypes
            .get(s)
            .cloned()
            .unwrap_or_else(|| Set::from([s.clone()]))
    }

    pub fn num_types(&self) -> usize {
        self.types.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle_end::irdb::Module;
    use pretty_assertions::assert_eq;

    fn db(src: &str) -> IrDb {
        let program: Program = src.parse().unwrap();
        IrDb::new(vec![Module {
            path: "<test>".to_string(),
            program: program.validate().unwrap(),
        }])
    }

    const DIAMONDISH: &str = r#"
vtable a { a_m }
vtable b extends a { b_m }
vtable c extends a { c_m }
vtable d extends b { d_m }

fn a_m(self: &a) -> _ {
  entry:
    $ret
}

fn b_m(self: &b) -> _ {
  entry:
    $ret
}

fn c_m(self: &c) -> _ {
  entry:
    $ret
}

fn d_m(self: &d) -> _ {
  entry:
    $ret
}
"#;

    #[test]
    fn subtype_closure_is_reflexive_and_transitive() {
        let th = TypeHierarchy::new(&db(DIAMONDISH));

        assert_eq!(
            th.subtypes_of(&struct_id("a")),
            Set::from([
                struct_id("a"),
                struct_id("b"),
                struct_id("c"),
                struct_id("d")
            ])
        );
        assert_eq!(
            th.subtypes_of(&struct_id("b")),
            Set::from([struct_id("b"), struct_id("d")])
        );
    }

    #[test]
    fn slot_lookup_is_per_class() {
        let th = TypeHierarchy::new(&db(DIAMONDISH));

        assert_eq!(th.vft_entry(&struct_id("b"), 0), Some(&func_id("b_m")));
        assert_eq!(th.vft_entry(&struct_id("b"), 1), None);
        assert!(th.has_vftable(&struct_id("d")));
        assert!(!th.has_vftable(&struct_id("e")));
    }
}
