// End-to-end construction scenarios, run on small inline modules.

use collapse::*;
use pretty_assertions::assert_eq;

use std::collections::BTreeSet as Set;

use crate::commons::Soundness;
use crate::middle_end::analysis::points_to::PointerAnalysisType;
use crate::middle_end::irdb::{IrDb, Module};
use crate::middle_end::lir::*;

use super::*;

fn module(src: &str) -> Module {
    Module {
        path: "<test>".to_string(),
        program: src.parse::<Program>().unwrap().validate().unwrap(),
    }
}

fn db(srcs: &[&str]) -> IrDb {
    IrDb::new(srcs.iter().map(|s| module(s)).collect())
}

fn build<'a>(
    irdb: &'a mut IrDb,
    cg_type: CallGraphAnalysisType,
    entries: &[&str],
) -> Icfg<'a> {
    let entries: Vec<String> = entries.iter().map(|s| s.to_string()).collect();
    Icfg::new(
        irdb,
        cg_type,
        &entries,
        None,
        None,
        PointerAnalysisType::CFLAnders,
        Soundness::Soundy,
        false,
    )
    .unwrap()
}

fn callee_names(icfg: &Icfg, site: &InstId) -> Set<String> {
    icfg.get_callees_of_call_at(site)
        .iter()
        .map(|f| f.name().to_string())
        .collect()
}

fn vertex_names(icfg: &Icfg) -> Set<String> {
    icfg.get_all_vertex_functions()
        .iter()
        .map(|f| f.name().to_string())
        .collect()
}

const DIRECT: &str = r#"
fn g() -> _ {
  entry:
    $ret
}

fn f() -> _ {
  entry:
    $call_dir g() then exit
  exit:
    $ret
}

fn main() -> _ {
  entry:
    $call_dir f() then exit
  exit:
    $ret
}
"#;

const VIRTUAL: &str = r#"
vtable a { a_m }
vtable b extends a { b_m }
vtable c extends a { c_m }

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

fn main() -> _ {
  let o: &b, r: &a, m: &(&a) -> _
  entry:
    o = $alloc 1 [_o1]
    r = $copy o
    m = $vload r 0
    $call_idt m(r) then exit
  exit:
    $ret
}
"#;

const FNPTR: &str = r#"
fn h() -> _ {
  entry:
    $ret
}

fn main() -> _ {
  let p: &() -> _
  entry:
    p = $copy h
    $call_idt p() then exit
  exit:
    $ret
}
"#;

// the one virtual site of VIRTUAL: the terminal after three instructions
fn virtual_site() -> InstId {
    inst_id(func_id("main"), bb_id("entry"), 3)
}

fn fnptr_site() -> InstId {
    inst_id(func_id("main"), bb_id("entry"), 1)
}

#[test]
fn direct_calls_only() {
    let mut irdb = db(&[DIRECT]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::CHA, &["main"]);

    assert_eq!(icfg.call_graph().num_vertices(), 3);
    assert_eq!(icfg.call_graph().num_edges(), 2);
    assert_eq!(
        callee_names(&icfg, &inst_id(func_id("main"), bb_id("entry"), 0)),
        Set::from(["f".to_string()])
    );
    assert_eq!(
        callee_names(&icfg, &inst_id(func_id("f"), bb_id("entry"), 0)),
        Set::from(["g".to_string()])
    );
}

#[test]
fn recursion_makes_a_self_loop() {
    let src = r#"
fn rec() -> _ {
  entry:
    $call_dir rec() then exit
  exit:
    $ret
}

fn main() -> _ {
  entry:
    $call_dir rec() then exit
  exit:
    $ret
}
"#;
    let mut irdb = db(&[src]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::CHA, &["main"]);

    assert_eq!(icfg.call_graph().num_vertices(), 2);
    assert_eq!(icfg.call_graph().num_edges(), 2);
    assert_eq!(
        vertex_names(&icfg),
        Set::from(["main".to_string(), "rec".to_string()])
    );
    // rec is called from main and from itself
    assert_eq!(icfg.get_callers_of(&func_id("rec")).len(), 2);
}

#[test]
fn virtual_dispatch_under_cha() {
    let mut irdb = db(&[VIRTUAL]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::CHA, &["main"]);

    assert!(icfg.is_indirect_function_call(&virtual_site()));
    assert!(icfg.is_virtual_function_call(&virtual_site()));
    assert_eq!(
        callee_names(&icfg, &virtual_site()),
        Set::from(["a_m".to_string(), "b_m".to_string(), "c_m".to_string()])
    );
}

#[test]
fn virtual_dispatch_under_rta() {
    let mut irdb = db(&[VIRTUAL]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::RTA, &["main"]);

    // only b is ever constructed
    assert_eq!(
        callee_names(&icfg, &virtual_site()),
        Set::from(["b_m".to_string()])
    );
}

#[test]
fn virtual_dispatch_under_dta() {
    let mut irdb = db(&[VIRTUAL]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::DTA, &["main"]);

    // restricted to the declared static type of the receiver
    assert_eq!(
        callee_names(&icfg, &virtual_site()),
        Set::from(["a_m".to_string()])
    );
}

#[test]
fn virtual_dispatch_under_vta_and_otf() {
    for cg_type in [CallGraphAnalysisType::VTA, CallGraphAnalysisType::OTF] {
        let mut irdb = db(&[VIRTUAL]);
        let icfg = build(&mut irdb, cg_type, &["main"]);

        // points-to narrows the receiver to the b allocation
        assert_eq!(
            callee_names(&icfg, &virtual_site()),
            Set::from(["b_m".to_string()]),
            "under {cg_type}"
        );
    }
}

#[test]
fn function_pointer_resolves_on_the_fly() {
    let mut irdb = db(&[FNPTR]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::OTF, &["main"]);

    assert_eq!(
        callee_names(&icfg, &fnptr_site()),
        Set::from(["h".to_string()])
    );
    // h was enqueued and visited once the site resolved
    assert!(vertex_names(&icfg).contains("h"));
    assert_eq!(icfg.num_indirect_call_targets(&fnptr_site()), Some(1));
}

#[test]
fn function_pointer_calls_tolerate_extra_arguments() {
    let src = r#"
fn h(x: int) -> _ {
  entry:
    $ret
}

fn k(x: int, y: int, z: int) -> _ {
  entry:
    $ret
}

fn main() -> _ {
  let p: &(int, int) -> _
  entry:
    p = $copy h
    p = $copy k
    $call_idt p(1, 2) then exit
  exit:
    $ret
}
"#;
    let mut irdb = db(&[src]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::OTF, &["main"]);

    // h takes fewer parameters than the call supplies and stays callable;
    // k takes more and is rejected
    let site = inst_id(func_id("main"), bb_id("entry"), 2);
    assert_eq!(callee_names(&icfg, &site), Set::from(["h".to_string()]));
}

#[test]
fn function_pointer_stays_unresolved_without_a_resolver() {
    let mut irdb = db(&[FNPTR]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::NoResolve, &["main"]);

    assert_eq!(icfg.call_graph().num_edges(), 0);
    assert_eq!(icfg.num_indirect_call_targets(&fnptr_site()), Some(0));
    assert_eq!(vertex_names(&icfg), Set::from(["main".to_string()]));
}

#[test]
fn unknown_entries_are_skipped() {
    let mut irdb = db(&[DIRECT]);
    let icfg = build(
        &mut irdb,
        CallGraphAnalysisType::CHA,
        &["main", "does_not_exist"],
    );

    assert_eq!(
        vertex_names(&icfg),
        Set::from(["main".to_string(), "f".to_string(), "g".to_string()])
    );
}

#[test]
fn include_globals_requires_a_single_module() {
    let mut irdb = db(&[DIRECT, FNPTR]);
    let result = Icfg::new(
        &mut irdb,
        CallGraphAnalysisType::CHA,
        &["main".to_string()],
        None,
        None,
        PointerAnalysisType::CFLAnders,
        Soundness::Soundy,
        true,
    );

    assert!(result.is_err());
}

#[test]
fn include_globals_seeds_the_constructor_model() {
    let src = r#"
ctors { init }

global g: int

fn init() -> _ {
  entry:
    $ret
}

fn main() -> _ {
  entry:
    $ret
}
"#;
    let mut irdb = db(&[src]);
    let entries = vec!["main".to_string()];
    let icfg = Icfg::new(
        &mut irdb,
        CallGraphAnalysisType::CHA,
        &entries,
        None,
        None,
        PointerAnalysisType::CFLAnders,
        Soundness::Soundy,
        true,
    )
    .unwrap();

    let ctor = func_id(crate::middle_end::irdb::GLOBALS_MODEL_FN);
    let v = icfg.call_graph().vertex_of(&ctor).unwrap();
    let callees: Set<String> = icfg
        .call_graph()
        .out_edges(v)
        .map(|e| icfg.call_graph().func(e.callee).name().to_string())
        .collect();
    assert_eq!(
        callees,
        Set::from(["init".to_string(), "main".to_string()])
    );
}

#[test]
fn invalid_configuration_is_rejected() {
    let mut irdb = db(&[DIRECT]);
    let result = Icfg::new(
        &mut irdb,
        CallGraphAnalysisType::Invalid,
        &["main".to_string()],
        None,
        None,
        PointerAnalysisType::CFLAnders,
        Soundness::Soundy,
        false,
    );
    assert!(result.is_err());

    let result = Icfg::new(
        &mut irdb,
        CallGraphAnalysisType::CHA,
        &["main".to_string()],
        None,
        None,
        PointerAnalysisType::CFLAnders,
        Soundness::Invalid,
        false,
    );
    assert!(result.is_err());
}

#[test]
fn empty_entry_list_terminates_with_an_empty_graph() {
    let mut irdb = db(&[DIRECT]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::CHA, &[]);

    assert_eq!(icfg.call_graph().num_vertices(), 0);
    assert_eq!(icfg.call_graph().num_edges(), 0);
}

#[test]
fn all_sentinel_covers_every_definition() {
    let src = r#"
fn f() -> _ {
  entry:
    $ret
}

fn g() -> _ {
  entry:
    $ret
}
"#;
    let mut irdb = db(&[src]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::CHA, &["__ALL__"]);

    assert_eq!(
        vertex_names(&icfg),
        Set::from(["f".to_string(), "g".to_string()])
    );
}

#[test]
fn all_sentinel_with_no_definitions_yields_an_empty_graph() {
    let src = r#"
extern only_decl: () -> _
"#;
    let mut irdb = db(&[src]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::CHA, &["__ALL__"]);

    assert_eq!(icfg.call_graph().num_vertices(), 0);
}

#[test]
fn asm_only_functions_have_a_vertex_and_no_out_edges() {
    let src = r#"
fn main() -> _ {
  entry:
    $asm "nop"
    $ret
}
"#;
    let mut irdb = db(&[src]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::CHA, &["main"]);

    assert_eq!(vertex_names(&icfg), Set::from(["main".to_string()]));
    assert_eq!(icfg.call_graph().num_edges(), 0);
}

#[test]
fn calls_to_declarations_are_terminal() {
    let src = r#"
extern getc: () -> int

fn main() -> _ {
  let c: int
  entry:
    c = $call_ext getc()
    $ret
}
"#;
    let mut irdb = db(&[src]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::CHA, &["main"]);

    let site = inst_id(func_id("main"), bb_id("entry"), 0);
    assert_eq!(callee_names(&icfg, &site), Set::from(["getc".to_string()]));
    // the declaration's vertex has no outgoing edges
    let v = icfg.call_graph().vertex_of(&func_id("getc")).unwrap();
    assert_eq!(icfg.call_graph().out_edges(v).count(), 0);
}

#[test]
fn modules_link_into_one_namespace() {
    let lib = r#"
fn helper() -> _ {
  entry:
    $ret
}
"#;
    let app = r#"
fn main() -> _ {
  entry:
    $call_dir helper() then exit
  exit:
    $ret
}
"#;
    let mut irdb = db(&[app, lib]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::CHA, &["main"]);

    assert_eq!(
        vertex_names(&icfg),
        Set::from(["main".to_string(), "helper".to_string()])
    );
}

// SECTION: invariants

#[test]
fn edges_carry_call_sites_of_their_source() {
    let mut irdb = db(&[VIRTUAL]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::OTF, &["main"]);

    for e in icfg.call_graph().edges() {
        let caller = icfg.call_graph().func(e.caller);
        assert_eq!(&e.site.func, caller);
        let inst = icfg.irdb().instruction(&e.site).unwrap();
        assert!(inst.is_call());
    }
}

#[test]
fn indirect_counts_match_edge_counts() {
    let mut irdb = db(&[VIRTUAL]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::CHA, &["main"]);

    for (site, count) in icfg.indirect_calls() {
        let v = icfg.call_graph().vertex_of(&site.func).unwrap();
        let edges = icfg
            .call_graph()
            .out_edges(v)
            .filter(|e| e.site == *site)
            .count();
        assert_eq!(edges, *count);
    }
}

#[test]
fn construction_is_idempotent() {
    let first = {
        let mut irdb = db(&[VIRTUAL]);
        build(&mut irdb, CallGraphAnalysisType::OTF, &["main"]).as_json()
    };
    let second = {
        let mut irdb = db(&[VIRTUAL]);
        build(&mut irdb, CallGraphAnalysisType::OTF, &["main"]).as_json()
    };

    assert_eq!(first, second);
}

// SECTION: rendering

#[test]
fn dot_output_lists_vertices_and_labelled_edges() {
    let mut irdb = db(&[DIRECT]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::CHA, &["main"]);

    let expected = r#"digraph CallGraph{
0[label="main"];
0->1[label="$call_dir f() then exit"];
1[label="f"];
1->2[label="$call_dir g() then exit"];
2[label="g"];
}
"#;
    collapsed_eq!(&icfg.as_dot(), expected);
}

#[test]
fn json_round_trips_the_adjacency() {
    let mut irdb = db(&[DIRECT]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::CHA, &["main"]);

    let emitted = serde_json::to_string(&icfg.as_json()).unwrap();
    let parsed: serde_json::Value = emitted.parse().unwrap();
    let adjacency = parsed
        .get(icfg::CG_JSON_KEY)
        .and_then(|v| v.as_object())
        .unwrap();

    // every vertex appears, callers without outgoing edges as empty arrays
    assert_eq!(adjacency.len(), icfg.call_graph().num_vertices());
    assert_eq!(adjacency["g"].as_array().unwrap().len(), 0);

    for (vid, v) in icfg.call_graph().vertices() {
        let names: Vec<String> = icfg
            .call_graph()
            .out_edges(vid)
            .map(|e| icfg.call_graph().func(e.callee).name().to_string())
            .collect();
        let parsed_names: Vec<String> = adjacency[v.func.name()]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n.as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, parsed_names);
    }
}

// SECTION: facade queries

#[test]
fn syntactic_queries_see_call_sites_and_successors() {
    let mut irdb = db(&[DIRECT]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::CHA, &["main"]);

    let main = func_id("main");
    let sites = icfg.get_calls_from_within(&main);
    assert_eq!(sites, vec![inst_id(main.clone(), bb_id("entry"), 0)]);

    // the call returns to the terminal of the (empty) exit block
    assert_eq!(
        icfg.get_return_sites_of_call_at(&sites[0]),
        vec![inst_id(main.clone(), bb_id("exit"), 0)]
    );

    // the return in exit is a non-call non-start node
    assert!(icfg
        .all_non_call_start_nodes()
        .contains(&inst_id(main, bb_id("exit"), 0)));
}

#[test]
fn function_lookup_covers_definitions_and_declarations() {
    let src = r#"
extern getc: () -> int

fn main() -> _ {
  entry:
    $ret
}
"#;
    let mut irdb = db(&[src]);
    let icfg = build(&mut irdb, CallGraphAnalysisType::CHA, &["main"]);

    assert!(icfg.get_function("main").is_some());
    assert!(icfg.get_function("getc").is_some());
    assert!(icfg.get_function("missing").is_none());
    assert_eq!(icfg.get_all_functions().len(), 2);
}
