//! Graphviz rendering of control-flow graphs.
//!
//! Blocks are rendered with their instruction text; blocks ending in a call
//! site are colored by call kind, and the whole-program view stitches every
//! direct call site to its callee's entry block.

use super::*;
use crate::middle_end::analysis::Cfg;

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn node_name(f: &FuncId, bb: &BbId) -> String {
    format!("{f}__{bb}")
}

/// Render one function's CFG.  `graph_type_and_name` is the graph header,
/// e.g. `digraph main` or `subgraph cluster_main`.
pub fn dump_cfg(f: &Function, graph_type_and_name: &str) -> String {
    let cfg = Cfg::new(f);
    let mut out = format!(
        "{graph_type_and_name} {{\nlabel = \"{}\";\nnode [shape=box];\n",
        f.id
    );

    for (bbid, bb) in &f.body {
        let mut label = format!("{bbid}:\\l");
        for inst in &bb.insts {
            label.push_str(&format!("  {}\\l", escape(&inst.to_string())));
        }
        label.push_str(&format!("  {}\\l", escape(&bb.term.to_string())));

        // indirect call sites red, direct ones blue
        let color = match &bb.term {
            Terminal::CallIndirect { .. } => " color=red",
            Terminal::CallDirect { .. } => " color=blue",
            _ => "",
        };
        out.push_str(&format!(
            "{} [label=\"{label}\"{color}];\n",
            node_name(&f.id, bbid)
        ));

        for succ in cfg.succ(bbid) {
            out.push_str(&format!(
                "{} -> {};\n",
                node_name(&f.id, bbid),
                node_name(&f.id, succ)
            ));
        }
    }

    out.push_str("}\n");
    out
}

/// Render every function as a cluster, with dashed edges from direct call
/// sites into their callee's entry block.
pub fn dump_cfg_of_whole_program(program: &Program) -> String {
    let mut g = "digraph G {\ncompound = true;\n".to_string();

    for (id, f) in &program.functions {
        g.push_str(&dump_cfg(f, &format!("subgraph cluster_{id}")));
    }

    for f in program.functions.values() {
        for (bbid, bb) in &f.body {
            if let Terminal::CallDirect { callee, .. } = &bb.term {
                if program.functions.contains_key(callee) {
                    g.push_str(&format!(
                        "{} -> {} [style=dashed];\n",
                        node_name(&f.id, bbid),
                        node_name(callee, &bb_id("entry"))
                    ));
                }
            }
        }
    }

    g.push_str("}\n");
    g
}

#[cfg(test)]
mod tests {
    use super::*;

    const CALLER: &str = r#"
fn callee() -> _ {
  entry:
    $ret
}

fn main() -> _ {
  let p: &() -> _
  entry:
    p = $copy callee
    $call_dir callee() then mid
  mid:
    $call_idt p() then exit
  exit:
    $ret
}
"#;

    #[test]
    fn call_blocks_are_colored_and_stitched() {
        let program: Program = CALLER.parse().unwrap();
        let dot = dump_cfg_of_whole_program(&program);

        assert!(dot.contains("subgraph cluster_main"));
        assert!(dot.contains("subgraph cluster_callee"));
        // the direct call block links into the callee's entry
        assert!(dot.contains("main__entry -> callee__entry [style=dashed];"));
        assert!(dot.contains("main__entry [label=\"entry:\\l  p = $copy callee\\l  $call_dir callee() then mid\\l\" color=blue];"));
        assert!(dot.contains("color=red"));
        // intra-procedural fallthrough edges survive
        assert!(dot.contains("main__mid -> main__exit;"));
    }
}
