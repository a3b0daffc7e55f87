// Whole-program call-graph construction over LIR modules.

use clap::Parser;
use std::path::Path;
use std::process::exit;

use icfg::commons::Soundness;
use icfg::middle_end::analysis::callgraph::{CallGraphAnalysisType, Icfg};
use icfg::middle_end::analysis::points_to::PointerAnalysisType;
use icfg::middle_end::irdb::IrDb;
use icfg::middle_end::lir::dump_cfg_of_whole_program;

// Command-line arguments
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Paths to the LIR modules under analysis
    #[arg(short = 'm', long = "module", required = true, num_args = 1..)]
    modules: Vec<String>,

    /// Entry points; use '__ALL__' to treat every function definition as an
    /// entry point
    #[arg(short = 'E', long = "entry-points", default_value = "main")]
    entry_points: Vec<String>,

    /// The call-graph algorithm to be used
    #[arg(short = 'C', long = "call-graph-analysis", default_value = "otf")]
    call_graph_analysis: CallGraphAnalysisType,

    /// The points-to analysis to be used by otf; cflsteens is fast but
    /// coarse, cflanders is slower but more accurate
    #[arg(short = 'P', long = "pointer-analysis", default_value = "cflanders")]
    pointer_analysis: PointerAnalysisType,

    /// The soundness level to be used
    #[arg(long, default_value = "soundy")]
    soundness: Soundness,

    /// Model global initializers with a synthetic constructor function
    /// (single-module analyses only)
    #[arg(long)]
    include_globals: bool,

    /// Output directory; if specified all results are written there instead
    /// of stdout
    #[arg(short = 'O', long = "out")]
    out: Option<String>,

    /// Emit the call graph as a DOT graph
    #[arg(long)]
    emit_cg_as_dot: bool,

    /// Emit the call graph as JSON
    #[arg(long)]
    emit_cg_as_json: bool,

    /// Emit the call graph as text
    #[arg(long)]
    emit_cg_as_text: bool,

    /// Emit the points-to information as JSON
    #[arg(long)]
    emit_pta_as_json: bool,

    /// Emit the per-function control-flow graphs as a DOT graph
    #[arg(long)]
    emit_cfg_as_dot: bool,

    /// Collect and emit statistics of the module(s) under analysis
    #[arg(short = 'S', long)]
    statistics: bool,

    /// Suppress any non-result output
    #[arg(short = 's', long)]
    silent: bool,

    /// Enable debug logging
    #[arg(short = 'L', long)]
    log: bool,
}

fn validate_param_module(modules: &[String]) {
    for module in modules {
        let path = Path::new(module);
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("lir") {
            eprintln!("LIR module '{module}' does not exist!");
            exit(1);
        }
    }
}

fn validate_param_output(out: &Option<String>) {
    if let Some(dir) = out {
        if !Path::new(dir).is_dir() {
            eprintln!("'{dir}' does not exist, a valid output directory is required!");
            exit(1);
        }
    }
}

fn validate_param_pointer_analysis(ty: PointerAnalysisType) {
    if ty == PointerAnalysisType::Invalid {
        eprintln!("'invalid' is not a valid pointer analysis!");
        exit(1);
    }
}

fn validate_param_call_graph_analysis(ty: CallGraphAnalysisType) {
    if ty == CallGraphAnalysisType::Invalid {
        eprintln!("'invalid' is not a valid call-graph analysis!");
        exit(1);
    }
}

fn validate_soundness_flag(soundness: Soundness) {
    if soundness == Soundness::Invalid {
        eprintln!("'invalid' is not a valid soundness level!");
        exit(1);
    }
}

pub fn main() {
    let args = Args::parse();

    let level = if args.log {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    if !args.silent {
        println!(
            "icfg {}\nA LIR-based call-graph construction tool\n",
            env!("CARGO_PKG_VERSION")
        );
    }

    validate_param_module(&args.modules);
    validate_param_output(&args.out);
    validate_param_pointer_analysis(args.pointer_analysis);
    validate_param_call_graph_analysis(args.call_graph_analysis);
    validate_soundness_flag(args.soundness);

    let mut irdb = match IrDb::from_files(&args.modules) {
        Ok(irdb) => irdb,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };

    if args.statistics && !args.silent {
        println!("> Modules:\t\t{}", irdb.num_modules());
        println!("> Functions:\t\t{}", irdb.get_all_functions().len());
        println!("> LIR instructions:\t{}", irdb.num_instructions());
        println!("> Call sites:\t\t{}", irdb.num_call_sites());
        println!();
    }

    let icfg = match Icfg::new(
        &mut irdb,
        args.call_graph_analysis,
        &args.entry_points,
        None,
        None,
        args.pointer_analysis,
        args.soundness,
        args.include_globals,
    ) {
        Ok(icfg) => icfg,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };

    let emit = |name: &str, content: String| match &args.out {
        Some(dir) => {
            let path = Path::new(dir).join(name);
            std::fs::write(&path, content).unwrap_or_else(|_| {
                panic!("Failed to write results to {}", path.display())
            });
        }
        None => print!("{content}"),
    };

    let any_emit = args.emit_cg_as_dot
        || args.emit_cg_as_json
        || args.emit_cg_as_text
        || args.emit_pta_as_json
        || args.emit_cfg_as_dot;

    if args.emit_cg_as_text || !any_emit {
        emit("call-graph.txt", icfg.as_text());
    }
    if args.emit_cg_as_dot {
        emit("call-graph.dot", icfg.as_dot());
    }
    if args.emit_cg_as_json {
        let json = serde_json::to_string_pretty(&icfg.as_json()).unwrap();
        emit("call-graph.json", json);
    }
    if args.emit_pta_as_json {
        if let Some(pt) = icfg.points_to_info() {
            let json = serde_json::to_string_pretty(&pt.borrow_mut().as_json()).unwrap();
            emit("points-to.json", json);
        } else {
            eprintln!("no points-to information was computed; use -C otf");
        }
    }
    if args.emit_cfg_as_dot {
        let mut dot = String::new();
        for module in icfg.irdb().modules() {
            dot.push_str(&dump_cfg_of_whole_program(&module.program.0));
            dot.push('\n');
        }
        emit("cfg.dot", dot);
    }
}
