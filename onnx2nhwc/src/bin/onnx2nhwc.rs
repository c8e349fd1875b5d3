//! Command-line front end.
//!
//! Usage:
//!   onnx2nhwc translate graph.json -o model.json
//!   onnx2nhwc summary graph.json

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use onnx2nhwc::ir::OnnxGraph;
use onnx2nhwc::{translate, Result, TargetModel, TranslateConfig};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(|s| s.as_str()) {
        Some("translate") => cmd_translate(&args[1..]),
        Some("summary") => cmd_summary(&args[1..]),
        Some("--help") | Some("-h") | None => print_usage(),
        Some(other) => {
            eprintln!("error: unknown subcommand '{other}'");
            eprintln!();
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    eprintln!("onnx2nhwc - channel-first to channel-last graph translator");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  onnx2nhwc translate <graph.json> [-c <config.json>] [-o <out.json>] [--strict]");
    eprintln!("  onnx2nhwc summary <graph.json> [-c <config.json>]");
    eprintln!();
    eprintln!("Subcommands:");
    eprintln!("  translate  Lower a JSON source graph and write the target model as JSON");
    eprintln!("  summary    Print the lowered op list");
}

struct Options {
    graph: PathBuf,
    config: Option<PathBuf>,
    out: Option<PathBuf>,
    strict: bool,
}

fn parse_options(args: &[String], usage: &str) -> Options {
    let mut graph = None;
    let mut config = None;
    let mut out = None;
    let mut strict = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                i += 1;
                config = Some(PathBuf::from(args.get(i).unwrap_or_else(|| {
                    eprintln!("--config requires a file path");
                    process::exit(1);
                })));
            }
            "-o" | "--out" => {
                i += 1;
                out = Some(PathBuf::from(args.get(i).unwrap_or_else(|| {
                    eprintln!("--out requires a file path");
                    process::exit(1);
                })));
            }
            "--strict" => strict = true,
            "--help" | "-h" => {
                eprintln!("Usage: {usage}");
                process::exit(0);
            }
            _ => {
                if graph.is_none() {
                    graph = Some(PathBuf::from(&args[i]));
                } else {
                    eprintln!("Unexpected argument: {}", args[i]);
                    eprintln!("Usage: {usage}");
                    process::exit(1);
                }
            }
        }
        i += 1;
    }

    let graph = graph.unwrap_or_else(|| {
        eprintln!("Usage: {usage}");
        process::exit(1);
    });
    Options {
        graph,
        config,
        out,
        strict,
    }
}

fn load(options: &Options) -> Result<(OnnxGraph, TranslateConfig)> {
    let graph: OnnxGraph = serde_json::from_slice(&fs::read(&options.graph)?)?;
    let mut config = match &options.config {
        Some(path) => serde_json::from_slice(&fs::read(path)?)?,
        None => TranslateConfig::default(),
    };
    if let Some(opset) = graph.opset_version {
        log::debug!("using opset {opset} from the source graph");
        config = config.with_opset(opset);
    }
    Ok((graph, config))
}

fn run(options: &Options) -> Result<TargetModel> {
    let (graph, config) = load(options)?;
    translate(&graph, &config)
}

fn write_model(model: &TargetModel, path: &Path) -> Result<()> {
    fs::write(path, serde_json::to_vec_pretty(model)?)?;
    Ok(())
}

fn cmd_translate(args: &[String]) {
    let usage = "onnx2nhwc translate <graph.json> [-c <config.json>] [-o <out.json>] [--strict]";
    let options = parse_options(args, usage);
    let model = run(&options).unwrap_or_else(|err| {
        eprintln!("Error: {err}");
        process::exit(1);
    });

    for diagnostic in &model.diagnostics {
        eprintln!("warning: {diagnostic}");
    }

    match &options.out {
        Some(path) => {
            if let Err(err) = write_model(&model, path) {
                eprintln!("Error writing {}: {err}", path.display());
                process::exit(1);
            }
            eprintln!(
                "Wrote {} ({} ops, {} diagnostics)",
                path.display(),
                model.graph.ops.len(),
                model.diagnostics.len()
            );
        }
        None => match serde_json::to_string_pretty(&model) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("Error: {err}");
                process::exit(1);
            }
        },
    }

    if options.strict && !model.diagnostics.is_empty() {
        eprintln!(
            "error: {} optimization gap(s) reported in strict mode",
            model.diagnostics.len()
        );
        process::exit(2);
    }
}

fn cmd_summary(args: &[String]) {
    let usage = "onnx2nhwc summary <graph.json> [-c <config.json>]";
    let options = parse_options(args, usage);
    let model = run(&options).unwrap_or_else(|err| {
        eprintln!("Error: {err}");
        process::exit(1);
    });
    print!("{}", model.graph.summary());
    for diagnostic in &model.diagnostics {
        eprintln!("warning: {diagnostic}");
    }
}
