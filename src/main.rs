use clap::Parser;
use gmlc::bytecode::compile::Compiler;
use gmlc::bytecode::disasm::disassemble;
use gmlc::bytecode::sinks::DebugSymbols;
use gmlc::config::GenerateConfig;
use gmlc::lang::ast::Project;
use gmlc::runtime::vm_bc::{RtValue, VmBc};
use log::info;
use std::path::PathBuf;
use std::{fs, process};

#[derive(Parser, Debug)]
#[command(version, about = "Compile a GML project to stack bytecode", long_about = None)]
struct Args {
    /// Project file: functions and assets as a JSON decorated AST.
    project: PathBuf,

    /// Code generation settings (JSON).
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    no_peephole: bool,

    #[arg(long)]
    debug_symbols: bool,

    /// Worker threads.
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Print the disassembly.
    #[arg(long)]
    disasm: bool,

    /// Write postcard bytecode to this file.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Run a function in the reference executor and print its output.
    #[arg(long, value_name = "FUNCTION")]
    run: Option<String>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = compile(&args) {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn compile(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => GenerateConfig::load(path)?,
        None => GenerateConfig::default(),
    };
    if args.no_peephole {
        config.peephole = false;
    }
    if args.debug_symbols {
        config.debug_symbols = true;
    }
    if let Some(jobs) = args.jobs {
        config.jobs = jobs;
    }

    let text = fs::read_to_string(&args.project)
        .map_err(|e| format!("failed to read '{}': {}", args.project.display(), e))?;
    let project: Project = serde_json::from_str(&text)
        .map_err(|e| format!("invalid project '{}': {}", args.project.display(), e))?;

    let mut compiler = Compiler::new(config);
    let symbols = DebugSymbols::new();
    if args.debug_symbols {
        compiler.set_debug_sink(Box::new(symbols.clone()));
    }

    let program = compiler.compile_project(&project)?;
    info!(
        "compiled {} function(s), {} instance and {} global variable(s)",
        program.functions.len(),
        program.instance_names.len(),
        program.global_names.len()
    );

    if args.debug_symbols {
        for (function, address, span) in symbols.anchors() {
            println!("{}:{:04} line {} col {}", function, address, span.line, span.col);
        }
    }

    if args.disasm {
        print!("{}", disassemble(&program));
    }

    if let Some(path) = &args.output {
        fs::write(path, program.to_bytes()?)
            .map_err(|e| format!("failed to write '{}': {}", path.display(), e))?;
        info!("wrote {}", path.display());
    }

    if let Some(function) = &args.run {
        let mut vm = VmBc::new();
        let result = vm.run(&program, function, Vec::new());
        for line in vm.output() {
            println!("{}", line);
        }
        match result? {
            RtValue::Undefined => {}
            value => println!("=> {}", value),
        }
    }

    Ok(())
}
