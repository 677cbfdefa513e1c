use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

/// Decompile LuaJIT bytecode dumps back to Lua source.
#[derive(Parser)]
#[command(name = "relume", version, about)]
struct Args {
    /// Bytecode dump files (`luajit -b` output).
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Write output here instead of stdout (single input only).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// List the functions of each dump instead of decompiling.
    #[arg(long)]
    list_functions: bool,
}

fn main() {
    let args = Args::parse();
    let mut failed = false;
    for input in &args.inputs {
        if let Err(error) = process(input, &args) {
            eprintln!("relume: {}: {error:#}", input.display());
            failed = true;
        }
    }
    if failed {
        std::process::exit(1);
    }
}

fn process(input: &PathBuf, args: &Args) -> Result<()> {
    let bytes = fs::read(input).context("reading dump")?;
    let module = relume_bytecode::module::read_module(&bytes)
        .map_err(anyhow::Error::msg)
        .context("parsing dump")?;

    if args.list_functions {
        for (index, proto) in module.prototypes.iter().enumerate() {
            let marker = if index == module.main { " (main)" } else { "" };
            println!(
                "fn #{index}{marker}: {} params, {} instructions, {} upvalues",
                proto.header.parameters,
                proto.instructions.len(),
                proto.upvalues.len()
            );
        }
        return Ok(());
    }

    let chunk = relume_lift::lift_module(&module).context("lifting")?;
    let source = relume_emit::emit_chunk(&chunk, &module);

    match &args.output {
        Some(path) => fs::write(path, source).context("writing output")?,
        None => print!("{source}"),
    }
    Ok(())
}
