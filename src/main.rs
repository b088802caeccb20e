mod cli;

use std::process::ExitCode;

use clap::Parser;
use itertools::Itertools;
use rand::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use lsystem::{compile, CompileOptions, FileSet, StepOptions};

fn split_assignment(text: &str) -> Result<(&str, &str), String> {
    text.split_once('=')
        .map(|(name, value)| (name.trim(), value.trim()))
        .ok_or_else(|| format!("Expected NAME=VALUE, got `{}`", text))
}

fn run(cli: &Cli) -> Result<(), String> {
    let origin = cli.file.to_string_lossy().into_owned();
    let files = FileSet::load(&cli.file).map_err(|errors| errors.iter().join("\n"))?;

    let mut options = CompileOptions {
        step: StepOptions {
            parallel: !cli.sequential,
            ..StepOptions::default()
        },
        ..CompileOptions::default()
    };
    for define in &cli.defines {
        let (name, value) = split_assignment(define)?;
        options = options.with_override(name, value);
    }
    let grammar = compile(&files, &origin, &options).map_err(|error| error.to_string())?;

    let mut globals = grammar.default_globals();
    for assignment in &cli.globals {
        let (name, value) = split_assignment(assignment)?;
        let slot = grammar
            .global_parameters()
            .iter()
            .position(|global| global.name == name)
            .ok_or_else(|| format!("No runtime parameter named `{}`", name))?;
        globals[slot] = value.parse().map_err(|_| format!("`{}` is not a number", value))?;
    }

    let iterations = cli.iterations.unwrap_or(grammar.iterations());
    let seed = cli.seed.unwrap_or_else(|| thread_rng().gen());
    info!("stepping {} {} times with seed {}", origin, iterations, seed);

    let mut state = grammar.initial_state(seed);
    if cli.each {
        println!("{}", grammar.render(&state.symbols));
    }
    for _ in 0..iterations {
        state = grammar.step(&state, &globals, true).map_err(|error| error.to_string())?;
        if cli.each {
            println!("{}", grammar.render(&state.symbols));
        }
    }
    if !cli.each {
        println!("{}", grammar.render(&state.symbols));
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lsystem=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{}", message);
            ExitCode::FAILURE
        }
    }
}
