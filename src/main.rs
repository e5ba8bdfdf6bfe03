//! Kokkos kernel compiler CLI
//!
//! Usage:
//!   kokkos-jit render kernel.py --view x=float64:1 --scalar n=int32
//!   kokkos-jit render kernel.py --policy team --reduce float64 --ast
//!   kokkos-jit shmem-size float32 16 4

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};

use clap::{Parser as ClapParser, Subcommand};
use colored::Colorize;

use kokkos_jit::{
    render_source, shmem_size_of, translate, ArgType, CombineOp, DataType, ExecutionSpace, Kernel, KernelResult,
    Layout, PolicyKind, Specialization, ViewType,
};

#[derive(ClapParser, Debug)]
#[command(name = "kokkos-jit")]
#[command(version = "0.1.0")]
#[command(about = "Translates hierarchical-parallel kernels to Kokkos C++")]
struct Cli {
    /// Verbose output (debug logging)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Translate a kernel file and print the generated source
    Render {
        /// Kernel source file; stdin when omitted
        #[arg(value_name = "FILE")]
        file: Option<String>,

        /// View argument, NAME=TYPE:RANK[:left]
        #[arg(long = "view", value_parser = parse_view)]
        views: Vec<(String, ViewType)>,

        /// Scalar argument, NAME=TYPE
        #[arg(long = "scalar", value_parser = parse_scalar)]
        scalars: Vec<(String, DataType)>,

        /// Policy: range, team, md2 or md3
        #[arg(short = 'p', long = "policy", default_value = "range", value_parser = parse_policy)]
        policy: PolicyKind,

        /// Execution space
        #[arg(short = 's', long = "space", default_value = "openmp", value_parser = parse_space)]
        space: ExecutionSpace,

        /// Reduce into an accumulator, TYPE[:sum|prod|min|max]
        #[arg(short = 'r', long = "reduce", value_parser = parse_reducer)]
        reduce: Option<(DataType, CombineOp)>,

        /// Print the translation unit as JSON instead of C++
        #[arg(long = "ast")]
        ast: bool,
    },

    /// Print the scratch bytes needed by a view of TYPE with EXTENTS
    ShmemSize {
        #[arg(value_name = "TYPE")]
        dtype: String,

        #[arg(value_name = "EXTENTS", required = true)]
        extents: Vec<usize>,
    },
}

fn parse_dtype(s: &str) -> Result<DataType, String> {
    DataType::element_from_name(s).ok_or_else(|| format!("Unknown element type: {}", s))
}

fn parse_view(s: &str) -> Result<(String, ViewType), String> {
    let (name, spec) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid view format: {}", s))?;
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(format!("Invalid view type: {}", spec));
    }
    let dtype = parse_dtype(parts[0])?;
    let rank = parts[1]
        .parse::<usize>()
        .map_err(|_| format!("Invalid rank: {}", parts[1]))?;
    let layout = match parts.get(2).copied() {
        None | Some("right") => Layout::LayoutRight,
        Some("left") => Layout::LayoutLeft,
        Some(other) => return Err(format!("Invalid layout: {}", other)),
    };
    Ok((
        name.to_string(),
        ViewType {
            dtype,
            rank,
            layout,
            space: kokkos_jit::default_space().memory_space(),
        },
    ))
}

fn parse_scalar(s: &str) -> Result<(String, DataType), String> {
    let (name, dtype) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid scalar format: {}", s))?;
    Ok((name.to_string(), parse_dtype(dtype)?))
}

fn parse_policy(s: &str) -> Result<PolicyKind, String> {
    match s {
        "range" => Ok(PolicyKind::Range),
        "team" => Ok(PolicyKind::Team),
        "md2" => Ok(PolicyKind::MdRange(2)),
        "md3" => Ok(PolicyKind::MdRange(3)),
        other => Err(format!("Invalid policy: {}", other)),
    }
}

fn parse_space(s: &str) -> Result<ExecutionSpace, String> {
    ExecutionSpace::from_tag(s).ok_or_else(|| format!("Unknown execution space: {}", s))
}

fn parse_reducer(s: &str) -> Result<(DataType, CombineOp), String> {
    let (dtype, op) = s.split_once(':').unwrap_or((s, "sum"));
    let op = match op {
        "sum" => CombineOp::Sum,
        "prod" => CombineOp::Prod,
        "min" => CombineOp::Min,
        "max" => CombineOp::Max,
        other => return Err(format!("Invalid combine op: {}", other)),
    };
    Ok((parse_dtype(dtype)?, op))
}

fn read_source(file: Option<String>) -> String {
    if let Some(file) = file {
        fs::read_to_string(&file).unwrap_or_else(|e| {
            eprintln!("{}: Failed to read file '{}': {}", "Error".red(), file, e);
            std::process::exit(1);
        })
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer).unwrap_or_else(|e| {
            eprintln!("{}: Failed to read stdin: {}", "Error".red(), e);
            std::process::exit(1);
        });
        buffer
    }
}

fn render(source: &str, spec: &Specialization, ast: bool) -> KernelResult<String> {
    let kernel = Kernel::new(source)?;
    if ast {
        let unit = translate(&kernel, spec)?;
        Ok(serde_json::to_string_pretty(&unit)?)
    } else {
        render_source(&kernel, spec)
    }
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Command::Render {
            file,
            views,
            scalars,
            policy,
            space,
            reduce,
            ast,
        } => {
            let source = read_source(file);
            let mut args = BTreeMap::new();
            for (name, view) in views {
                args.insert(name, ArgType::View(view));
            }
            for (name, dtype) in scalars {
                args.insert(name, ArgType::Scalar(dtype));
            }
            let spec = Specialization {
                args,
                accumulator: reduce,
                policy,
                space,
            };

            if cli.verbose {
                eprintln!("{}", "Kokkos kernel compiler".bold().blue());
                eprintln!("{}: {:?} on {}", "Policy".green(), policy, space);
                eprintln!();
            }

            match render(&source, &spec, ast) {
                Ok(output) => println!("{}", output),
                Err(e) => {
                    let label = format!("{:?} error", e.kind());
                    eprintln!("{}: {}", label.red(), e);
                    std::process::exit(1);
                }
            }
        }
        Command::ShmemSize { dtype, extents } => match shmem_size_of(&dtype, &extents) {
            Ok(bytes) => {
                println!("{}: {} bytes", format!("{}{:?}", dtype, extents).cyan(), bytes);
            }
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        },
    }
}
