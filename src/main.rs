use clap::Parser;
use std::fs::File;
use std::io::{self, BufWriter};
use twolevel::loader::{
    AnalysisMode, NullOutput, OutputSink, StaticAnalysis, TimeIntInfo, TIME_INT_DC_OP,
};
use twolevel::model::{ProblemConfig, TwoLevelModel};
use twolevel::options;
use twolevel::output::{self, CsvHomotopyWriter};
use twolevel::twolevel::{AlgorithmVariant, SolverConfig, TwoLevelNewton};

/// Two-level Newton solver for a circuit coupled to 1-D devices
#[derive(Parser)]
#[command(name = "twolevel", version)]
struct Cli {
    /// Problem description (TOML)
    problem: String,

    /// SPICE-style `.options` file
    #[arg(long)]
    options: Option<String>,

    /// Override the two-level algorithm number
    #[arg(long)]
    algorithm: Option<i64>,

    /// Solve twice, the first pass as a plain full-problem solve
    #[arg(long)]
    double_dcop: bool,

    /// Use the transient algorithm and solver settings
    #[arg(long)]
    transient: bool,

    /// Print solver stats to stderr
    #[arg(long)]
    stats: bool,

    /// Write homotopy progress to this CSV file
    #[arg(long)]
    homotopy_csv: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let input = std::fs::read_to_string(&cli.problem).unwrap_or_else(|e| {
        eprintln!("Error reading {}: {}", cli.problem, e);
        std::process::exit(1);
    });

    let problem = ProblemConfig::from_toml(&input).unwrap_or_else(|e| {
        eprintln!("Problem error: {}", e);
        std::process::exit(1);
    });

    let blocks = match &cli.options {
        Some(path) => {
            let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
                eprintln!("Error reading {}: {}", path, e);
                std::process::exit(1);
            });
            options::parse(&text).unwrap_or_else(|e| {
                eprintln!("Options error: {}", e);
                std::process::exit(1);
            })
        }
        None => Vec::new(),
    };

    let mut config = SolverConfig::from_blocks(&blocks).unwrap_or_else(|e| {
        eprintln!("Options error: {}", e);
        std::process::exit(1);
    });
    if let Some(n) = cli.algorithm {
        if cli.transient {
            config.two_level.tran_algorithm = AlgorithmVariant::resolve_transient(n);
        } else {
            config.two_level.algorithm = AlgorithmVariant::resolve(n);
        }
    }

    let model = TwoLevelModel::new(&problem).unwrap_or_else(|e| {
        eprintln!("Model error: {}", e);
        std::process::exit(1);
    });
    let names = model.unknown_names();
    let system = model.new_system();

    let sink: Box<dyn OutputSink> = match &cli.homotopy_csv {
        Some(path) => {
            let file = File::create(path).unwrap_or_else(|e| {
                eprintln!("Error creating {}: {}", path, e);
                std::process::exit(1);
            });
            Box::new(CsvHomotopyWriter::new(BufWriter::new(file), names.clone()))
        }
        None => Box::new(NullOutput),
    };

    let analysis = StaticAnalysis {
        info: TimeIntInfo {
            double_dcop_enabled: cli.double_dcop,
            time_int_mode: TIME_INT_DC_OP,
            double_dcop_step: 0,
        },
    };

    let mut solver = TwoLevelNewton::new(config, model, analysis, sink, system).unwrap_or_else(|e| {
        eprintln!("Solver setup error: {}", e);
        std::process::exit(1);
    });
    solver.initialize_all().unwrap_or_else(|e| {
        eprintln!("Solver setup error: {}", e);
        std::process::exit(1);
    });
    if cli.transient {
        solver.set_analysis_mode(AnalysisMode::Transient);
    }

    let passes = if cli.double_dcop { 2 } else { 1 };
    let mut status = None;
    for pass in 0..passes {
        solver.analysis_mut().info.double_dcop_step = pass;
        let s = solver.solve().unwrap_or_else(|e| {
            eprintln!("Fatal: {}", e);
            std::process::exit(1);
        });
        if cli.stats {
            solver.statistics().display(&format!("Two-level solve, pass {}", pass + 1));
        }
        status = Some(s);
    }

    let mut stdout = io::stdout();
    output::write_solution_csv(&names, solver.system().solution(), &mut stdout).unwrap_or_else(|e| {
        eprintln!("Output error: {}", e);
        std::process::exit(1);
    });
    // Flushes the homotopy CSV before any early exit below.
    drop(solver);

    match status {
        Some(s) if s.converged() => {}
        Some(s) => {
            eprintln!("Two-level Newton failed to converge (status {})", s);
            std::process::exit(2);
        }
        None => std::process::exit(2),
    }
}
