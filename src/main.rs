use std::path::PathBuf;

use clap::Parser;
use dynplan::{
    DimRange, EngineConfig, GraphError, Precision, define_region_graph, graph_to_dot,
    load_config_from_path, pipeline, save_graph_to_path,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Build or load a dynamic-batch region plan and run it once", long_about = None)]
struct Cli {
    /// JSON engine configuration; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Path the compiled plan is written to or read from.
    #[arg(long)]
    engine: Option<PathBuf>,
    /// Compile a fresh plan and persist it.
    #[arg(long, conflicts_with = "load")]
    build: bool,
    /// Load a previously persisted plan instead of compiling.
    #[arg(long)]
    load: bool,
    /// Run kernels in half precision.
    #[arg(long, conflicts_with = "fp32")]
    fp16: bool,
    /// Run kernels in full precision.
    #[arg(long)]
    fp32: bool,
    /// Batch size of the invocation.
    #[arg(long)]
    batch: Option<u32>,
    #[arg(long)]
    min_batch: Option<u32>,
    #[arg(long)]
    opt_batch: Option<u32>,
    #[arg(long)]
    max_batch: Option<u32>,
    /// Write a Graphviz DOT rendering of the graph.
    #[arg(long)]
    export_dot: Option<PathBuf>,
    /// Write the graph as JSON.
    #[arg(long)]
    dump_graph: Option<PathBuf>,
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig, GraphError> {
        let mut config = match &self.config {
            Some(path) => load_config_from_path(path)?,
            None => EngineConfig::default(),
        };
        if let Some(path) = &self.engine {
            config.engine_path = path.clone();
        }
        if self.build {
            config.build = true;
        }
        if self.load {
            config.build = false;
        }
        if self.fp16 {
            config.precision = Precision::Fp16;
        }
        if self.fp32 {
            config.precision = Precision::Fp32;
        }
        if let Some(batch) = self.batch {
            config.invocation_batch = batch;
        }
        config.batch = DimRange::new(
            self.min_batch.unwrap_or(config.batch.min),
            self.opt_batch.unwrap_or(config.batch.opt),
            self.max_batch.unwrap_or(config.batch.max),
        );
        Ok(config)
    }
}

fn run(cli: &Cli) -> Result<(), GraphError> {
    let config = cli.engine_config()?;

    if cli.export_dot.is_some() || cli.dump_graph.is_some() {
        let graph = define_region_graph(&config.region)?;
        if let Some(dot_path) = &cli.export_dot {
            std::fs::write(dot_path, graph_to_dot(&graph))
                .map_err(|err| GraphError::export(dot_path.clone(), err))?;
            info!(path = %dot_path.display(), "exported Graphviz DOT");
        }
        if let Some(json_path) = &cli.dump_graph {
            save_graph_to_path(&graph, json_path)?;
            info!(path = %json_path.display(), "wrote graph JSON");
        }
    }

    let plan = pipeline::obtain_plan(&config)?;
    let input = pipeline::uniform_input(&config, 0.5);
    let output = pipeline::run_once(&config, &plan, &input)?;

    println!("output shape: {:?}", output.shape);
    let preview: Vec<String> = output.data.iter().take(2).map(f32::to_string).collect();
    println!("first values: {}", preview.join(", "));
    Ok(())
}

fn main() {
    dynplan::debug::init_tracing();
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}
