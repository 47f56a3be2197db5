use anyhow::Context;
use clap::Parser;
use rangeprop::{AnalysisConfig, Graph, InputRange, ReferenceEvaluator, ReportMode, range_analysis};
use std::path::PathBuf;

/// Interval range analysis of a tensor graph.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Graph description (JSON)
    graph: PathBuf,

    /// Analysis config (JSON); flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Range of every graph input, `[min, max]` or `[[min..], [max..]]`
    #[arg(long)]
    input_range: Option<String>,

    /// Only report tensors whose name contains this text
    #[arg(long)]
    key_filter: Option<String>,

    /// One of range, stuck_channel, zerostuck_channel
    #[arg(long)]
    report_mode: Option<String>,

    /// Keep constants in the range report
    #[arg(long)]
    keep_initializers: bool,

    /// Reconstruct scaled-integer ranges after the real-valued pass
    #[arg(long)]
    scaled_int: bool,

    /// Fold constants and infer shapes and datatypes first
    #[arg(long)]
    normalize: bool,

    #[arg(long)]
    channel_axis: Option<usize>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(PathBuf, AnalysisConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => AnalysisConfig::from_json_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => AnalysisConfig::default(),
        };
        if let Some(text) = &self.input_range {
            config.input_range = text.parse::<InputRange>()?;
        }
        if let Some(filter) = self.key_filter {
            config.key_filter = filter;
        }
        if let Some(mode) = &self.report_mode {
            config.report_mode = ReportMode::parse(mode)?;
        }
        if self.keep_initializers {
            config.strip_initializers = false;
        }
        config.scaled_int |= self.scaled_int;
        config.normalize |= self.normalize;
        if let Some(axis) = self.channel_axis {
            config.channel_axis = axis;
        }
        Ok((self.graph, config, self.json))
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let (graph_path, config, json) = args.into_config()?;
    let graph =
        Graph::from_json_file(&graph_path).with_context(|| format!("loading graph {}", graph_path.display()))?;
    let report = range_analysis(&graph, &ReferenceEvaluator, &config).context("range analysis failed")?;

    if json {
        println!("{}", report.to_json(true)?);
    } else {
        print!("{}", report);
    }
    Ok(())
}
