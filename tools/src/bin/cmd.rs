// Command line utility for running the scan-pipeline analysis

use anyhow::{Context, Error};
use clap::{value_parser, Arg, ArgMatches, Command};
use log::info;
use scan_pipeline::classify::Reference;
use scan_pipeline::report::write_reports;
use scan_pipeline::simulate::Simulated;
use scan_pipeline::source::{write_mtx_dir, AnnotationSource, DatasetSource, MtxSource, TsvAnnotation};
use scan_pipeline::{run, PipelineConfig, Threads};
use std::path::PathBuf;

fn out_dir_arg() -> Arg {
    Arg::new("OUT_DIR")
        .help("Output directory")
        .short('o')
        .long("out_dir")
        .default_value(".")
        .value_parser(value_parser!(PathBuf))
}

fn seed_arg() -> Arg {
    Arg::new("SEED")
        .help("Seed for every randomized step")
        .long("seed")
        .value_parser(value_parser!(u64))
}

pub fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = Command::new("scan-pipeline-cmd")
        .about("Single-cell RNA-seq analysis: QC, normalization, integration, clustering, markers")
        .subcommand_required(true)
        .subcommand(
            Command::new("run")
                .about("Analyze an MTX directory and write diagnostic tables")
                .arg(
                    Arg::new("INPUT")
                        .help("directory with matrix.mtx, genes.tsv and cells.tsv or barcodes.tsv")
                        .required(true)
                        .index(1)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(out_dir_arg())
                .arg(
                    Arg::new("CONFIG")
                        .help("JSON pipeline settings; unset values keep their defaults")
                        .short('c')
                        .long("config")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("THREADS")
                        .help("Worker threads for every stage, 0 for all cores")
                        .short('t')
                        .long("threads")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("ANNOTATION")
                        .help("TSV of gene_id, symbol and chromosome")
                        .long("annotation")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("REFERENCE")
                        .help("TSV of labelled reference profiles for cell-type annotation")
                        .long("reference")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(seed_arg()),
        )
        .subcommand(
            Command::new("simulate")
                .about("Write a synthetic two-batch dataset as an MTX directory, plus matching reference profiles")
                .arg(out_dir_arg())
                .arg(
                    Arg::new("NUM_CELLS")
                        .help("Number of cells")
                        .short('n')
                        .long("num_cells")
                        .default_value("100")
                        .value_parser(value_parser!(usize)),
                )
                .arg(seed_arg()),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("run", m)) => run_analysis(m),
        Some(("simulate", m)) => simulate(m),
        _ => unreachable!("clap requires a subcommand"),
    }
}

fn run_analysis(m: &ArgMatches) -> Result<(), Error> {
    let input: &PathBuf = m.get_one("INPUT").context("missing INPUT")?;
    let out_dir: &PathBuf = m.get_one("OUT_DIR").context("missing OUT_DIR")?;

    let mut cfg = match m.get_one::<PathBuf>("CONFIG") {
        Some(path) => PipelineConfig::from_json_path(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(&n) = m.get_one::<usize>("THREADS") {
        cfg.threads = Threads::uniform(n);
    }
    if let Some(&seed) = m.get_one::<u64>("SEED") {
        cfg = cfg.with_seed(seed);
    }

    let annotation = m
        .get_one::<PathBuf>("ANNOTATION")
        .map(TsvAnnotation::from_path)
        .transpose()?;
    let reference = m.get_one::<PathBuf>("REFERENCE").map(Reference::from_path).transpose()?;

    let ds = MtxSource::new(input).load("")?;
    let annotation = annotation.as_ref().map(|a| a as &dyn AnnotationSource);
    let analysis = run(ds, &cfg, annotation, reference.as_ref())?;
    let files = write_reports(out_dir, &analysis)?;
    for f in files {
        println!("{}", f.display());
    }
    Ok(())
}

fn simulate(m: &ArgMatches) -> Result<(), Error> {
    let out_dir: &PathBuf = m.get_one("OUT_DIR").context("missing OUT_DIR")?;
    let sim = Simulated {
        n_cells: *m.get_one("NUM_CELLS").context("missing NUM_CELLS")?,
        seed: m.get_one::<u64>("SEED").copied().unwrap_or(0),
        ..Simulated::default()
    };
    let ds = sim.simulate("simulated")?;
    write_mtx_dir(out_dir, &ds)?;
    sim.reference(3)?.write_path(out_dir.join("reference.tsv"))?;
    info!("simulated {} cells of {} types in {} batches", sim.n_cells, sim.n_types, sim.n_batches);
    Ok(())
}
