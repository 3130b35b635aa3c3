//! blockalign: write a stream into a block-aligned container so that
//! subsequent runs keep unchanged blocks at the same positions.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, Write};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod decode;
mod encode;
mod hashdb;

use encode::AlignEncoder;
use hashdb::HashDb;

#[derive(Parser)]
#[command(name = "blockalign")]
#[command(version = "1.0")]
#[command(about = "Aligns content-defined blocks so repeated runs keep them at stable offsets")]
struct Cli {
    /// Restore a container to its original layout
    #[arg(short = 'r', long = "restore")]
    restore: bool,

    /// File to read, or "-" for stdin
    input: String,

    /// File to write, or "-" for stdout
    output: String,

    /// Block hashes of the previous run; rewritten for the next run.
    /// Not needed with --restore.
    hash_file: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("blockalign: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if cli.restore {
        return run_restore(&cli.input, &cli.output);
    }

    let name = cli
        .hash_file
        .clone()
        .context("hash file not given as argument")?;

    let mut input = open_input(&cli.input)?;
    let mut output = open_output(&cli.output)?;

    let next_name = format!("{}.new", name);
    let hash_out = BufWriter::new(
        File::create(&next_name)
            .with_context(|| format!("cannot create hash file \"{}\"", next_name))?,
    );

    let encoder = AlignEncoder::new(&mut output, hash_out, HashDb::open(&name));
    let stats = encoder.run(&mut input)?;
    output.flush()?;
    drop(output);

    fs::rename(&next_name, &name)
        .with_context(|| format!("renaming \"{}\" to \"{}\"", next_name, name))?;

    info!(
        blocks = stats.blocks,
        avg_block_size = format!("{:.1}", stats.avg_block_size()),
        hashes_found_pct = format!("{:.1}", stats.found_ratio() * 100.0),
        "aligned"
    );
    Ok(())
}

fn run_restore(input: &str, output: &str) -> anyhow::Result<()> {
    // the decoder needs random access for the tail block-map, so a piped
    // input is buffered first
    let mut source: Box<dyn ReadSeek> = if input == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .lock()
            .read_to_end(&mut buf)
            .context("reading stdin")?;
        Box::new(Cursor::new(buf))
    } else {
        Box::new(
            File::open(input).with_context(|| format!("cannot open input \"{}\"", input))?,
        )
    };

    let mut out = open_output(output)?;
    decode::restore(&mut source, &mut out)?;
    out.flush()?;
    Ok(())
}

trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

fn open_input(path: &str) -> anyhow::Result<Box<dyn Read>> {
    if path == "-" {
        Ok(Box::new(std::io::stdin().lock()))
    } else {
        let f = File::open(path).with_context(|| format!("cannot open input \"{}\"", path))?;
        Ok(Box::new(BufReader::new(f)))
    }
}

fn open_output(path: &str) -> anyhow::Result<Box<dyn Write>> {
    if path == "-" {
        Ok(Box::new(std::io::stdout().lock()))
    } else {
        let f = File::create(path).with_context(|| format!("cannot open output \"{}\"", path))?;
        Ok(Box::new(BufWriter::new(f)))
    }
}
