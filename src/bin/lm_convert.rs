//! Converts N-gram language models between ARPA text and the packed binary form. The input
//! format is sniffed from the file contents, the output format picked by flag.
use clap::Parser;
use harken::arpa;
use harken::lm::Direction;
use harken::ngram::NGram;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
pub struct Args {
    /// Source model, ARPA text or binary (auto-detected)
    input: PathBuf,
    /// Destination path
    output: PathBuf,
    /// Write the packed binary form instead of ARPA text
    #[clap(long)]
    binary: bool,
    /// Mark an ARPA input as a reverse (right-to-left) model
    #[clap(long)]
    reverse: bool,
}

fn convert(args: &Args) -> anyhow::Result<()> {
    let mut head = [0u8; 8];
    let n = File::open(&args.input)?.read(&mut head)?;
    let is_binary = n == 8 && &head == b"HRKNGRM1";

    let ngram = if is_binary {
        NGram::read_binary(BufReader::new(File::open(&args.input)?))?
    } else {
        let dir = if args.reverse {
            Direction::Reverse
        } else {
            Direction::Forward
        };
        arpa::read_arpa(&args.input, dir)?
    };
    info!(
        "read {}-gram with {} entries from {}",
        ngram.order(),
        ngram.vocab_len(),
        args.input.display()
    );

    if args.binary {
        let out = BufWriter::new(File::create(&args.output)?);
        ngram.write_binary(out)?;
    } else {
        arpa::write_arpa(&ngram, &args.output)?;
    }
    info!("wrote {}", args.output.display());
    Ok(())
}

fn main() {
    harken::setup_logging();
    let args = Args::parse();
    if let Err(e) = convert(&args) {
        error!("conversion failed: {:#}", e);
        std::process::exit(1);
    }
}
