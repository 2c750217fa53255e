use clap::Parser;
use harken::config::DecoderConfig;
use harken::engine::{Engine, LmPaths, ModelPaths, RecognitionStatus};
use harken::features::FeatureSet;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
pub struct Args {
    /// HTK feature files to recognise, one utterance each
    inputs: Vec<PathBuf>,
    /// Decoder configuration JSON; defaults apply when omitted
    #[clap(long)]
    config: Option<PathBuf>,
    /// Acoustic model definition (HTK hmmdefs text or binary dump)
    #[clap(long)]
    hmmdefs: PathBuf,
    /// Logical-to-physical HMM mapping for triphone models
    #[clap(long)]
    hmmlist: Option<PathBuf>,
    /// Pronunciation dictionary
    #[clap(long)]
    dict: PathBuf,
    /// ARPA N-gram language model
    #[clap(long, group = "lm")]
    arpa: Option<PathBuf>,
    /// The ARPA model is a reverse (right-to-left) N-gram
    #[clap(long, requires = "arpa")]
    reverse: bool,
    /// Binary N-gram language model
    #[clap(long, group = "lm")]
    binary_lm: Option<PathBuf>,
    /// DFA grammar (with a category-column dictionary)
    #[clap(long, group = "lm")]
    dfa: Option<PathBuf>,
    /// Hybrid DNN model for state scoring
    #[clap(long)]
    dnn: Option<PathBuf>,
    /// How many hypotheses to print per utterance
    #[clap(long, short, default_value_t = 1)]
    nbest: usize,
}

fn build_engine(args: &Args) -> anyhow::Result<Engine> {
    let mut config = match &args.config {
        Some(path) => DecoderConfig::from_file(path)?,
        None => DecoderConfig::default(),
    };
    config.nbest = config.nbest.max(args.nbest);
    let lm = if let Some(path) = &args.arpa {
        LmPaths::Arpa {
            path: path.clone(),
            reverse: args.reverse,
        }
    } else if let Some(path) = &args.binary_lm {
        LmPaths::BinaryNgram(path.clone())
    } else if let Some(path) = &args.dfa {
        LmPaths::Dfa(path.clone())
    } else {
        anyhow::bail!("one of --arpa, --binary-lm or --dfa is required");
    };
    let engine = Engine::load(
        config,
        &ModelPaths {
            hmmdefs: args.hmmdefs.clone(),
            hmmlist: args.hmmlist.clone(),
            dict: args.dict.clone(),
            lm,
            dnn: args.dnn.clone(),
        },
    )?;
    Ok(engine)
}

fn recognise_all(mut engine: Engine, args: &Args) -> anyhow::Result<()> {
    for input in &args.inputs {
        info!("recognising {}", input.display());
        let features = FeatureSet::open_htk(input)?;
        engine.open_features(features);
        let result = engine.recognize_one_utterance()?;
        match result.status {
            RecognitionStatus::Success => {}
            RecognitionStatus::NoResult => {
                println!("{}: <no result>", input.display());
                continue;
            }
            RecognitionStatus::Terminated => {
                println!("{}: <terminated>", input.display());
                continue;
            }
        }
        for sentence in &result.sentences {
            let text: Vec<&str> = sentence
                .words
                .iter()
                .map(|w| engine.vocabulary().word(w.word).output.as_str())
                .filter(|t| !t.is_empty())
                .collect();
            print!("{}: #{} {}", input.display(), sentence.rank + 1, text.join(" "));
            match sentence.confidence {
                Some(c) => println!("  (score {:.2}, conf {:.3})", sentence.score, c),
                None => println!("  (score {:.2})", sentence.score),
            }
            for w in &sentence.words {
                println!(
                    "    {:>4}..{:<4} {:<20} am {:>10.2}  lm {:>8.2}",
                    w.begin,
                    w.end,
                    engine.vocabulary().word(w.word).output,
                    w.am_score,
                    w.lm_score
                );
            }
        }
        if let Some(cn) = &result.confusion_network {
            print!("{}", cn.format(engine.vocabulary()));
        }
        engine.close_stream();
    }
    Ok(())
}

fn main() {
    harken::setup_logging();
    let args = Args::parse();
    if args.inputs.is_empty() {
        error!("no input files given");
        std::process::exit(2);
    }
    let engine = match build_engine(&args) {
        Ok(engine) => engine,
        Err(e) => {
            error!("failed to load resources: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = recognise_all(engine, &args) {
        error!("recognition failed: {:#}", e);
        std::process::exit(2);
    }
}
