#![doc = include_str!("../README.md")]
use tracing_subscriber::filter::EnvFilter;

pub mod arpa;
pub mod config;
pub mod dfa;
pub mod dnn;
pub mod engine;
pub mod error;
pub mod features;
pub mod graph;
pub mod hmm;
pub mod hmm_parse;
pub mod lexicon;
pub mod lm;
pub mod logprob;
pub mod ngram;
pub mod pass1;
pub mod pass2;
pub mod scorer;
pub mod tree_lexicon;
pub mod trellis;

pub use engine::{Engine, RecognitionResult, RecognitionStatus};

/// Targets covered by the default log filter: the library itself plus its shipped binaries.
const LOG_TARGETS: [&str; 3] = [env!("CARGO_PKG_NAME"), "app", "lm_convert"];

/// Installs the global tracing subscriber the binaries rely on. `RUST_LOG` wins when set;
/// otherwise the crate and its binaries log at `info` and everything else stays quiet. Call
/// once at startup, before any engine is loaded, so the model loaders' progress lines land
/// somewhere.
pub fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let spec = LOG_TARGETS
            .iter()
            .map(|t| format!("{}=info", t))
            .collect::<Vec<_>>()
            .join(",");
        EnvFilter::new(spec)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
