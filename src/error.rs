//! Error types for resource loading. Decode-time conditions (empty beam, exhausted stack) are not
//! errors, they are reported through the per-utterance result record; only failures to get the
//! models into memory surface through these enums.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// All the ways loading an acoustic model, lexicon, N-gram or grammar can fail.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{file}:{line}: {msg}")]
    Format {
        file: String,
        line: usize,
        msg: String,
    },

    #[error("malformed {what}: {msg}")]
    Malformed { what: &'static str, msg: String },

    #[error("parameter kind mismatch: model was trained on {model} but input is {input}")]
    ParameterKindMismatch { model: String, input: String },

    #[error("triphone \"{0}\" is not covered by the HMM list and no pseudo model could be built")]
    UnknownTriphone(String),

    #[error("word \"{word}\" references phone \"{phone}\" absent from the acoustic model")]
    UnknownPhone { word: String, phone: String },

    #[error("vector length mismatch: model expects {expected} but input frames have {got}")]
    VectorLength { expected: usize, got: usize },

    #[error("grammar error: {0}")]
    Grammar(String),
}

impl ModelError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn format(file: impl Into<String>, line: usize, msg: impl Into<String>) -> Self {
        Self::Format {
            file: file.into(),
            line,
            msg: msg.into(),
        }
    }
}
