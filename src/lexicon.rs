//! The pronunciation dictionary. Each line gives one word: the name the language model knows it
//! by, an optional display form, and the phone sequence it sounds like. A word may appear on
//! several lines with alternative pronunciations; each line becomes its own entry so the search
//! treats pronunciation variants as distinct words that happen to share an LM name.
//!
//! Format details, all of which show up in real dictionaries:
//! - `#` starts a comment, blank lines are skipped
//! - a second column of the form `@-1.23` is a class membership log probability (class N-grams)
//! - `[display]` sets the output form; `{display}` does the same and additionally marks the
//!   word *transparent*: it is emitted in results but does not become language-model context
//! - in grammar mode the first column is the terminal (category) number instead of an LM name
use ahash::AHashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use tracing::{info, warn};

use crate::error::ModelError;
use crate::hmm::AcousticModel;
use crate::logprob::LogProb;

pub type WordId = u32;
pub const WORD_INVALID: WordId = u32::MAX;

/// Natural log of 10; dictionary and ARPA probabilities arrive base-10.
pub(crate) const LN10: f32 = std::f32::consts::LN_10;

#[derive(Clone, Debug)]
pub struct Word {
    /// Name the LM / grammar knows this word by.
    pub name: String,
    /// What gets printed when the word is recognised.
    pub output: String,
    /// Pronunciation as logical phone names.
    pub phones: Vec<String>,
    /// Transparent words keep the previous word as LM context.
    pub transparent: bool,
    /// Class membership score for class N-grams, natural log. 0 for plain words.
    pub class_log_prob: LogProb,
    /// Terminal (category) id in grammar mode.
    pub category: u32,
}

#[derive(Clone, Debug, Default)]
pub struct Vocabulary {
    words: Vec<Word>,
    by_name: AHashMap<String, Vec<WordId>>,
}

impl Vocabulary {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ModelError::io(path, e))?;
        Self::from_reader(BufReader::new(file), &path.display().to_string())
    }

    pub fn from_reader(reader: impl BufRead, file: &str) -> Result<Self, ModelError> {
        let mut voca = Self::default();
        for (lno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| ModelError::format(file, lno + 1, e.to_string()))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut toks = line.split_whitespace().peekable();
            let name = toks.next().unwrap().to_string();

            let mut class_log_prob = 0.0;
            if let Some(t) = toks.peek() {
                if let Some(p) = t.strip_prefix('@') {
                    let v: f32 = p.parse().map_err(|_| {
                        ModelError::format(file, lno + 1, format!("bad class probability \"{}\"", t))
                    })?;
                    class_log_prob = v * LN10;
                    toks.next();
                }
            }

            let mut output = name.clone();
            let mut transparent = false;
            if let Some(t) = toks.peek() {
                if t.starts_with('[') && t.ends_with(']') {
                    output = t[1..t.len() - 1].to_string();
                    toks.next();
                } else if t.starts_with('{') && t.ends_with('}') {
                    output = t[1..t.len() - 1].to_string();
                    transparent = true;
                    toks.next();
                }
            }

            let phones: Vec<String> = toks.map(|t| t.to_string()).collect();
            if phones.is_empty() {
                return Err(ModelError::format(
                    file,
                    lno + 1,
                    format!("word \"{}\" has no phone sequence", name),
                ));
            }
            voca.push(Word {
                name,
                output,
                phones,
                transparent,
                class_log_prob,
                category: 0,
            });
        }
        info!("lexicon: {} entries from {}", voca.words.len(), file);
        Ok(voca)
    }

    pub fn push(&mut self, word: Word) -> WordId {
        let id = self.words.len() as WordId;
        self.by_name.entry(word.name.clone()).or_default().push(id);
        self.words.push(word);
        id
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn word(&self, id: WordId) -> &Word {
        &self.words[id as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (WordId, &Word)> {
        self.words.iter().enumerate().map(|(i, w)| (i as WordId, w))
    }

    /// All entries (pronunciation variants) sharing an LM name.
    pub fn ids_of(&self, name: &str) -> &[WordId] {
        self.by_name.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// First entry of a name, the common case for control words like `<s>`.
    pub fn id_of(&self, name: &str) -> Option<WordId> {
        self.ids_of(name).first().copied()
    }

    /// Checks every pronunciation against the acoustic model. Words with unresolvable phones
    /// are dropped with a warning, or fail the load in strict mode. Returns the number of
    /// dropped entries.
    pub fn validate_phones(
        &mut self,
        model: &AcousticModel,
        strict: bool,
    ) -> Result<usize, ModelError> {
        let mut bad: Vec<(WordId, String)> = Vec::new();
        for (id, word) in self.iter() {
            for phone in &word.phones {
                if model.resolve(phone).is_none() {
                    bad.push((id, phone.clone()));
                    break;
                }
            }
        }
        if let Some((id, phone)) = bad.first() {
            if strict {
                return Err(ModelError::UnknownPhone {
                    word: self.words[*id as usize].name.clone(),
                    phone: phone.clone(),
                });
            }
        }
        for (id, phone) in bad.iter().rev() {
            warn!(
                "dropping \"{}\": phone \"{}\" not in acoustic model",
                self.words[*id as usize].name, phone
            );
            self.remove(*id);
        }
        Ok(bad.len())
    }

    /// Grammar mode resolves the name column into a category number after load.
    pub(crate) fn set_category(&mut self, id: WordId, cat: u32) {
        self.words[id as usize].category = cat;
    }

    fn remove(&mut self, id: WordId) {
        self.words.remove(id as usize);
        self.by_name.clear();
        for (i, w) in self.words.iter().enumerate() {
            self.by_name
                .entry(w.name.clone())
                .or_default()
                .push(i as WordId);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const DICT: &str = "\
# test dictionary
one  [one] w ah n
two  [two] t uw
two  [two] t ux
<s>  [] sil
sp   {} sp
word @-0.5 [classy] k l
";

    #[test]
    fn parses_entries() {
        let v = Vocabulary::from_reader(Cursor::new(DICT), "dict").unwrap();
        assert_eq!(v.len(), 6);
        let one = v.word(v.id_of("one").unwrap());
        assert_eq!(one.output, "one");
        assert_eq!(one.phones, vec!["w", "ah", "n"]);
        assert!(!one.transparent);
        // Alternative pronunciations are separate entries under one name.
        assert_eq!(v.ids_of("two").len(), 2);
        // Silence word with empty output.
        let s = v.word(v.id_of("<s>").unwrap());
        assert_eq!(s.output, "");
        assert_eq!(s.phones, vec!["sil"]);
    }

    #[test]
    fn transparent_and_class_markers() {
        let v = Vocabulary::from_reader(Cursor::new(DICT), "dict").unwrap();
        let sp = v.word(v.id_of("sp").unwrap());
        assert!(sp.transparent);
        let classy = v.word(v.id_of("word").unwrap());
        assert_eq!(classy.output, "classy");
        assert!((classy.class_log_prob - (-0.5 * LN10)).abs() < 1e-6);
    }

    #[test]
    fn missing_phones_is_an_error() {
        assert!(Vocabulary::from_reader(Cursor::new("lonely\n"), "dict").is_err());
    }

    #[test]
    fn phone_validation_drops_or_fails() {
        use crate::hmm_parse::ModelBuilder;
        let mut b = ModelBuilder::new();
        b.parse_hmmdefs_text(crate::hmm_parse::SMALL_HMMDEFS, "t")
            .unwrap();
        let model = b.build().unwrap();

        let dict = "good [good] a b\nbad [bad] a q\n";
        let mut v = Vocabulary::from_reader(Cursor::new(dict), "dict").unwrap();
        let dropped = v.validate_phones(&model, false).unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(v.len(), 1);
        assert!(v.id_of("bad").is_none());

        let mut v = Vocabulary::from_reader(Cursor::new(dict), "dict").unwrap();
        assert!(v.validate_phones(&model, true).is_err());
    }
}
