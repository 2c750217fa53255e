//! ARPA text format for back-off N-grams: a `\data\` header with per-order counts, one
//! `\N-grams:` section per order listing `logprob w1 ... wN [backoff]` with base-10 logs, and a
//! closing `\end\`. The reader converts to natural logs for the packed tables; the writer
//! converts back, so a load/save cycle reproduces the file's numbers.
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

use crate::error::ModelError;
use crate::lexicon::LN10;
use crate::lm::Direction;
use crate::ngram::{NGram, NGramBuilder};

/// Reads an ARPA file into a packed N-gram.
pub fn read_arpa(path: impl AsRef<Path>, dir: Direction) -> Result<NGram, ModelError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| ModelError::io(path, e))?;
    read_arpa_from(BufReader::new(file), &path.display().to_string(), dir)
}

pub fn read_arpa_from(
    reader: impl BufRead,
    file: &str,
    dir: Direction,
) -> Result<NGram, ModelError> {
    let mut lines = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| ModelError::format(file, i + 1, e.to_string()))?;
        lines.push(line);
    }
    let err = |lno: usize, msg: String| ModelError::format(file, lno + 1, msg);

    // header
    let mut at = lines
        .iter()
        .position(|l| l.trim() == "\\data\\")
        .ok_or_else(|| err(0, "no \\data\\ header".into()))?;
    at += 1;
    let mut counts = Vec::new();
    while at < lines.len() {
        let line = lines[at].trim();
        if line.is_empty() {
            at += 1;
            continue;
        }
        let Some(rest) = line.strip_prefix("ngram ") else {
            break;
        };
        let (order, count) = rest
            .split_once('=')
            .ok_or_else(|| err(at, format!("bad count line \"{}\"", line)))?;
        let order: usize = order
            .trim()
            .parse()
            .map_err(|_| err(at, format!("bad order in \"{}\"", line)))?;
        let count: usize = count
            .trim()
            .parse()
            .map_err(|_| err(at, format!("bad count in \"{}\"", line)))?;
        if order != counts.len() + 1 {
            return Err(err(at, format!("orders out of sequence at \"{}\"", line)));
        }
        counts.push(count);
        at += 1;
    }
    if counts.is_empty() {
        return Err(err(at.min(lines.len() - 1), "no ngram counts in header".into()));
    }
    let n = counts.len();
    let mut builder = NGramBuilder::new(n, dir);

    // sections
    for (level, &expected) in counts.iter().enumerate() {
        let marker = format!("\\{}-grams:", level + 1);
        while at < lines.len() && lines[at].trim() != marker {
            if !lines[at].trim().is_empty() {
                return Err(err(at, format!("expected {} but found \"{}\"", marker, lines[at])));
            }
            at += 1;
        }
        if at >= lines.len() {
            return Err(err(lines.len() - 1, format!("missing section {}", marker)));
        }
        at += 1;
        let mut seen = 0usize;
        while at < lines.len() {
            let line = lines[at].trim();
            if line.is_empty() {
                at += 1;
                continue;
            }
            if line.starts_with('\\') {
                break;
            }
            let mut toks = line.split_whitespace();
            let logp: f32 = toks
                .next()
                .unwrap()
                .parse()
                .map_err(|_| err(at, format!("bad probability in \"{}\"", line)))?;
            let mut tuple = Vec::with_capacity(level + 1);
            for _ in 0..=level {
                let w = toks
                    .next()
                    .ok_or_else(|| err(at, format!("truncated tuple \"{}\"", line)))?;
                tuple.push(builder.intern(w));
            }
            let bo: f32 = match toks.next() {
                Some(t) => t
                    .parse()
                    .map_err(|_| err(at, format!("bad back-off weight in \"{}\"", line)))?,
                None => 0.0,
            };
            builder.add(level, tuple, logp * LN10, bo * LN10);
            seen += 1;
            at += 1;
        }
        if seen != expected {
            warn!(
                "{}: {} {}-gram entries, header said {}",
                file,
                seen,
                level + 1,
                expected
            );
        }
    }

    while at < lines.len() && lines[at].trim().is_empty() {
        at += 1;
    }
    if at >= lines.len() || lines[at].trim() != "\\end\\" {
        return Err(err(at.min(lines.len() - 1), "missing \\end\\".into()));
    }
    info!("{}: {}-gram ARPA read", file, n);
    builder.build()
}

/// Writes an N-gram back out as ARPA text.
pub fn write_arpa(ngram: &NGram, path: impl AsRef<Path>) -> Result<(), ModelError> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| ModelError::io(path, e))?;
    write_arpa_to(ngram, BufWriter::new(file)).map_err(|e| ModelError::io(path, e))
}

pub fn write_arpa_to(ngram: &NGram, mut w: impl Write) -> io::Result<()> {
    writeln!(w, "\\data\\")?;
    for level in 0..ngram.order() {
        writeln!(w, "ngram {}={}", level + 1, ngram.level_len(level))?;
    }
    for level in 0..ngram.order() {
        writeln!(w)?;
        writeln!(w, "\\{}-grams:", level + 1)?;
        for (tuple, logp, bo) in ngram.tuples(level) {
            write!(w, "{:.6}", logp / LN10)?;
            for id in &tuple {
                write!(w, "\t{}", ngram.name(*id))?;
            }
            if level < ngram.order() - 1 {
                write!(w, "\t{:.6}", bo / LN10)?;
            }
            writeln!(w)?;
        }
    }
    writeln!(w)?;
    writeln!(w, "\\end\\")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::LangModel;
    use std::io::Cursor;

    const ARPA: &str = "\
some free text header

\\data\\
ngram 1=4
ngram 2=3

\\1-grams:
-1.000000\t<s>\t-0.300000
-0.900000\t</s>\t0.000000
-0.600000\ta\t-0.250000
-0.800000\tb\t0.000000

\\2-grams:
-0.200000\t<s>\ta
-0.300000\ta\tb
-0.150000\tb\t</s>

\\end\\
";

    #[test]
    fn reads_sections_and_scores() {
        let g = read_arpa_from(Cursor::new(ARPA), "test.arpa", Direction::Forward).unwrap();
        assert_eq!(g.order(), 2);
        assert_eq!(g.vocab_len(), 4);
        let a = g.entry_id("a").unwrap();
        let b = g.entry_id("b").unwrap();
        assert!((g.logp_fast(b, a) - (-0.3 * LN10)).abs() < 1e-5);
        // back-off path: P(a | b) = bo(b) + P(a) = 0.0 + -0.6
        assert!((g.logp_fast(a, b) - (-0.6 * LN10)).abs() < 1e-5);
    }

    /// Load, write, reload: probabilities and back-off weights survive within 1e-5.
    #[test]
    fn round_trip() {
        let g = read_arpa_from(Cursor::new(ARPA), "test.arpa", Direction::Forward).unwrap();
        let mut out = Vec::new();
        write_arpa_to(&g, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let g2 = read_arpa_from(Cursor::new(text.as_str()), "copy.arpa", Direction::Forward)
            .unwrap();
        assert_eq!(g.vocab_len(), g2.vocab_len());
        for level in 0..g.order() {
            let t1 = g.tuples(level);
            let t2 = g2.tuples(level);
            assert_eq!(t1.len(), t2.len());
            for (a, b) in t1.iter().zip(&t2) {
                // ids can differ (interning order), names must not
                let n1: Vec<&str> = a.0.iter().map(|&i| g.name(i)).collect();
                let n2: Vec<&str> = b.0.iter().map(|&i| g2.name(i)).collect();
                assert_eq!(n1, n2);
                assert!((a.1 - b.1).abs() < 1e-5 * LN10);
                assert!((a.2 - b.2).abs() < 1e-5 * LN10);
            }
        }
    }

    #[test]
    fn rejects_missing_end() {
        let text = ARPA.replace("\\end\\", "");
        assert!(read_arpa_from(Cursor::new(text.as_str()), "t", Direction::Forward).is_err());
    }

    #[test]
    fn rejects_truncated_tuple() {
        let text = ARPA.replace("-0.300000\ta\tb", "-0.300000");
        assert!(read_arpa_from(Cursor::new(text.as_str()), "t", Direction::Forward).is_err());
    }
}
