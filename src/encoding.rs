//! Ordered-candidate text decoding for plain-text uploads.
//!
//! Plain-text and Markdown files carry no declared charset. The resolver
//! sniffs a byte-order mark first, then tries each configured candidate
//! with a strict decode (malformed input is a miss, never a replacement
//! character) and returns the first success together with the encoding's
//! canonical name.
//!
//! The legacy CJK encodings overlap heavily: most valid Big5, EUC-KR and
//! Shift_JIS text is also valid GBK. Before decoding, `chardetng` guesses
//! the encoding from byte statistics and its guess is tried right after
//! UTF-8, ahead of the other candidates. A guess outside the candidate list
//! is ignored. When a legacy candidate other than the guess wins,
//! [`Decoded::detected`] carries the guess so callers can surface the
//! disagreement.
//!
//! The fallback policy is data: [`DEFAULT_ENCODINGS`] ends with
//! `windows-1252`, which maps every byte, so the default list cannot be
//! exhausted. A win by the last candidate is reported through
//! [`Decoded::fallback`] so callers can log it as a soft failure.

use anyhow::{bail, Result};
use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8};

use crate::error::IngestError;

/// Default candidate labels, tried in order.
pub const DEFAULT_ENCODINGS: &[&str] = &[
    "utf-8",
    "gbk",
    "big5",
    "shift_jis",
    "euc-kr",
    "windows-1252",
];

/// Result of a successful decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    /// Canonical encoding name, e.g. `"UTF-8"`, `"GBK"`, `"windows-1252"`.
    pub encoding: &'static str,
    /// The last candidate in a multi-entry list was used.
    pub fallback: bool,
    /// The encoding came from a byte-order mark rather than the candidate list.
    pub bom: bool,
    /// Detector guess, set only when a legacy encoding other than the
    /// guess won.
    pub detected: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct EncodingResolver {
    candidates: Vec<&'static Encoding>,
}

impl Default for EncodingResolver {
    fn default() -> Self {
        let candidates = DEFAULT_ENCODINGS
            .iter()
            .filter_map(|label| Encoding::for_label(label.as_bytes()))
            .collect();
        Self { candidates }
    }
}

impl EncodingResolver {
    /// Build a resolver from WHATWG encoding labels (`"utf-8"`, `"gb18030"`,
    /// `"latin1"`, ...). Unknown labels and an empty list are rejected.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Result<Self> {
        if labels.is_empty() {
            bail!("extract.encodings must list at least one encoding");
        }
        let mut candidates = Vec::with_capacity(labels.len());
        for label in labels {
            let label = label.as_ref();
            match Encoding::for_label(label.trim().as_bytes()) {
                Some(enc) => candidates.push(enc),
                None => bail!("unknown encoding label in extract.encodings: '{}'", label),
            }
        }
        Ok(Self { candidates })
    }

    /// Canonical names of the candidates, in order.
    pub fn candidate_names(&self) -> Vec<&'static str> {
        self.candidates.iter().map(|e| e.name()).collect()
    }

    pub fn resolve(&self, bytes: &[u8]) -> Result<Decoded, IngestError> {
        if let Some((enc, bom_len)) = Encoding::for_bom(bytes) {
            if let Some(text) =
                enc.decode_without_bom_handling_and_without_replacement(&bytes[bom_len..])
            {
                return Ok(Decoded {
                    text: text.into_owned(),
                    encoding: enc.name(),
                    fallback: false,
                    bom: true,
                    detected: None,
                });
            }
        }

        let guess = detect(bytes);
        let last = self.candidates.len().saturating_sub(1);
        for i in self.ranked(guess) {
            let enc = self.candidates[i];
            if let Some(text) = enc.decode_without_bom_handling_and_without_replacement(bytes) {
                return Ok(Decoded {
                    text: text.into_owned(),
                    encoding: enc.name(),
                    fallback: i == last && self.candidates.len() > 1,
                    bom: false,
                    detected: (guess != enc && enc != UTF_8).then(|| guess.name()),
                });
            }
        }

        Err(IngestError::EncodingExhausted(
            self.candidate_names().join(", "),
        ))
    }

    /// Candidate indices in trial order: UTF-8 first when configured, then
    /// the detector's guess, then the rest in configured order. The last
    /// candidate keeps its place so a permissive single-byte fallback cannot
    /// shadow the multi-byte candidates before it.
    fn ranked(&self, guess: &'static Encoding) -> Vec<usize> {
        let last = self.candidates.len().saturating_sub(1);
        let mut order: Vec<usize> = Vec::with_capacity(self.candidates.len());
        if let Some(i) = self.candidates.iter().position(|e| *e == UTF_8) {
            order.push(i);
        }
        if let Some(i) = self.candidates.iter().position(|e| *e == guess) {
            if i != last && !order.contains(&i) {
                order.push(i);
            }
        }
        for i in 0..self.candidates.len() {
            if !order.contains(&i) {
                order.push(i);
            }
        }
        order
    }
}

fn detect(bytes: &[u8]) -> &'static Encoding {
    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    detector.guess(None, true)
}
