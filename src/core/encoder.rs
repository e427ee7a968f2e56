//! Deterministic text → feature vector encoder.
//!
//! The output vector is split into four disjoint bands:
//! - orthographic: length, vowel ratio, capitalization, digits, repeats
//! - n-gram: signed hashes of character bigrams and trigrams of `^word$`
//! - phonetic: syllable estimate, consonant clustering, sound classes
//! - statistical: letter distribution relative to a fixed reference table
//!
//! Every feature is expressed as a deviation from a typical value, so that
//! unrelated words do not share a large common component. Each band is
//! normalized on its own, weighted, and the whole vector is normalized again.
//!
//! Encoding is a pure function of the input bytes and `EncoderConfig`. The
//! only hash used is `storage::fingerprint64`, which is stable across runs
//! and platforms.

use core::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use tracing::debug;

use crate::error::EncodingError;
use crate::storage;
use crate::vector::{self, FeatureVector, DEFAULT_DIM};

/// Smallest supported dimension (every band needs at least two slots).
pub const MIN_DIM: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Orthographic,
    NGram,
    Phonetic,
    Statistical,
}

impl Band {
    pub const ALL: [Band; 4] = [
        Band::Orthographic,
        Band::NGram,
        Band::Phonetic,
        Band::Statistical,
    ];
}

/// Disjoint index ranges for each band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandLayout {
    pub orthographic: Range<usize>,
    pub ngram: Range<usize>,
    pub phonetic: Range<usize>,
    pub statistical: Range<usize>,
}

impl BandLayout {
    /// D/8 orthographic, D/8 phonetic, D/4 statistical, the rest n-grams.
    pub fn for_dim(dim: usize) -> Self {
        let ortho = (dim / 8).max(2);
        let phon = (dim / 8).max(2);
        let stat = (dim / 4).max(2);
        let ngram = dim.saturating_sub(ortho + phon + stat);

        let o = 0..ortho;
        let n = o.end..o.end + ngram;
        let p = n.end..n.end + phon;
        let s = p.end..p.end + stat;
        Self {
            orthographic: o,
            ngram: n,
            phonetic: p,
            statistical: s,
        }
    }

    pub fn range(&self, band: Band) -> Range<usize> {
        match band {
            Band::Orthographic => self.orthographic.clone(),
            Band::NGram => self.ngram.clone(),
            Band::Phonetic => self.phonetic.clone(),
            Band::Statistical => self.statistical.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EncoderConfig {
    /// Output dimension D.
    pub dim: usize,
    pub orthographic_weight: f32,
    pub ngram_weight: f32,
    pub phonetic_weight: f32,
    pub statistical_weight: f32,
    /// Salt mixed into n-gram hashes. Changing it changes every encoding.
    pub hash_salt: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            dim: DEFAULT_DIM,
            orthographic_weight: 0.6,
            ngram_weight: 1.0,
            phonetic_weight: 0.5,
            statistical_weight: 0.7,
            hash_salt: 0x6e67_7261_6d73,
        }
    }
}

impl EncoderConfig {
    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    pub fn with_band_weights(mut self, ortho: f32, ngram: f32, phonetic: f32, stat: f32) -> Self {
        self.orthographic_weight = ortho;
        self.ngram_weight = ngram;
        self.phonetic_weight = phonetic;
        self.statistical_weight = stat;
        self
    }

    pub fn with_hash_salt(mut self, salt: u64) -> Self {
        self.hash_salt = salt;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.dim < MIN_DIM {
            return Err("dim must be >= 16");
        }
        let weights = [
            self.orthographic_weight,
            self.ngram_weight,
            self.phonetic_weight,
            self.statistical_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err("band weights must be finite and >= 0");
        }
        if weights.iter().all(|w| *w == 0.0) {
            return Err("at least one band weight must be > 0");
        }
        Ok(())
    }

    fn weight(&self, band: Band) -> f32 {
        match band {
            Band::Orthographic => self.orthographic_weight,
            Band::NGram => self.ngram_weight,
            Band::Phonetic => self.phonetic_weight,
            Band::Statistical => self.statistical_weight,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureEncoder {
    cfg: EncoderConfig,
    layout: BandLayout,
}

impl FeatureEncoder {
    pub fn new(cfg: EncoderConfig) -> Result<Self, &'static str> {
        cfg.validate()?;
        let layout = BandLayout::for_dim(cfg.dim);
        Ok(Self { cfg, layout })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.cfg
    }

    pub fn dim(&self) -> usize {
        self.cfg.dim
    }

    pub fn layout(&self) -> &BandLayout {
        &self.layout
    }

    /// The vector returned for input with no usable signal.
    pub fn default_vector(&self) -> FeatureVector {
        FeatureVector::uniform(self.cfg.dim)
    }

    /// Encode text. Never fails: empty or signal-free input yields `default_vector()`.
    pub fn encode(&self, text: &str) -> FeatureVector {
        match self.try_encode(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "encoding fell back to default vector");
                self.default_vector()
            }
        }
    }

    /// Encode text, reporting why no vector could be derived.
    ///
    /// Multi-word input is the normalized mean of its word vectors, so words
    /// and phrases live in one space.
    pub fn try_encode(&self, text: &str) -> Result<FeatureVector, EncodingError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(EncodingError::Empty);
        }
        let words: Vec<&str> = trimmed.split_whitespace().collect();
        if words.len() == 1 {
            return self.try_encode_word(words[0]);
        }
        self.encode_phrase(&words)
            .ok_or_else(|| EncodingError::NoSignal(trimmed.to_string()))
    }

    pub fn encode_word(&self, word: &str) -> FeatureVector {
        self.try_encode_word(word)
            .unwrap_or_else(|_| self.default_vector())
    }

    /// Mean of the word vectors of `words`, skipping signal-free words.
    /// `None` when no word carries signal.
    pub fn encode_phrase<S: AsRef<str>>(&self, words: &[S]) -> Option<FeatureVector> {
        let parts: Vec<FeatureVector> = words
            .iter()
            .filter_map(|w| self.try_encode_word(w.as_ref()).ok())
            .collect();
        let mean = FeatureVector::mean_of(&parts)?;
        // Opposing words can cancel out.
        if mean.is_zero() {
            return None;
        }
        Some(mean)
    }

    fn try_encode_word(&self, raw: &str) -> Result<FeatureVector, EncodingError> {
        let word = raw.trim_matches(|c: char| !c.is_alphanumeric());
        if word.is_empty() {
            return if raw.trim().is_empty() {
                Err(EncodingError::Empty)
            } else {
                Err(EncodingError::NoSignal(raw.to_string()))
            };
        }

        let chars: Vec<char> = word.chars().collect();
        let lower: Vec<char> = word.to_lowercase().chars().collect();

        let mut out = vec![0.0f32; self.cfg.dim];
        for band in Band::ALL {
            let range = self.layout.range(band);
            let slot = &mut out[range];
            match band {
                Band::Orthographic => orthographic(&chars, &lower, slot),
                Band::NGram => ngrams(&lower, self.cfg.hash_salt, slot),
                Band::Phonetic => phonetic(&lower, self.cfg.hash_salt, slot),
                Band::Statistical => statistical(&lower, slot),
            }
            vector::l2_normalize(slot);
            let w = self.cfg.weight(band);
            for v in slot.iter_mut() {
                *v *= w;
            }
        }

        let v = FeatureVector::from_raw(out);
        if v.is_zero() {
            return Err(EncodingError::NoSignal(raw.to_string()));
        }
        Ok(v)
    }
}

impl Default for FeatureEncoder {
    fn default() -> Self {
        let cfg = EncoderConfig::default();
        let layout = BandLayout::for_dim(cfg.dim);
        Self { cfg, layout }
    }
}

#[inline]
fn is_vowel(c: char) -> bool {
    matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y')
}

#[inline]
fn is_consonant(c: char) -> bool {
    c.is_alphabetic() && !is_vowel(c)
}

/// Add `value` at feature index `i`, wrapping around the band.
#[inline]
fn put(slot: &mut [f32], i: usize, value: f32) {
    let n = slot.len();
    if n > 0 {
        slot[i % n] += value;
    }
}

/// Signed hashed feature: bucket and sign both come from the hash.
#[inline]
fn put_hashed(slot: &mut [f32], h: u64, value: f32) {
    let n = slot.len() as u64;
    if n == 0 {
        return;
    }
    let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
    slot[(h % n) as usize] += sign * value;
}

fn orthographic(chars: &[char], lower: &[char], slot: &mut [f32]) {
    let len = chars.len() as f32;
    let letters = chars.iter().filter(|c| c.is_alphabetic()).count() as f32;
    let vowels = lower.iter().filter(|c| is_vowel(**c)).count() as f32;
    let upper = chars.iter().filter(|c| c.is_uppercase()).count() as f32;
    let digits = chars.iter().filter(|c| c.is_ascii_digit()).count() as f32;
    let other = chars.iter().filter(|c| !c.is_alphanumeric()).count() as f32;
    let doubles = lower.windows(2).filter(|w| w[0] == w[1]).count() as f32;
    let mut uniq = lower.to_vec();
    uniq.sort_unstable();
    uniq.dedup();

    let vowel_ratio = if letters > 0.0 { vowels / letters } else { 0.0 };
    let first_upper = chars.first().map_or(false, |c| c.is_uppercase());
    let all_upper = letters > 1.0 && upper == letters;

    let features = [
        ((len - 6.0) / 6.0).clamp(-1.0, 2.0),
        ((1.0 + len).ln() - 2.0) * 0.5,
        vowel_ratio - 0.4,
        upper / len - 0.05,
        if first_upper { 0.5 } else { -0.05 },
        if all_upper { 0.5 } else { 0.0 },
        digits / len,
        other / len,
        uniq.len() as f32 / len - 0.8,
        doubles / len.max(1.0),
        if lower.last() == Some(&'s') { 0.3 } else { -0.05 },
        if lower.first().map_or(false, |c| is_vowel(*c)) { 0.3 } else { -0.1 },
    ];
    for (i, f) in features.iter().enumerate() {
        put(slot, i, *f);
    }
}

fn ngrams(lower: &[char], salt: u64, slot: &mut [f32]) {
    let mut padded = Vec::with_capacity(lower.len() + 2);
    padded.push('^');
    padded.extend_from_slice(lower);
    padded.push('$');

    let mut buf = [0u8; 12];
    for (n, weight, tag) in [(2usize, 0.6f32, 2u64), (3, 1.0, 3)] {
        for gram in padded.windows(n) {
            let mut len = 0;
            for c in gram {
                len += c.encode_utf8(&mut buf[len..]).len();
            }
            let h = storage::mix64(storage::fingerprint64(&buf[..len]), salt ^ tag);
            put_hashed(slot, h, weight);
        }
    }
}

/// Rough consonant sound class (Soundex-like grouping).
fn sound_class(c: char) -> u8 {
    match c {
        'b' | 'f' | 'p' | 'v' => 1,
        'c' | 'g' | 'j' | 'k' | 'q' | 's' | 'x' | 'z' => 2,
        'd' | 't' => 3,
        'l' => 4,
        'm' | 'n' => 5,
        'r' => 6,
        'h' | 'w' => 7,
        _ if is_vowel(c) => 0,
        _ => 8,
    }
}

fn phonetic(lower: &[char], salt: u64, slot: &mut [f32]) {
    let letters: Vec<char> = lower.iter().copied().filter(|c| c.is_alphabetic()).collect();
    let n = letters.len().max(1) as f32;

    let mut syllables = 0u32;
    let mut prev_vowel = false;
    let mut cluster = 0u32;
    let mut max_cluster = 0u32;
    let mut clusters = 0u32;
    for &c in &letters {
        let v = is_vowel(c);
        if v && !prev_vowel {
            syllables += 1;
        }
        if is_consonant(c) {
            cluster += 1;
            if cluster == 2 {
                clusters += 1;
            }
            max_cluster = max_cluster.max(cluster);
        } else {
            cluster = 0;
        }
        prev_vowel = v;
    }
    // Silent trailing 'e'.
    if syllables > 1 && letters.last() == Some(&'e') && letters.len() > 2 {
        syllables -= 1;
    }

    let count = |set: &[char]| letters.iter().filter(|c| set.contains(c)).count() as f32 / n;
    let fixed = [
        (syllables as f32 - 2.0) / 2.0,
        (max_cluster as f32 - 1.5) / 2.0,
        clusters as f32 / n,
        count(&['p', 'b', 't', 'd', 'k', 'g']) - 0.2,
        count(&['s', 'z', 'c', 'x', 'f', 'v']) - 0.15,
        count(&['m', 'n', 'l', 'r']) - 0.2,
        if letters.last().map_or(false, |c| is_vowel(*c)) { 0.3 } else { -0.2 },
    ];

    // Fixed features occupy the head of the band when it is wide enough;
    // the tail receives hashed sound-class bigrams.
    let head = fixed.len().min(slot.len() / 2).max(1);
    for (i, f) in fixed.iter().enumerate() {
        put(&mut slot[..head], i, *f);
    }

    let classes: Vec<u8> = letters
        .iter()
        .map(|c| sound_class(*c))
        .filter(|k| *k != 0)
        .collect();
    let tail = &mut slot[head..];
    if tail.is_empty() {
        return;
    }
    // Leading class carries most of the perceived sound.
    if let Some(&first) = classes.first() {
        put_hashed(tail, storage::mix64(salt ^ 0x70, first as u64), 1.0);
    }
    for pair in classes.windows(2) {
        let key = ((pair[0] as u64) << 8) | pair[1] as u64;
        put_hashed(tail, storage::mix64(salt ^ 0x71, key), 0.5);
    }
}

/// Approximate English letter frequencies (a..z), used as the reference
/// distribution so the band carries deviations rather than raw counts.
const LETTER_FREQ: [f32; 26] = [
    0.082, 0.015, 0.028, 0.043, 0.127, 0.022, 0.020, 0.061, 0.070, 0.002, 0.008, 0.040, 0.024,
    0.067, 0.075, 0.019, 0.001, 0.060, 0.063, 0.091, 0.028, 0.010, 0.024, 0.002, 0.020, 0.001,
];

fn statistical(lower: &[char], slot: &mut [f32]) {
    let mut counts = [0u32; 26];
    let mut digits = 0u32;
    let mut other = 0u32;
    for &c in lower {
        if c.is_ascii_lowercase() {
            counts[(c as u8 - b'a') as usize] += 1;
        } else if c.is_ascii_digit() {
            digits += 1;
        } else {
            other += 1;
        }
    }
    let n = lower.len().max(1) as f32;
    for (i, (&count, &reference)) in counts.iter().zip(LETTER_FREQ.iter()).enumerate() {
        put(slot, i, count as f32 / n - reference);
    }

    // Shannon entropy of the character distribution, relative to a short word.
    let mut entropy = 0.0f32;
    for &count in counts.iter().chain([digits, other].iter()) {
        if count > 0 {
            let p = count as f32 / n;
            entropy -= p * p.ln();
        }
    }
    put(slot, 26, (entropy - 1.5) * 0.3);
    put(slot, 27, digits as f32 / n);
    put(slot, 28, other as f32 / n);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_bit_identical_across_encoders() {
        let a = FeatureEncoder::default();
        let b = FeatureEncoder::new(EncoderConfig::default()).unwrap();
        for word in ["cat", "Dog", "xylophone", "hello world", "Ünïcödé"] {
            let x = a.encode(word);
            let y = b.encode(word);
            let xb: Vec<u32> = x.as_slice().iter().map(|f| f.to_bits()).collect();
            let yb: Vec<u32> = y.as_slice().iter().map(|f| f.to_bits()).collect();
            assert_eq!(xb, yb, "{word}");
        }
    }

    #[test]
    fn outputs_are_unit_norm() {
        let enc = FeatureEncoder::default();
        for word in ["a", "cat", "antidisestablishmentarianism", "R2D2", "two words"] {
            let v = enc.encode(word);
            assert_eq!(v.dim(), 128);
            assert!((v.norm() - 1.0).abs() < 1e-5, "{word}: {}", v.norm());
        }
    }

    #[test]
    fn empty_and_signal_free_input_yield_default_vector() {
        let enc = FeatureEncoder::default();
        assert_eq!(enc.try_encode("   "), Err(EncodingError::Empty));
        assert!(matches!(enc.try_encode("?!"), Err(EncodingError::NoSignal(_))));
        assert_eq!(enc.encode(""), enc.default_vector());
        assert_eq!(enc.encode("..."), enc.default_vector());
        assert!((enc.default_vector().norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn phrase_is_mean_of_word_vectors() {
        let enc = FeatureEncoder::default();
        let phrase = enc.encode("black cat");
        let expected =
            FeatureVector::mean_of(&[enc.encode_word("black"), enc.encode_word("cat")]).unwrap();
        assert!((phrase.cosine(&expected) - 1.0).abs() < 1e-6);
        assert!(phrase.cosine(&enc.encode("cat")) > 0.3);
    }

    #[test]
    fn similar_words_are_closer_than_unrelated_ones() {
        let enc = FeatureEncoder::default();
        let cat = enc.encode("cat");
        let cats = enc.encode("cats");
        let zebra = enc.encode("xylophone");
        assert!(cat.cosine(&cats) > cat.cosine(&zebra));
    }

    #[test]
    fn unrelated_words_are_not_strongly_correlated() {
        let enc = FeatureEncoder::default();
        let words = ["apple", "river", "quantum", "sky", "tiger", "moon", "bridge", "hello"];
        let vs: Vec<_> = words.iter().map(|w| enc.encode(w)).collect();
        let mut total = 0.0;
        let mut pairs = 0;
        for i in 0..vs.len() {
            for j in i + 1..vs.len() {
                total += vs[i].cosine(&vs[j]);
                pairs += 1;
            }
        }
        let mean = total / pairs as f32;
        assert!(mean < 0.5, "mean pairwise cosine {mean}");
    }

    #[test]
    fn bands_are_disjoint_and_cover_the_vector() {
        for dim in [16, 64, 128, 300] {
            let l = BandLayout::for_dim(dim);
            assert_eq!(l.orthographic.start, 0);
            assert_eq!(l.orthographic.end, l.ngram.start);
            assert_eq!(l.ngram.end, l.phonetic.start);
            assert_eq!(l.phonetic.end, l.statistical.start);
            assert_eq!(l.statistical.end, dim);
            assert!(!l.ngram.is_empty());
        }
    }

    #[test]
    fn rejects_tiny_dimension() {
        assert!(FeatureEncoder::new(EncoderConfig::default().with_dim(8)).is_err());
    }
}
