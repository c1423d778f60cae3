//! Text-driven viseme approximation.
//!
//! Engines that return bare audio get lip-sync marks by splitting the text
//! into rough phonetic units and spreading them evenly across the audio.

use crate::TimingMark;
use holo_types::CueShape;

const DIGRAPHS: &[(&str, &str)] = &[
    ("th", "TH"),
    ("sh", "CH"),
    ("ch", "CH"),
    ("ph", "FF"),
    ("ng", "nn"),
    ("ck", "kk"),
];

fn letter_viseme(c: char) -> Option<&'static str> {
    let viseme = match c {
        'a' => "aa",
        'e' => "E",
        'i' | 'y' => "ih",
        'o' => "oh",
        'u' | 'w' => "ou",
        'p' | 'b' | 'm' => "PP",
        'f' | 'v' => "FF",
        't' | 'd' => "DD",
        'k' | 'g' | 'c' | 'q' | 'x' | 'h' => "kk",
        'j' => "CH",
        's' | 'z' => "SS",
        'n' | 'l' => "nn",
        'r' => "RR",
        _ => return None,
    };
    Some(viseme)
}

/// Splits `text` into viseme ids, one per rough phonetic unit.
pub fn viseme_units(text: &str) -> Vec<&'static str> {
    let lower: Vec<char> = text.to_lowercase().chars().collect();
    let mut units = Vec::new();
    let mut i = 0;
    while i < lower.len() {
        if i + 1 < lower.len() {
            let pair: String = lower[i..i + 2].iter().collect();
            if let Some((_, viseme)) = DIGRAPHS.iter().find(|(d, _)| *d == pair) {
                units.push(*viseme);
                i += 2;
                continue;
            }
        }
        if let Some(viseme) = letter_viseme(lower[i]) {
            units.push(viseme);
        }
        i += 1;
    }
    units
}

/// Evenly spaced viseme marks covering `duration_ms` of audio for `text`.
///
/// Marks never extend past `duration_ms`.
pub fn approximate_marks(text: &str, duration_ms: u64) -> Vec<TimingMark> {
    let units = viseme_units(text);
    if units.is_empty() || duration_ms == 0 {
        return Vec::new();
    }
    let n = units.len() as u64;
    units
        .into_iter()
        .enumerate()
        .map(|(i, viseme)| {
            let start = i as u64 * duration_ms / n;
            let end = (i as u64 + 1) * duration_ms / n;
            TimingMark {
                offset_ms: start,
                duration_ms: end - start,
                shape: CueShape::Viseme(viseme.to_string()),
            }
        })
        .collect()
}
