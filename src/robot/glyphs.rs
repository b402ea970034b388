use super::captcha::binarize;
use super::RobotErr;
use image::{GrayImage, ImageFormat};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz";

/// Reference renderings per letter. Never empty for any letter it holds, and
/// read-only once built, so one instance can be shared by every decoder.
#[derive(Debug, Clone)]
pub struct GlyphSet {
    letters: BTreeMap<char, Vec<GrayImage>>,
}

impl GlyphSet {
    pub fn from_map(letters: BTreeMap<char, Vec<GrayImage>>) -> Result<Self, RobotErr> {
        if letters.is_empty() {
            return Err(RobotErr::ConfigErr("glyph set has no letters".to_owned()));
        }
        for (letter, refs) in &letters {
            if !letter.is_ascii_lowercase() {
                return Err(RobotErr::ConfigErr(format!("invalid glyph letter {:?}", letter)));
            }
            if refs.is_empty() {
                return Err(RobotErr::ConfigErr(format!("no reference glyphs for '{}'", letter)));
            }
            if refs.iter().any(|r| r.width() == 0 || r.height() == 0) {
                return Err(RobotErr::ConfigErr(format!("empty reference glyph for '{}'", letter)));
            }
        }
        Ok(Self { letters })
    }

    /// Loads `dir/<letter>/*` for every letter of the alphabet. Anything that
    /// is not a decodable raster image is skipped.
    pub fn load(dir: &Path, threshold: u8) -> Result<Self, RobotErr> {
        let mut letters = BTreeMap::new();
        for letter in ALPHABET.chars() {
            let letter_dir = dir.join(letter.to_string());
            let mut paths = fs::read_dir(&letter_dir)
                .map_err(|e| {
                    RobotErr::ConfigErr(format!("{}: {}", letter_dir.display(), e))
                })?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .collect::<Vec<_>>();
            paths.sort();

            let mut refs = Vec::new();
            for path in paths {
                if ImageFormat::from_path(&path).is_err() {
                    log::debug!("skipping non-image glyph file {}", path.display());
                    continue;
                }
                match image::open(&path) {
                    Ok(img) => refs.push(binarize(&img.to_luma8(), threshold)),
                    Err(err) => log::debug!("skipping glyph {}: {}", path.display(), err),
                }
            }
            letters.insert(letter, refs);
        }
        let set = Self::from_map(letters)?;
        log::info!("loaded {} reference glyphs from {}", set.len(), dir.display());
        Ok(set)
    }

    /// Every (letter, reference) pair, letters in alphabetical order and
    /// references in load order.
    pub fn iter(&self) -> impl Iterator<Item = (char, &GrayImage)> {
        self.letters
            .iter()
            .flat_map(|(letter, refs)| refs.iter().map(move |r| (*letter, r)))
    }

    pub fn len(&self) -> usize {
        self.letters.values().map(Vec::len).sum()
    }
}
