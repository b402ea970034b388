use super::glyphs::GlyphSet;
use super::RobotErr;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};

pub const THRESHOLD: u8 = 10;
pub const MIN_WIDTH: u32 = 15;
pub const MATCH_WEIGHT: f32 = 5.0;
pub const FOREGROUND: u8 = 0;
pub const BACKGROUND: u8 = 255;

/// One candidate character: the columns `[start, end)` of the mask, full height.
#[derive(Debug, Clone)]
pub struct Segment {
    pub start: u32,
    pub end: u32,
    pub image: GrayImage,
}

impl Segment {
    pub fn width(&self) -> u32 {
        self.end - self.start
    }
}

pub fn decode(bytes: &[u8]) -> Result<GrayImage, RobotErr> {
    Ok(image::load_from_memory(bytes)?.to_luma8())
}

/// Decodes a challenge image and returns the guessed text.
pub fn solve(
    bytes: &[u8],
    glyphs: &GlyphSet,
    threshold: u8,
    min_width: u32,
) -> Result<String, RobotErr> {
    let mask = binarize(&decode(bytes)?, threshold);
    let letters = segment(&mask, min_width)
        .iter()
        .map(|s| best_letter(&s.image, glyphs).map(|(letter, _)| letter))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| RobotErr::ConfigErr("glyph set is empty".to_owned()))?;
    Ok(assemble(&letters))
}

pub fn binarize(src: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(src.width(), src.height(), |x, y| {
        if src.get_pixel(x, y)[0] < threshold {
            Luma([FOREGROUND])
        } else {
            Luma([BACKGROUND])
        }
    })
}

fn column_has_ink(mask: &GrayImage, x: u32) -> bool {
    (0..mask.height()).any(|y| mask.get_pixel(x, y)[0] == FOREGROUND)
}

/// Splits the mask on ink-free columns, left to right. Runs narrower than
/// `min_width` are noise and are dropped.
pub fn segment(mask: &GrayImage, min_width: u32) -> Vec<Segment> {
    let mut spans = Vec::new();
    let mut start = None;
    for x in 0..mask.width() {
        match (start, column_has_ink(mask, x)) {
            (None, true) => start = Some(x),
            (Some(s), false) => {
                spans.push((s, x));
                start = None;
            }
            _ => {}
        }
    }
    // run touching the right edge
    if let Some(s) = start {
        spans.push((s, mask.width()));
    }

    spans
        .into_iter()
        .map(|(s, e)| Segment {
            start: s,
            end: e,
            image: imageops::crop_imm(mask, s, 0, e - s, mask.height()).to_image(),
        })
        .filter(|seg| seg.width() >= min_width)
        .collect()
}

fn resize_to(img: &GrayImage, width: u32, height: u32) -> GrayImage {
    if img.dimensions() == (width, height) {
        return img.clone();
    }
    imageops::resize(img, width, height, FilterType::Nearest)
}

/// Weighted count of positions where both images carry ink, over the pixel
/// count. Both images must have the same dimensions.
pub fn similarity(candidate: &GrayImage, reference: &GrayImage) -> f32 {
    let hits = candidate
        .pixels()
        .zip(reference.pixels())
        .filter(|(c, r)| c[0] == FOREGROUND && r[0] == FOREGROUND)
        .count();
    MATCH_WEIGHT * hits as f32 / (reference.width() * reference.height()) as f32
}

/// Best scoring letter for one segment. The first strictly greater score
/// wins, so ties go to the earlier letter, then the earlier reference.
/// `None` only for a glyph set without references.
pub fn best_letter(segment: &GrayImage, glyphs: &GlyphSet) -> Option<(char, f32)> {
    let mut best: Option<(char, f32)> = None;
    for (letter, reference) in glyphs.iter() {
        let resized = resize_to(segment, reference.width(), reference.height());
        let score = similarity(&resized, reference);
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((letter, score)),
        }
    }
    best
}

pub fn assemble(letters: &[char]) -> String {
    letters.iter().collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Cursor;

    pub(crate) const GLYPH_W: u32 = 6;
    pub(crate) const GLYPH_H: u32 = 8;

    // Every glyph inks both outer columns; the interior bar tells them apart.
    pub(crate) fn glyph(letter: char) -> GrayImage {
        let bar = match letter {
            'a' => 0,
            'b' => GLYPH_H / 2,
            _ => GLYPH_H - 1,
        };
        GrayImage::from_fn(GLYPH_W, GLYPH_H, |x, y| {
            if x == 0 || x == GLYPH_W - 1 || y == bar {
                Luma([FOREGROUND])
            } else {
                Luma([BACKGROUND])
            }
        })
    }

    pub(crate) fn glyph_set() -> GlyphSet {
        let map = ['a', 'b', 'c']
            .iter()
            .map(|&l| (l, vec![glyph(l)]))
            .collect::<BTreeMap<_, _>>();
        GlyphSet::from_map(map).unwrap()
    }

    /// Renders `text` from the test glyphs onto a light gray background, PNG encoded.
    pub(crate) fn render(text: &str) -> Vec<u8> {
        let gap = 4;
        let width = gap + text.len() as u32 * (GLYPH_W + gap);
        let mut img = GrayImage::from_pixel(width, GLYPH_H, Luma([200]));
        for (i, letter) in text.chars().enumerate() {
            let g = glyph(letter);
            let left = gap + i as u32 * (GLYPH_W + gap);
            for (x, y, p) in g.enumerate_pixels() {
                if p[0] == FOREGROUND {
                    img.put_pixel(left + x, y, Luma([3]));
                }
            }
        }
        let mut bytes = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
            .unwrap();
        bytes
    }

    fn mask_with_columns(width: u32, runs: &[(u32, u32)]) -> GrayImage {
        GrayImage::from_fn(width, 4, |x, y| {
            let ink = runs.iter().any(|&(s, e)| x >= s && x < e) && y == x % 4;
            Luma([if ink { FOREGROUND } else { BACKGROUND }])
        })
    }

    #[test]
    fn binarize_is_strictly_below_threshold() {
        let src = GrayImage::from_fn(3, 2, |x, y| Luma([(x * 5 + y * 3) as u8 + 4]));
        let out = binarize(&src, 10);
        assert_eq!(out.dimensions(), src.dimensions());
        for (x, y, p) in out.enumerate_pixels() {
            let expected = if src.get_pixel(x, y)[0] < 10 { FOREGROUND } else { BACKGROUND };
            assert_eq!(p[0], expected, "pixel {},{}", x, y);
        }
    }

    #[test]
    fn segment_drops_narrow_runs() {
        let mask = mask_with_columns(25, &[(2, 5), (10, 13), (20, 22)]);
        let spans: Vec<_> = segment(&mask, 3).iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(spans, vec![(2, 5), (10, 13)]);
    }

    #[test]
    fn segment_closes_run_at_right_edge() {
        let mask = mask_with_columns(12, &[(1, 4), (8, 12)]);
        let segs = segment(&mask, 1);
        assert_eq!(segs.len(), 2);
        assert_eq!((segs[1].start, segs[1].end), (8, 12));
        assert_eq!(segs[1].image.dimensions(), (4, 4));
    }

    #[test]
    fn segment_of_blank_mask_is_empty() {
        let mask = GrayImage::from_pixel(30, 10, Luma([BACKGROUND]));
        assert!(segment(&mask, 1).is_empty());
    }

    #[test]
    fn best_letter_finds_identical_glyph() {
        let (letter, score) = best_letter(&glyph('a'), &glyph_set()).unwrap();
        assert_eq!(letter, 'a');
        let ink = glyph('a').pixels().filter(|p| p[0] == FOREGROUND).count();
        let max = MATCH_WEIGHT * ink as f32 / (GLYPH_W * GLYPH_H) as f32;
        assert!((score - max).abs() < 1e-6);
    }

    #[test]
    fn best_letter_resizes_to_reference() {
        let big = imageops::resize(&glyph('c'), GLYPH_W * 3, GLYPH_H * 3, FilterType::Nearest);
        assert_eq!(best_letter(&big, &glyph_set()).unwrap().0, 'c');
    }

    #[test]
    fn ties_go_to_first_letter() {
        let blank = GrayImage::from_pixel(GLYPH_W, GLYPH_H, Luma([BACKGROUND]));
        assert_eq!(best_letter(&blank, &glyph_set()), Some(('a', 0.0)));
    }

    #[test]
    fn assemble_concatenates_in_order() {
        assert_eq!(assemble(&['c', 'a', 't']), "cat");
        assert_eq!(assemble(&[]), "");
    }

    #[test]
    fn solve_round_trip() {
        let glyphs = glyph_set();
        assert_eq!(solve(&render("cab"), &glyphs, THRESHOLD, 3).unwrap(), "cab");
        assert_eq!(solve(&render("abc"), &glyphs, THRESHOLD, 3).unwrap(), "abc");
    }

    #[test]
    fn solve_rejects_garbage() {
        assert!(matches!(
            solve(b"<html>nope</html>", &glyph_set(), THRESHOLD, 3),
            Err(RobotErr::DecodeErr(_))
        ));
        let mut truncated = render("abc");
        truncated.truncate(40);
        assert!(solve(&truncated, &glyph_set(), THRESHOLD, 3).is_err());
    }
}
