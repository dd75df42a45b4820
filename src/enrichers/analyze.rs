use anyhow::{anyhow, Result};
use async_trait::async_trait;
use image::{GenericImageView, Rgb};
use serde_json::json;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use super::preview_image;
use crate::enrichment::{Enricher, EnricherKind};
use crate::photo::{ColorInfo, Enrichment, ImageAnalysis, Photo, SourceData};

const SAMPLE_SIDE: u32 = 64;

/// Local stand-in for a vision service: colour statistics of the preview.
pub struct AnalyzeEnricher;

/// Copies the colour part of the analysis onto the photo.
pub struct ColorEnricher;

fn color_name(Rgb([r, g, b]): Rgb<u8>) -> &'static str {
    let (r, g, b) = (f32::from(r) / 255.0, f32::from(g) / 255.0, f32::from(b) / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    if max < 0.15 {
        return "Black";
    }
    if delta < 0.12 {
        return if max > 0.85 { "White" } else { "Grey" };
    }

    let hue = if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    match hue {
        h if !(15.0..345.0).contains(&h) => {
            if max < 0.5 {
                "Brown"
            } else {
                "Red"
            }
        }
        h if h < 45.0 => "Orange",
        h if h < 70.0 => "Yellow",
        h if h < 160.0 => "Green",
        h if h < 200.0 => "Teal",
        h if h < 260.0 => "Blue",
        h if h < 300.0 => "Purple",
        _ => "Pink",
    }
}

fn most_common<'a>(counts: &HashMap<&'a str, usize>) -> Option<&'a str> {
    counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(name, _)| *name)
}

/// Colour summary of an encoded image. The centre third counts as
/// foreground, the outer ring as background.
pub fn summarize_colors(bytes: &[u8]) -> Result<ColorInfo> {
    let img = image::load_from_memory(bytes)?.thumbnail(SAMPLE_SIDE, SAMPLE_SIDE);
    let (width, height) = img.dimensions();
    let rgb = img.to_rgb8();

    let mut all: HashMap<&str, usize> = HashMap::new();
    let mut center: HashMap<&str, usize> = HashMap::new();
    let mut border: HashMap<&str, usize> = HashMap::new();
    let mut chromatic = 0usize;
    let mut accent_sum = [0u64; 3];

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let name = color_name(*pixel);
        *all.entry(name).or_default() += 1;

        let in_center = x >= width / 3 && x < width * 2 / 3 && y >= height / 3 && y < height * 2 / 3;
        if in_center {
            *center.entry(name).or_default() += 1;
        } else {
            *border.entry(name).or_default() += 1;
        }

        if !matches!(name, "Black" | "White" | "Grey") {
            chromatic += 1;
            for (sum, channel) in accent_sum.iter_mut().zip(pixel.0) {
                *sum += u64::from(channel);
            }
        }
    }

    let total = (width * height).max(1) as usize;
    let mut ranked: Vec<(&str, usize)> = all.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let accent = (chromatic > 0).then(|| {
        let n = chromatic as u64;
        format!(
            "{:02X}{:02X}{:02X}",
            accent_sum[0] / n,
            accent_sum[1] / n,
            accent_sum[2] / n
        )
    });

    Ok(ColorInfo {
        accent,
        dominant_background: most_common(&border).map(str::to_string),
        dominant_foreground: most_common(&center).map(str::to_string),
        dominant_colors: ranked
            .iter()
            .take(3)
            .filter(|(_, count)| *count * 20 >= total)
            .map(|(name, _)| name.to_string())
            .collect(),
        // Fewer than 2% coloured pixels reads as monochrome.
        is_black_and_white: chromatic * 50 < total,
    })
}

#[async_trait]
impl Enricher for AnalyzeEnricher {
    fn kind(&self) -> EnricherKind {
        EnricherKind::Analyze
    }

    async fn enrich(&self, _photo: &Photo, source: &SourceData, _cancel: &CancellationToken) -> Result<Enrichment> {
        let preview = preview_image(source)?;
        let bytes = preview.bytes.clone();
        let (width, height) = (preview.width, preview.height);
        let colors = tokio::task::spawn_blocking(move || summarize_colors(&bytes)).await??;

        Ok(Enrichment {
            analysis: Some(ImageAnalysis {
                provider: "local".to_string(),
                raw: json!({
                    "width": width,
                    "height": height,
                    "color": colors,
                }),
            }),
            ..Default::default()
        })
    }
}

#[async_trait]
impl Enricher for ColorEnricher {
    fn kind(&self) -> EnricherKind {
        EnricherKind::Color
    }

    async fn enrich(&self, _photo: &Photo, source: &SourceData, _cancel: &CancellationToken) -> Result<Enrichment> {
        let analysis = source
            .analysis
            .as_ref()
            .ok_or_else(|| anyhow!("image analysis has not been produced"))?;
        let Some(color) = analysis.raw.get("color") else {
            return Ok(Enrichment::default());
        };
        Ok(Enrichment {
            colors: Some(serde_json::from_value(color.clone())?),
            ..Default::default()
        })
    }
}
