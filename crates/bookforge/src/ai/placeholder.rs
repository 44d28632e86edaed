//! Placeholder illustration provider.
//!
//! Renders a style-tinted PNG with a few rectangles derived from the
//! description, so the rest of the flow (upload, persistence, cover
//! selection) can run without a real image model behind it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Cursor;

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};

use super::{ImageGenerator, ServiceError};
use crate::book::BookStyle;

const SERVICE: &str = "image-generation";

pub struct PlaceholderImageGenerator {
    width: u32,
    height: u32,
}

impl PlaceholderImageGenerator {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn background(style: BookStyle) -> Rgb<u8> {
        match style {
            BookStyle::Cartoon => Rgb([255, 200, 200]),
            BookStyle::Realistic => Rgb([200, 200, 255]),
            BookStyle::Manga => Rgb([255, 255, 200]),
            BookStyle::Classic => Rgb([240, 240, 240]),
        }
    }

    fn draw_rect(img: &mut RgbImage, x0: u32, y0: u32, x1: u32, y1: u32, color: Rgb<u8>) {
        let thickness = 5u32;
        for x in x0..=x1.min(img.width() - 1) {
            for t in 0..thickness {
                if y0 + t < img.height() {
                    img.put_pixel(x, y0 + t, color);
                }
                if y1 >= t && y1 - t < img.height() {
                    img.put_pixel(x, y1 - t, color);
                }
            }
        }
        for y in y0..=y1.min(img.height() - 1) {
            for t in 0..thickness {
                if x0 + t < img.width() {
                    img.put_pixel(x0 + t, y, color);
                }
                if x1 >= t && x1 - t < img.width() {
                    img.put_pixel(x1 - t, y, color);
                }
            }
        }
    }
}

impl Default for PlaceholderImageGenerator {
    fn default() -> Self {
        Self::new(1024, 1024)
    }
}

#[async_trait]
impl ImageGenerator for PlaceholderImageGenerator {
    async fn generate(&self, description: &str, style: BookStyle) -> Result<Vec<u8>, ServiceError> {
        let mut img = RgbImage::from_pixel(self.width, self.height, Self::background(style));

        // Seed a tiny LCG from the description so the same prompt always
        // renders the same picture.
        let mut hasher = DefaultHasher::new();
        description.hash(&mut hasher);
        let mut seed = hasher.finish() | 1;
        let mut next = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as u32
        };

        for _ in 0..5 {
            let x0 = next() % (self.width / 2);
            let y0 = next() % (self.height / 2);
            let x1 = x0 + next() % (self.width - x0 - 1) + 1;
            let y1 = y0 + next() % (self.height - y0 - 1) + 1;
            let color = Rgb([(next() % 256) as u8, (next() % 256) as u8, (next() % 256) as u8]);
            Self::draw_rect(&mut img, x0, y0, x1.min(self.width - 1), y1.min(self.height - 1), color);
        }

        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|e| ServiceError::fatal(SERVICE, format!("PNG encoding failed: {e}")))?;
        Ok(bytes)
    }
}
