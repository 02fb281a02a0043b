//! Pixel drawing for stream output: the capture-time overlay and the placeholder card.
//!
//! Text is rendered from the 8x8 bitmap font in `font8x8`, scaled by pixel replication and
//! clipped at the image edges.

use chrono::{DateTime, Local};
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{Rgb, RgbImage};

use crate::frame::Frame;
use crate::supervisor::ConnectionState;

pub const PLACEHOLDER_WIDTH: u32 = 640;
pub const PLACEHOLDER_HEIGHT: u32 = 480;

const GLYPH: u32 = 8;
const TEXT_GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const BAND: Rgb<u8> = Rgb([0, 0, 0]);
const PLACEHOLDER_BG: Rgb<u8> = Rgb([48, 0, 0]);
const PLACEHOLDER_ACCENT: Rgb<u8> = Rgb([220, 30, 30]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const GREY: Rgb<u8> = Rgb([180, 180, 180]);

pub fn fill_rect(image: &mut RgbImage, x: u32, y: u32, width: u32, height: u32, color: Rgb<u8>) {
    let x_end = x.saturating_add(width).min(image.width());
    let y_end = y.saturating_add(height).min(image.height());
    for py in y..y_end {
        for px in x..x_end {
            image.put_pixel(px, py, color);
        }
    }
}

pub fn text_width(text: &str, scale: u32) -> u32 {
    text.chars().count() as u32 * GLYPH * scale.max(1)
}

/// Draw `text` with its top-left corner at (x, y). Unknown characters render as `?`.
pub fn draw_text(image: &mut RgbImage, x: u32, y: u32, text: &str, scale: u32, color: Rgb<u8>) {
    let scale = scale.max(1);
    let mut cursor = x;
    for ch in text.chars() {
        if cursor >= image.width() {
            break;
        }
        let glyph = BASIC_FONTS
            .get(ch)
            .or_else(|| BASIC_FONTS.get('?'))
            .unwrap_or([0; 8]);
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH {
                if bits & (1 << col) != 0 {
                    fill_rect(
                        image,
                        cursor + col * scale,
                        y + row as u32 * scale,
                        scale,
                        scale,
                        color,
                    );
                }
            }
        }
        cursor += GLYPH * scale;
    }
}

fn draw_centered(image: &mut RgbImage, y: u32, text: &str, scale: u32, color: Rgb<u8>) {
    let width = text_width(text, scale);
    let x = image.width().saturating_sub(width) / 2;
    draw_text(image, x, y, text, scale, color);
}

/// Copy the frame into an image and burn its capture time into the top-left corner.
pub fn annotate_frame(frame: &Frame) -> Option<RgbImage> {
    let mut image = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())?;
    let scale = (frame.width / 320).max(1);
    let label = frame
        .captured_wall
        .format("%Y-%m-%d %H:%M:%S%.3f")
        .to_string();
    let pad = 2 * scale;
    fill_rect(
        &mut image,
        0,
        0,
        text_width(&label, scale) + 2 * pad,
        GLYPH * scale + 2 * pad,
        BAND,
    );
    draw_text(&mut image, pad, pad, &label, scale, TEXT_GREEN);
    Some(image)
}

/// The "connection lost" card shown to stream consumers while the camera is unavailable.
pub fn placeholder(state: ConnectionState, now: DateTime<Local>) -> RgbImage {
    let mut image = RgbImage::from_pixel(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT, PLACEHOLDER_BG);

    let border = 32;
    fill_rect(&mut image, 0, 0, PLACEHOLDER_WIDTH, border, PLACEHOLDER_ACCENT);
    fill_rect(
        &mut image,
        0,
        PLACEHOLDER_HEIGHT - border,
        PLACEHOLDER_WIDTH,
        border,
        PLACEHOLDER_ACCENT,
    );

    draw_centered(&mut image, 150, "CAMERA CONNECTION LOST", 3, WHITE);
    let state_line = format!("STATE: {}", state.as_str().to_uppercase());
    draw_centered(&mut image, 215, &state_line, 2, GREY);
    draw_centered(&mut image, 255, "TRYING TO RECONNECT...", 2, GREY);
    let time_line = now.format("%Y-%m-%d %H:%M:%S").to_string();
    draw_centered(&mut image, 320, &time_line, 2, PLACEHOLDER_ACCENT);
    image
}

/// True if `image` looks like the placeholder card (accent band over dark red).
pub fn is_placeholder(image: &RgbImage) -> bool {
    if image.width() != PLACEHOLDER_WIDTH || image.height() != PLACEHOLDER_HEIGHT {
        return false;
    }
    let near = |pixel: &Rgb<u8>, target: Rgb<u8>| {
        pixel
            .0
            .iter()
            .zip(target.0.iter())
            .all(|(a, b)| a.abs_diff(*b) <= 40)
    };
    near(image.get_pixel(8, 8), PLACEHOLDER_ACCENT) && near(image.get_pixel(8, 64), PLACEHOLDER_BG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CapturedImage;

    #[test]
    fn text_is_drawn_and_clipped() {
        let mut image = RgbImage::from_pixel(20, 10, Rgb([0, 0, 0]));
        draw_text(&mut image, 0, 0, "HELLO", 1, WHITE);
        let lit = image.pixels().filter(|p| p.0 == [255, 255, 255]).count();
        assert!(lit > 0);
        draw_text(&mut image, 100, 100, "offscreen", 2, WHITE);
    }

    #[test]
    fn annotation_writes_band_without_resizing() {
        let frame = Frame::new(CapturedImage::new(vec![200; 640 * 480 * 3], 640, 480), 1);
        let image = annotate_frame(&frame).unwrap();
        assert_eq!(image.dimensions(), (640, 480));
        let greens = image
            .pixels()
            .take(640 * 24)
            .filter(|p| p.0 == [0, 255, 0])
            .count();
        assert!(greens > 0);
        assert_eq!(image.get_pixel(639, 479).0, [200, 200, 200]);
    }

    #[test]
    fn placeholder_is_recognizable() {
        let card = placeholder(ConnectionState::Reconnecting, Local::now());
        assert!(is_placeholder(&card));
        let plain = RgbImage::from_pixel(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT, Rgb([90, 90, 90]));
        assert!(!is_placeholder(&plain));
    }
}
