//! Minimal drawing primitives for annotated snapshots.
//!
//! Rectangles go through `imageproc`; text uses a built-in 5x7 bitmap font so
//! no font file has to ship with the daemon.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
pub const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;

const PALETTE: [Rgb<u8>; 6] = [
    Rgb([255, 64, 64]),
    Rgb([64, 224, 64]),
    Rgb([64, 128, 255]),
    Rgb([255, 192, 0]),
    Rgb([224, 64, 224]),
    Rgb([0, 208, 208]),
];

/// Stable color for a label.
pub fn label_color(label: &str) -> Rgb<u8> {
    let sum: usize = label.bytes().map(usize::from).sum();
    PALETTE[sum % PALETTE.len()]
}

/// Outline from `(left, top)` to `(right, bottom)` inclusive, `thickness` px
/// growing inwards. Edges far outside the canvas are pulled in to just past
/// its border, which keeps the arithmetic in range without moving any
/// visible pixel.
pub fn draw_rect(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
    thickness: i32,
) {
    let thickness = thickness.clamp(0, 64);
    let clamp_x = |v: i32| clamp_to_canvas(v, image.width(), thickness);
    let clamp_y = |v: i32| clamp_to_canvas(v, image.height(), thickness);
    let (left, right) = (clamp_x(left), clamp_x(right));
    let (top, bottom) = (clamp_y(top), clamp_y(bottom));
    for inset in 0..thickness {
        let width = right - left - 2 * inset + 1;
        let height = bottom - top - 2 * inset + 1;
        if width <= 0 || height <= 0 {
            break;
        }
        let rect = Rect::at(left + inset, top + inset).of_size(width as u32, height as u32);
        draw_hollow_rect_mut(image, rect, color);
    }
}

fn clamp_to_canvas(v: i32, extent: u32, margin: i32) -> i32 {
    let extent = i32::try_from(extent).unwrap_or(i32::MAX - 128);
    v.clamp(-margin - 1, extent.saturating_add(margin))
}

/// Box plus a filled caption strip sitting on top of it. The strip is kept
/// on the canvas even when the box itself is not.
pub fn draw_box_with_label(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    text: &str,
    color: Rgb<u8>,
) {
    draw_rect(image, left, top, right, bottom, color, 2);

    let max_x = i32::try_from(image.width()).unwrap_or(i32::MAX).saturating_sub(1).max(0);
    let max_y = i32::try_from(image.height()).unwrap_or(i32::MAX).saturating_sub(1).max(0);
    let strip_left = left.clamp(0, max_x);
    let strip_top = top.saturating_sub(GLYPH_HEIGHT + 4).clamp(0, max_y);
    let text_width = text_width(text, 1);
    let rect = Rect::at(strip_left, strip_top)
        .of_size(text_width.saturating_add(4) as u32, (GLYPH_HEIGHT + 4) as u32);
    draw_filled_rect_mut(image, rect, color);
    draw_text(image, strip_left + 2, strip_top + 2, text, BLACK, 1);
}

/// Width in pixels of `text` rendered at `scale`.
pub fn text_width(text: &str, scale: i32) -> i32 {
    let chars = i32::try_from(text.chars().count()).unwrap_or(i32::MAX);
    chars
        .saturating_mul(GLYPH_ADVANCE)
        .saturating_sub(1)
        .max(1)
        .saturating_mul(scale.max(1))
}

/// Render `text` with its top-left corner at `(x, y)`. Lowercase letters are
/// drawn as capitals; characters without a glyph leave a blank cell.
pub fn draw_text(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>, scale: i32) {
    let scale = i64::from(scale.clamp(1, 64));
    let (width, height) = (i64::from(image.width()), i64::from(image.height()));
    let (mut cursor, y) = (i64::from(x), i64::from(y));
    for ch in text.chars().flat_map(char::to_uppercase) {
        if cursor >= width {
            break;
        }
        if let Some(rows) = glyph(ch) {
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (bits >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            let px = cursor + i64::from(col) * scale + dx;
                            let py = y + row as i64 * scale + dy;
                            if px >= 0 && py >= 0 && px < width && py < height {
                                image.put_pixel(px as u32, py as u32, color);
                            }
                        }
                    }
                }
            }
        }
        cursor += i64::from(GLYPH_ADVANCE) * scale;
    }
}

fn glyph(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        '/' => [0b00001, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b10000],
        '.' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b01100],
        '%' => [0b11000, 0b11001, 0b00010, 0b00100, 0b01000, 0b10011, 0b00011],
        '-' => [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000],
        '_' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b11111],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}
