//! rendering — burn detection boxes and labels into frames
//!
//! Boxes are drawn inward from the detection rectangle; the label (class name
//! and score) sits in a filled tab right above the box, or inside its top edge
//! when the box touches the top of the frame.  Later detections paint over
//! earlier ones.

mod font;

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use tracing::warn;

use crate::detection::Detection;
use crate::video::{ChannelOrder, Frame};

pub use font::{GLYPH_HEIGHT, glyph, text_width};

/// Box colour, RGB.
pub const DEFAULT_BOX_COLOR: [u8; 3] = [255, 0, 0];
/// Label text colour, RGB.
pub const DEFAULT_TEXT_COLOR: [u8; 3] = [255, 255, 255];

#[derive(Debug, Clone)]
pub struct Annotator {
    box_color: [u8; 3],
    text_color: [u8; 3],
    line_width: Option<u32>,
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new(DEFAULT_BOX_COLOR)
    }
}

impl Annotator {
    pub fn new(box_color: [u8; 3]) -> Self {
        Self {
            box_color,
            text_color: DEFAULT_TEXT_COLOR,
            line_width: None,
        }
    }

    pub fn with_text_color(mut self, text_color: [u8; 3]) -> Self {
        self.text_color = text_color;
        self
    }

    /// Fix the line width instead of deriving it from the frame size.
    pub fn with_line_width(mut self, line_width: u32) -> Self {
        self.line_width = Some(line_width.max(1));
        self
    }

    /// Box line width for a `width × height` frame.
    pub fn line_width(&self, width: u32, height: u32) -> u32 {
        self.line_width.unwrap_or_else(|| {
            let lw = ((width + height + 3) as f32 / 2.0 * 0.003).round() as u32;
            lw.max(2)
        })
    }

    /// Integer glyph scale for a `width × height` frame.
    pub fn text_scale(&self, width: u32, height: u32) -> u32 {
        self.line_width(width, height).saturating_sub(1).max(1)
    }

    /// Size of the filled label tab for `text`.
    pub fn label_size(&self, text: &str, width: u32, height: u32) -> (u32, u32) {
        let scale = self.text_scale(width, height);
        let pad = scale;
        (
            text_width(text) * scale + 2 * pad,
            GLYPH_HEIGHT * scale + 2 * pad,
        )
    }

    /// Draw every detection onto `frame` in order.  Returns how many were
    /// drawn; boxes with no area inside the frame are skipped.
    pub fn annotate(&self, frame: &mut Frame, detections: &[Detection]) -> usize {
        if detections.is_empty() {
            return 0;
        }
        let (width, height) = (frame.width, frame.height);
        if frame.data.len() != (width * height * 3) as usize {
            warn!(
                width,
                height,
                bytes = frame.data.len(),
                "frame buffer does not match its dimensions; skipping annotation"
            );
            return 0;
        }

        // Wrap the existing buffer — no clone; we write back in-place.
        let Some(mut img) = RgbImage::from_raw(width, height, std::mem::take(&mut frame.data))
        else {
            return 0;
        };

        let box_color = in_order(self.box_color, frame.order);
        let text_color = in_order(self.text_color, frame.order);
        let lw = self.line_width(width, height) as i32;
        let scale = self.text_scale(width, height);

        let mut drawn = 0;
        for det in detections {
            let b = det.bbox.clamp_to(width, height);
            let x1 = b.x1.round() as i32;
            let y1 = b.y1.round() as i32;
            let bw = b.x2.round() as i32 - x1;
            let bh = b.y2.round() as i32 - y1;
            if bw < 1 || bh < 1 {
                continue;
            }

            for i in 0..lw {
                let (rw, rh) = (bw - 2 * i, bh - 2 * i);
                if rw < 1 || rh < 1 {
                    break;
                }
                let rect = Rect::at(x1 + i, y1 + i).of_size(rw as u32, rh as u32);
                draw_hollow_rect_mut(&mut img, rect, box_color);
            }

            let text = det.label();
            let (tab_w, tab_h) = self.label_size(&text, width, height);
            let tab_y = if y1 >= tab_h as i32 { y1 - tab_h as i32 } else { y1 };
            draw_filled_rect_mut(&mut img, Rect::at(x1, tab_y).of_size(tab_w, tab_h), box_color);
            draw_text(&mut img, &text, x1 + scale as i32, tab_y + scale as i32, scale, text_color);

            drawn += 1;
        }

        frame.data = img.into_raw();
        drawn
    }
}

fn in_order(rgb: [u8; 3], order: ChannelOrder) -> Rgb<u8> {
    match order {
        ChannelOrder::Rgb => Rgb(rgb),
        ChannelOrder::Bgr => Rgb([rgb[2], rgb[1], rgb[0]]),
    }
}

fn draw_text(img: &mut RgbImage, text: &str, x: i32, y: i32, scale: u32, color: Rgb<u8>) {
    let step = scale as i32;
    for (i, c) in text.chars().enumerate() {
        let gx = x + i as i32 * font::ADVANCE as i32 * step;
        if gx >= img.width() as i32 {
            break;
        }
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..font::GLYPH_WIDTH {
                if bits & (0x10 >> col) == 0 {
                    continue;
                }
                let px = gx + col as i32 * step;
                let py = y + row as i32 * step;
                draw_filled_rect_mut(img, Rect::at(px, py).of_size(scale, scale), color);
            }
        }
    }
}
