//! Drawing of detections onto live frames.
//!
use std::path::Path;

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use rusttype::{Font, Scale};

use crate::nn::{Bbox, Detection};

/// Box colors, picked by class index.
const PALETTE: [[u8; 3]; 6] = [
    [0, 255, 0],
    [255, 128, 0],
    [0, 160, 255],
    [255, 0, 200],
    [255, 230, 0],
    [0, 255, 230],
];

const LABEL_HEIGHT: f32 = 16.0;

/// Load a TTF/OTF font for box labels.
pub fn load_font(path: &Path) -> Result<Font<'static>> {
    let font_data = std::fs::read(path)
        .with_context(|| format!("failed to read font {}", path.display()))?;
    Font::try_from_vec(font_data).with_context(|| format!("invalid font {}", path.display()))
}

/// Display name of a class, falling back to its index.
pub fn label_for(labels: &[String], class_id: usize) -> String {
    labels
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| format!("class {class_id}"))
}

/// Draw bounding boxes, and labels with confidences if a font is given.
pub fn draw_detections(
    frame: &mut RgbImage,
    detections: &[Detection],
    labels: &[String],
    font: Option<&Font<'_>>,
) {
    let (width, height) = frame.dimensions();

    for detection in detections {
        let rect = match clamp_to_frame(&detection.bbox, width, height) {
            Some(rect) => rect,
            None => continue,
        };
        let color = Rgb(PALETTE[detection.class_id % PALETTE.len()]);

        draw_hollow_rect_mut(frame, rect, color);

        if let Some(font) = font {
            let text = format!(
                "{} {:.0}%",
                label_for(labels, detection.class_id),
                detection.confidence * 100.0
            );
            // Above the box, or inside it at the top edge of the frame
            let y = (rect.top() - LABEL_HEIGHT as i32).max(0);
            draw_text_mut(
                frame,
                color,
                rect.left(),
                y,
                Scale::uniform(LABEL_HEIGHT),
                font,
                &text,
            );
        }
    }
}

/// Convert a box to a pixel rectangle inside the frame.
///
/// Returns `None` for non-finite boxes and boxes less than a pixel wide or
/// high after clamping.
fn clamp_to_frame(bbox: &Bbox, width: u32, height: u32) -> Option<Rect> {
    if bbox.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let x_tl = bbox[0].max(0.0);
    let y_tl = bbox[1].max(0.0);
    let x_br = bbox[2].min(width as f32 - 1.0);
    let y_br = bbox[3].min(height as f32 - 1.0);

    let (rect_width, rect_height) = (x_br - x_tl, y_br - y_tl);
    if rect_width < 1.0 || rect_height < 1.0 {
        return None;
    }

    Some(Rect::at(x_tl as i32, y_tl as i32).of_size(rect_width as u32, rect_height as u32))
}

#[cfg(test)]
mod test {
    use super::*;

    fn detection(bbox: Bbox, class_id: usize) -> Detection {
        Detection {
            bbox,
            confidence: 0.9,
            class_id,
        }
    }

    #[test]
    fn test_draw_box_outline() {
        let mut frame = RgbImage::new(40, 30);

        draw_detections(&mut frame, &[detection([5.0, 5.0, 20.0, 15.0], 0)], &[], None);

        let color = Rgb(PALETTE[0]);
        assert_eq!(*frame.get_pixel(5, 5), color);
        assert_eq!(*frame.get_pixel(10, 5), color);
        // Inside of the box stays untouched
        assert_eq!(*frame.get_pixel(10, 10), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_boxes_are_clamped_to_the_frame() {
        let rect = clamp_to_frame(&[-10.0, -5.0, 100.0, 8.0], 40, 30).unwrap();

        assert_eq!((rect.left(), rect.top()), (0, 0));
        assert_eq!((rect.width(), rect.height()), (39, 8));
    }

    #[test]
    fn test_degenerate_boxes_are_skipped() {
        assert!(clamp_to_frame(&[10.0, 10.0, 10.5, 20.0], 40, 30).is_none());
        assert!(clamp_to_frame(&[50.0, 50.0, 60.0, 60.0], 40, 30).is_none());
        assert!(clamp_to_frame(&[f32::NAN, 0.0, 10.0, 10.0], 40, 30).is_none());

        let mut frame = RgbImage::new(40, 30);
        draw_detections(&mut frame, &[detection([50.0, 50.0, 60.0, 60.0], 1)], &[], None);
        assert!(frame.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_label_fallback() {
        let labels = vec!["bottle".to_owned()];

        assert_eq!(label_for(&labels, 0), "bottle");
        assert_eq!(label_for(&labels, 3), "class 3");
    }
}
