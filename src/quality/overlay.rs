//! Box overlays for visual review.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use crate::annotation::RegionAnnotation;

/// Outline color of drawn boxes.
pub const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Outline width in pixels.
pub const BOX_THICKNESS: u32 = 4;

/// Decodes `image_bytes`, draws every region as a red outline and returns
/// the result encoded as PNG.
pub fn render_overlay(
    image_bytes: &[u8],
    regions: &[RegionAnnotation],
) -> Result<Vec<u8>, image::ImageError> {
    let mut canvas = image::load_from_memory(image_bytes)?.to_rgb8();
    let (width, height) = canvas.dimensions();

    for region in regions {
        let pixel = region.bbox.to_pixel(width, height);
        let x0 = pixel.x.floor().max(0.0) as u32;
        let y0 = pixel.y.floor().max(0.0) as u32;
        let x1 = (pixel.x + pixel.width).ceil() as u32;
        let y1 = (pixel.y + pixel.height).ceil() as u32;
        draw_outline(&mut canvas, x0, y0, x1, y1, BOX_THICKNESS, BOX_COLOR);
    }

    let mut out = Vec::new();
    DynamicImage::ImageRgb8(canvas).write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}

/// Draws a rectangle outline growing inwards from `(x0, y0)`-`(x1, y1)`,
/// clipped to the canvas.
fn draw_outline(
    canvas: &mut RgbImage,
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
    thickness: u32,
    color: Rgb<u8>,
) {
    let (width, height) = canvas.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let x1 = x1.min(width - 1);
    let y1 = y1.min(height - 1);
    if x0 > x1 || y0 > y1 {
        return;
    }

    for y in y0..=y1 {
        for x in x0..=x1 {
            let on_edge = x < x0 + thickness
                || x + thickness > x1
                || y < y0 + thickness
                || y + thickness > y1;
            if on_edge {
                canvas.put_pixel(x, y, color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::NormalizedBox;

    fn gray_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([128, 128, 128]));
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .expect("encode png");
        out
    }

    #[test]
    fn test_overlay_draws_red_outline() {
        let region = RegionAnnotation::new(
            "dog",
            NormalizedBox::new(250.0, 250.0, 750.0, 750.0).expect("in range"),
        );
        let png = render_overlay(&gray_png(100, 100), &[region]).expect("render");
        let decoded = image::load_from_memory(&png).expect("decode").to_rgb8();

        // outline at the box edge, untouched inside and outside
        assert_eq!(*decoded.get_pixel(25, 50), BOX_COLOR);
        assert_eq!(*decoded.get_pixel(50, 25), BOX_COLOR);
        assert_eq!(*decoded.get_pixel(50, 50), Rgb([128, 128, 128]));
        assert_eq!(*decoded.get_pixel(5, 5), Rgb([128, 128, 128]));
    }

    #[test]
    fn test_full_frame_box_is_clipped() {
        let region = RegionAnnotation::new(
            "all",
            NormalizedBox::new(0.0, 0.0, 1000.0, 1000.0).expect("in range"),
        );
        let png = render_overlay(&gray_png(20, 10), &[region]).expect("render");
        let decoded = image::load_from_memory(&png).expect("decode").to_rgb8();
        assert_eq!(*decoded.get_pixel(19, 9), BOX_COLOR);
        assert_eq!(*decoded.get_pixel(10, 5), Rgb([128, 128, 128]));
    }

    #[test]
    fn test_corrupt_bytes_fail() {
        assert!(render_overlay(b"not an image", &[]).is_err());
    }
}
