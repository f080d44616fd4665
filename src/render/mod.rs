//! Annotated snapshot rendering.
//!
//! Rendering only happens when a caller asks for the current frame. The
//! encoded JPEG is cached by the frame timestamp it was rendered from, so
//! repeated requests between two captured frames cost one lock and a clone of
//! an `Arc`.

mod draw;

pub use draw::{draw_box_with_label, draw_rect, draw_text, label_color, text_width, BLACK, WHITE};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::detect::{DetectedObject, DetectedObjects, Region};
use crate::frame::{Frame, PixelOrder, SharedFrameBuffer};

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

const TIMESTAMP_FORMAT: &str = "%m/%d/%Y %H:%M:%S";
const TIMESTAMP_SCALE: i32 = 2;
const REGION_THICKNESS: i32 = 2;

struct CachedRender {
    timestamp: f64,
    jpeg: Arc<Vec<u8>>,
}

/// Most recent rendered snapshot for one camera.
pub struct RenderCache {
    pixel_order: PixelOrder,
    quality: u8,
    cached: Mutex<Option<CachedRender>>,
    renders: AtomicU64,
}

impl RenderCache {
    pub fn new(pixel_order: PixelOrder, quality: u8) -> Self {
        Self {
            pixel_order,
            quality: quality.clamp(1, 100),
            cached: Mutex::new(None),
            renders: AtomicU64::new(0),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Number of times a frame was actually drawn and encoded.
    pub fn renders(&self) -> u64 {
        self.renders.load(Ordering::Relaxed)
    }

    /// JPEG of the current frame with objects, regions and a timestamp drawn
    /// on it. Returns the cached bytes when no new frame arrived since the
    /// last render.
    pub fn current_frame_with_objects(
        &self,
        buffer: &SharedFrameBuffer,
        objects: &DetectedObjects,
        regions: &[Region],
    ) -> Result<Arc<Vec<u8>>> {
        let detected = objects.snapshot();
        let frame = buffer.read_copy();
        let timestamp = frame.timestamp;

        let mut cached = self.lock();
        if let Some(entry) = cached.as_ref() {
            if entry.timestamp == timestamp {
                return Ok(Arc::clone(&entry.jpeg));
            }
        }

        let jpeg = Arc::new(render_jpeg(
            frame,
            self.pixel_order,
            &detected,
            regions,
            self.quality,
        )?);
        self.renders.fetch_add(1, Ordering::Relaxed);
        *cached = Some(CachedRender {
            timestamp,
            jpeg: Arc::clone(&jpeg),
        });
        Ok(jpeg)
    }

    fn lock(&self) -> MutexGuard<'_, Option<CachedRender>> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Draw annotations on `frame` and encode it as JPEG.
pub fn render_jpeg(
    frame: Frame,
    pixel_order: PixelOrder,
    objects: &[DetectedObject],
    regions: &[Region],
    quality: u8,
) -> Result<Vec<u8>> {
    let image = annotate(frame, pixel_order, objects, regions)?;
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
        .encode_image(&image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(jpeg)
}

/// Convert `frame` to RGB and draw every annotation on it.
pub fn annotate(
    frame: Frame,
    pixel_order: PixelOrder,
    objects: &[DetectedObject],
    regions: &[Region],
) -> Result<RgbImage> {
    let Frame {
        mut data,
        shape,
        timestamp,
    } = frame;
    if pixel_order == PixelOrder::Bgr {
        for pixel in data.chunks_exact_mut(3) {
            pixel.swap(0, 2);
        }
    }
    let mut image = RgbImage::from_raw(shape.width, shape.height, data)
        .ok_or_else(|| anyhow!("raster does not match {}x{}", shape.width, shape.height))?;

    for object in objects {
        let text = format!(
            "{} {:.0}% {}",
            object.label,
            object.score * 100.0,
            object.area
        );
        draw_box_with_label(
            &mut image,
            object.bbox.xmin,
            object.bbox.ymin,
            object.bbox.xmax,
            object.bbox.ymax,
            &text,
            label_color(&object.label),
        );
    }

    // Outlines run from the offset to offset + size inclusive.
    for region in regions {
        let to_i32 = |v: u32| i32::try_from(v).unwrap_or(i32::MAX);
        let left = to_i32(region.x_offset);
        let top = to_i32(region.y_offset);
        let right = left.saturating_add(to_i32(region.size));
        let bottom = top.saturating_add(to_i32(region.size));
        draw_rect(&mut image, left, top, right, bottom, WHITE, REGION_THICKNESS);
    }

    draw_text(
        &mut image,
        10,
        10,
        &format_timestamp(timestamp),
        WHITE,
        TIMESTAMP_SCALE,
    );
    Ok(image)
}

/// Local wall-clock time for an epoch timestamp, e.g. `03/14/2024 09:26:53`.
pub fn format_timestamp(timestamp: f64) -> String {
    let secs = timestamp.floor();
    let nanos = ((timestamp - secs) * 1e9) as u32;
    match DateTime::from_timestamp(secs as i64, nanos) {
        Some(utc) => utc.with_timezone(&Local).format(TIMESTAMP_FORMAT).to_string(),
        None => String::new(),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, ObjectRules};
    use crate::frame::FrameShape;

    fn object(label: &str, bbox: BoundingBox) -> DetectedObject {
        DetectedObject {
            label: label.to_string(),
            score: 0.9,
            region_id: 0,
            area: bbox.area(),
            bbox,
        }
    }

    fn buffer_with(shape: FrameShape, value: u8, timestamp: f64) -> Result<SharedFrameBuffer> {
        let buffer = SharedFrameBuffer::new(shape);
        buffer.write(&vec![value; shape.frame_size()], timestamp)?;
        Ok(buffer)
    }

    #[test]
    fn cache_hit_returns_identical_bytes() -> Result<()> {
        let shape = FrameShape::new(64, 48)?;
        let buffer = buffer_with(shape, 40, 1_700_000_000.5)?;
        let objects = DetectedObjects::new();
        objects.append(vec![object(
            "person",
            BoundingBox {
                xmin: 5,
                ymin: 20,
                xmax: 30,
                ymax: 40,
            },
        )]);
        let regions = vec![Region::new(32, 0, 0, ObjectRules::new())?];
        let cache = RenderCache::new(PixelOrder::Rgb, DEFAULT_JPEG_QUALITY);

        let first = cache.current_frame_with_objects(&buffer, &objects, &regions)?;
        let second = cache.current_frame_with_objects(&buffer, &objects, &regions)?;
        assert_eq!(first, second);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.renders(), 1);
        assert_eq!(&first[..2], &[0xFF, 0xD8]);
        Ok(())
    }

    #[test]
    fn new_frame_invalidates_cache() -> Result<()> {
        let shape = FrameShape::new(32, 32)?;
        let buffer = buffer_with(shape, 10, 100.0)?;
        let objects = DetectedObjects::new();
        let cache = RenderCache::new(PixelOrder::Rgb, DEFAULT_JPEG_QUALITY);

        cache.current_frame_with_objects(&buffer, &objects, &[])?;
        buffer.write(&vec![200; shape.frame_size()], 101.0)?;
        cache.current_frame_with_objects(&buffer, &objects, &[])?;
        assert_eq!(cache.renders(), 2);
        Ok(())
    }

    #[test]
    fn annotate_draws_regions_and_swaps_bgr() -> Result<()> {
        let shape = FrameShape::new(40, 40)?;
        let mut data = vec![0u8; shape.frame_size()];
        for pixel in data.chunks_exact_mut(3) {
            pixel.copy_from_slice(&[0, 0, 255]);
        }
        let frame = Frame {
            data,
            shape,
            timestamp: 0.0,
        };
        let regions = vec![Region::new(10, 25, 25, ObjectRules::new())?];

        let image = annotate(frame, PixelOrder::Bgr, &[], &regions)?;
        assert_eq!(image.get_pixel(39, 0).0, [255, 0, 0]);
        assert_eq!(image.get_pixel(25, 25).0, [255, 255, 255]);
        assert_eq!(image.get_pixel(34, 34).0, [255, 255, 255]);
        assert_eq!(image.get_pixel(35, 35).0, [255, 255, 255]);
        assert_eq!(image.get_pixel(35, 25).0, [255, 255, 255]);
        assert_eq!(image.get_pixel(36, 36).0, [255, 0, 0]);
        assert_eq!(image.get_pixel(30, 30).0, [255, 0, 0]);
        Ok(())
    }

    #[test]
    fn timestamp_has_fixed_layout() {
        let text = format_timestamp(1_700_000_000.25);
        assert_eq!(text.len(), "01/01/2024 00:00:00".len());
        assert_eq!(&text[2..3], "/");
        assert_eq!(&text[13..14], ":");
    }
}
