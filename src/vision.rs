//! The vision engine: owned template and trigger tables plus the per-frame
//! orchestrator that fills the shared result slots.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use image::DynamicImage;
use thiserror::Error;

use crate::detector::{self, Band, ColorBlob, EdgeScan, ObjectBounds};
use crate::shm::{Header, MAX_FRAME_HEIGHT, MAX_FRAME_WIDTH, MAX_RESULTS};
use crate::types::{Hsv, Point2, Rect, Template, Trigger, TriggerKind, VisionResult};

/// Templates the engine will hold at most; the table is append-only and
/// indices stay stable for the life of the engine.
pub const MAX_TEMPLATES: usize = 32;

/// Triggers the engine will hold at most; append-only like the templates.
pub const MAX_TRIGGERS: usize = 64;

/// HSV tolerance applied to color triggers.
const COLOR_TRIGGER_TOLERANCE: i32 = 15;

/// Pixels a color trigger must exceed before it counts as found.
const COLOR_TRIGGER_MIN_PIXELS: u32 = 100;

/// Cap on pixels accumulated per color scan.
const COLOR_SCAN_CAP: u32 = 10_000;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("no frame ready in the shared header")]
    StaleFrame,

    #[error("template table full ({MAX_TEMPLATES} loaded)")]
    TemplateTableFull,

    #[error("trigger table full ({MAX_TRIGGERS} added)")]
    TriggerTableFull,

    #[error("trigger references unknown template index {0}")]
    UnknownTemplate(usize),

    #[error("unknown trigger index {0}")]
    UnknownTrigger(usize),

    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: i32, height: i32 },

    #[error("frame stride {stride} does not match width {width}")]
    BadStride { stride: i32, width: i32 },

    #[error("frame buffer holds {actual} bytes, need {needed}")]
    FrameTooSmall { needed: usize, actual: usize },

    #[error("invalid template: {0}")]
    InvalidTemplate(&'static str),

    #[error("max_matches must be positive")]
    ZeroMatchCap,
}

impl Template {
    /// Build a template from raw RGBA pixels, deep-copying them. The pixel
    /// slice must be exactly `width * height * 4` bytes and the threshold
    /// inside 0.0..=1.0.
    pub fn from_rgba(
        id: u32,
        name: impl Into<String>,
        width: i32,
        height: i32,
        pixels: &[u8],
        threshold: f32,
        search_region: Rect,
    ) -> Result<Template, VisionError> {
        if width <= 0 || height <= 0 {
            return Err(VisionError::InvalidTemplate("non-positive dimensions"));
        }
        if pixels.len() != (width * height * 4) as usize {
            return Err(VisionError::InvalidTemplate("pixel data does not match dimensions"));
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(VisionError::InvalidTemplate("threshold outside 0.0..=1.0"));
        }
        Ok(Template {
            id,
            name: name.into(),
            width,
            height,
            threshold,
            search_region,
            pixels: pixels.to_vec(),
        })
    }

    /// Build a template from a decoded image. Decoding from disk stays with
    /// the caller; this is the seam where decoded images enter the engine.
    pub fn from_image(
        id: u32,
        name: impl Into<String>,
        image: &DynamicImage,
        threshold: f32,
        search_region: Rect,
    ) -> Result<Template, VisionError> {
        let rgba = image.to_rgba8();
        Template::from_rgba(
            id,
            name,
            rgba.width() as i32,
            rgba.height() as i32,
            rgba.as_raw(),
            threshold,
            search_region,
        )
    }
}

/// Wall-clock nanoseconds, for the result timestamps the producer compares
/// against its own frame stamps.
fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

fn check_frame(frame: &[u8], width: i32, height: i32) -> Result<(), VisionError> {
    if width <= 0 || height <= 0 || width > MAX_FRAME_WIDTH || height > MAX_FRAME_HEIGHT {
        return Err(VisionError::InvalidDimensions { width, height });
    }
    let needed = (width * height * 4) as usize;
    if frame.len() < needed {
        return Err(VisionError::FrameTooSmall { needed, actual: frame.len() });
    }
    Ok(())
}

/// The vision engine. Created once at startup and passed explicitly;
/// template pixel buffers live here until the engine drops.
#[derive(Default)]
pub struct VisionEngine {
    templates: Vec<Template>,
    triggers: Vec<Trigger>,
}

impl VisionEngine {
    pub fn new() -> Self {
        Self {
            templates: Vec::with_capacity(MAX_TEMPLATES),
            triggers: Vec::with_capacity(MAX_TRIGGERS),
        }
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.len()
    }

    pub fn template(&self, index: usize) -> Option<&Template> {
        self.templates.get(index)
    }

    pub fn trigger(&self, index: usize) -> Option<&Trigger> {
        self.triggers.get(index)
    }

    /// Append a template and return its stable index.
    pub fn load_template(&mut self, template: Template) -> Result<usize, VisionError> {
        if self.templates.len() >= MAX_TEMPLATES {
            return Err(VisionError::TemplateTableFull);
        }
        tracing::debug!(
            "loaded template {} ({}, {}x{}, threshold {:.2})",
            template.id,
            template.name,
            template.width,
            template.height,
            template.threshold,
        );
        self.templates.push(template);
        Ok(self.templates.len() - 1)
    }

    /// Append a trigger and return its stable index. Template references
    /// are validated here, not at detection time.
    pub fn add_trigger(&mut self, trigger: Trigger) -> Result<usize, VisionError> {
        if self.triggers.len() >= MAX_TRIGGERS {
            return Err(VisionError::TriggerTableFull);
        }
        if let TriggerKind::Template { index } = trigger.kind
            && index >= self.templates.len()
        {
            return Err(VisionError::UnknownTemplate(index));
        }
        tracing::debug!("added trigger {} ({})", trigger.id, trigger.name);
        self.triggers.push(trigger);
        Ok(self.triggers.len() - 1)
    }

    pub fn set_trigger_active(&mut self, index: usize, active: bool) -> Result<(), VisionError> {
        let trigger = self
            .triggers
            .get_mut(index)
            .ok_or(VisionError::UnknownTrigger(index))?;
        trigger.active = active;
        Ok(())
    }

    /// Run every active trigger against the frame currently published in
    /// the region, writing up to [`MAX_RESULTS`] slots, `num_results` and
    /// the vision latency. Results are in trigger insertion order; every
    /// populated slot carries the same detection start stamp. The header
    /// is left for the brain to finish (`result_ready` stays down).
    ///
    /// Fails without touching any result when no frame is ready or the
    /// frame metadata is unusable.
    pub fn process_frame(&self, header: &mut Header, frame: &[u8]) -> Result<(), VisionError> {
        if !header.frame_ready() {
            return Err(VisionError::StaleFrame);
        }
        let (width, height) = (header.frame_width, header.frame_height);
        check_frame(frame, width, height)?;
        if header.frame_stride != width * 4 {
            return Err(VisionError::BadStride { stride: header.frame_stride, width });
        }

        let started = Instant::now();
        let stamp = now_ns();
        let mut count = 0usize;

        for trigger in &self.triggers {
            if count >= MAX_RESULTS {
                break;
            }
            if !trigger.active {
                continue;
            }

            let mut result = VisionResult { trigger_id: trigger.id, ..VisionResult::default() };

            match trigger.kind {
                TriggerKind::Template { index } => {
                    if let Some(template) = self.templates.get(index) {
                        result = template_result(frame, width, height, template);
                        result.trigger_id = trigger.id;
                    }
                }
                TriggerKind::Color { target } => {
                    let blob = detector::scan_color_region(
                        frame,
                        width,
                        height,
                        trigger.region,
                        target,
                        COLOR_TRIGGER_TOLERANCE,
                        COLOR_SCAN_CAP,
                    );
                    result.found = blob.count > COLOR_TRIGGER_MIN_PIXELS;
                    result.location = blob.centroid;
                    result.confidence = if blob.count > 0 { 1.0 } else { 0.0 };
                }
                TriggerKind::Edge { horizontal, .. } => {
                    let scan =
                        detector::locate_edge(frame, width, height, trigger.region, horizontal);
                    let mid = trigger
                        .region
                        .clip_to(width, height)
                        .map(|r| r.center())
                        .unwrap_or_default();
                    result.found = scan.is_edge();
                    result.location = if horizontal {
                        Point2::new(mid.x, scan.position)
                    } else {
                        Point2::new(scan.position, mid.y)
                    };
                    result.confidence = if result.found { 1.0 } else { 0.0 };
                }
            }

            result.timestamp_ns = stamp;
            header.results[count] = result;
            count += 1;
        }

        header.num_results = count as u32;
        header.vision_latency_ns = started.elapsed().as_nanos() as i64;
        Ok(())
    }
}

fn template_result(frame: &[u8], width: i32, height: i32, template: &Template) -> VisionResult {
    let hit = detector::search_template(
        frame,
        width,
        height,
        template.search_region,
        &template.pixels,
        template.width,
        template.height,
    );
    VisionResult {
        trigger_id: template.id,
        found: hit.score >= template.threshold,
        confidence: hit.score.clamp(0.0, 1.0),
        location: Point2::new(hit.x + template.width / 2, hit.y + template.height / 2),
        bounding_box: Rect::new(hit.x, hit.y, template.width, template.height),
        timestamp_ns: now_ns(),
    }
}

/// One-shot template search over a raw frame, without an engine.
pub fn find_template(
    frame: &[u8],
    width: i32,
    height: i32,
    template: &Template,
) -> Result<VisionResult, VisionError> {
    check_frame(frame, width, height)?;
    Ok(template_result(frame, width, height, template))
}

/// One-shot color-blob scan over a raw frame.
pub fn find_color_region(
    frame: &[u8],
    width: i32,
    height: i32,
    region: Rect,
    color: Hsv,
    tolerance: i32,
    max_matches: u32,
) -> Result<ColorBlob, VisionError> {
    check_frame(frame, width, height)?;
    if max_matches == 0 {
        return Err(VisionError::ZeroMatchCap);
    }
    Ok(detector::scan_color_region(frame, width, height, region, color, tolerance, max_matches))
}

/// One-shot edge scan over a raw frame.
pub fn detect_edge(
    frame: &[u8],
    width: i32,
    height: i32,
    region: Rect,
    horizontal: bool,
) -> Result<EdgeScan, VisionError> {
    check_frame(frame, width, height)?;
    Ok(detector::locate_edge(frame, width, height, region, horizontal))
}

/// One-shot HSV-range object scan over a raw frame.
pub fn find_color_object(
    frame: &[u8],
    width: i32,
    height: i32,
    region: Rect,
    low: Hsv,
    high: Hsv,
) -> Result<Option<ObjectBounds>, VisionError> {
    check_frame(frame, width, height)?;
    Ok(detector::scan_object_bounds(frame, width, height, region, low, high))
}

/// One-shot vertical band segmentation over a raw frame.
#[allow(clippy::too_many_arguments)]
pub fn find_vertical_bands(
    frame: &[u8],
    width: i32,
    height: i32,
    region: Rect,
    low: Hsv,
    high: Hsv,
    min_width: i32,
    min_height: i32,
    max_bands: usize,
) -> Result<Vec<Band>, VisionError> {
    check_frame(frame, width, height)?;
    Ok(detector::scan_vertical_bands(
        frame, width, height, region, low, high, min_width, min_height, max_bands,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: i32, height: i32, rgba: [u8; 4]) -> Vec<u8> {
        let mut frame = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            frame.extend_from_slice(&rgba);
        }
        frame
    }

    fn noise_frame(width: i32, height: i32, mut seed: u32) -> Vec<u8> {
        let mut frame = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            frame.extend_from_slice(&[
                (seed & 0xff) as u8,
                ((seed >> 8) & 0xff) as u8,
                ((seed >> 16) & 0xff) as u8,
                255,
            ]);
        }
        frame
    }

    fn patch_of(frame: &[u8], frame_width: i32, rect: Rect) -> Vec<u8> {
        let mut patch = Vec::with_capacity((rect.width * rect.height * 4) as usize);
        for y in rect.y..rect.y + rect.height {
            let row = ((y * frame_width + rect.x) * 4) as usize;
            patch.extend_from_slice(&frame[row..row + (rect.width * 4) as usize]);
        }
        patch
    }

    fn color_trigger(id: u32, target: Hsv) -> Trigger {
        Trigger {
            id,
            name: format!("color_{id}"),
            kind: TriggerKind::Color { target },
            region: Rect::FULL_FRAME,
            active: true,
        }
    }

    fn ready_header(width: i32, height: i32) -> Header {
        let mut header = Header::default();
        header.frame_width = width;
        header.frame_height = height;
        header.frame_stride = width * 4;
        header.publish_frame();
        header
    }

    #[test]
    fn color_centroid_scenario() {
        let mut frame = solid_frame(10, 10, [0, 0, 0, 255]);
        for y in 4..=6 {
            for x in 4..=6 {
                let i = ((y * 10 + x) * 4) as usize;
                frame[i..i + 4].copy_from_slice(&[255, 255, 0, 255]);
            }
        }
        let blob = find_color_region(
            &frame,
            10,
            10,
            Rect::FULL_FRAME,
            Hsv::new(15, 255, 255),
            15,
            10_000,
        )
        .unwrap();
        assert_eq!(blob.count, 9);
        assert_eq!(blob.centroid, Point2::new(5, 5));
    }

    #[test]
    fn color_region_rejects_zero_cap() {
        let frame = solid_frame(4, 4, [0, 0, 0, 255]);
        let err =
            find_color_region(&frame, 4, 4, Rect::FULL_FRAME, Hsv::new(0, 0, 0), 15, 0)
                .unwrap_err();
        assert!(matches!(err, VisionError::ZeroMatchCap));
    }

    #[test]
    fn ncc_self_match_scenario() {
        let frame = noise_frame(32, 32, 0xdead_beef);
        let patch = patch_of(&frame, 32, Rect::new(8, 8, 16, 16));
        let template =
            Template::from_rgba(1, "patch", 16, 16, &patch, 0.95, Rect::FULL_FRAME).unwrap();

        let result = find_template(&frame, 32, 32, &template).unwrap();
        assert!(result.found);
        assert_eq!(result.bounding_box, Rect::new(8, 8, 16, 16));
        assert_eq!(result.location, Point2::new(16, 16));
        assert!(result.confidence >= 0.999, "confidence = {}", result.confidence);
    }

    #[test]
    fn template_validation() {
        assert!(matches!(
            Template::from_rgba(1, "t", 0, 4, &[], 0.9, Rect::FULL_FRAME),
            Err(VisionError::InvalidTemplate(_))
        ));
        assert!(matches!(
            Template::from_rgba(1, "t", 2, 2, &[0; 15], 0.9, Rect::FULL_FRAME),
            Err(VisionError::InvalidTemplate(_))
        ));
        assert!(matches!(
            Template::from_rgba(1, "t", 2, 2, &[0; 16], 1.5, Rect::FULL_FRAME),
            Err(VisionError::InvalidTemplate(_))
        ));
        assert!(Template::from_rgba(1, "t", 2, 2, &[0; 16], 0.9, Rect::FULL_FRAME).is_ok());
    }

    #[test]
    fn template_from_image_deep_copies() {
        let rgba = image::RgbaImage::from_fn(4, 4, |x, y| {
            image::Rgba([(x * 50) as u8, (y * 50) as u8, 0, 255])
        });
        let img = DynamicImage::ImageRgba8(rgba);
        let template = Template::from_image(3, "icon", &img, 0.8, Rect::FULL_FRAME).unwrap();
        assert_eq!(template.width(), 4);
        assert_eq!(template.height(), 4);
        assert_eq!(template.pixels().len(), 64);
    }

    #[test]
    fn template_table_is_bounded() {
        let mut engine = VisionEngine::new();
        for i in 0..MAX_TEMPLATES {
            let t = Template::from_rgba(i as u32, "t", 2, 2, &[0; 16], 0.9, Rect::FULL_FRAME)
                .unwrap();
            assert_eq!(engine.load_template(t).unwrap(), i);
        }
        let extra =
            Template::from_rgba(99, "t", 2, 2, &[0; 16], 0.9, Rect::FULL_FRAME).unwrap();
        assert!(matches!(engine.load_template(extra), Err(VisionError::TemplateTableFull)));
        // The failed insert left the table unchanged.
        assert_eq!(engine.template_count(), MAX_TEMPLATES);
    }

    #[test]
    fn trigger_with_unknown_template_is_rejected() {
        let mut engine = VisionEngine::new();
        let trigger = Trigger {
            id: 1,
            name: "ghost".into(),
            kind: TriggerKind::Template { index: 0 },
            region: Rect::FULL_FRAME,
            active: true,
        };
        assert!(matches!(engine.add_trigger(trigger), Err(VisionError::UnknownTemplate(0))));
        assert_eq!(engine.trigger_count(), 0);
    }

    #[test]
    fn process_frame_requires_a_published_frame() {
        let engine = VisionEngine::new();
        let mut header = Header::default();
        header.frame_width = 4;
        header.frame_height = 4;
        header.frame_stride = 16;
        let frame = solid_frame(4, 4, [0, 0, 0, 255]);
        assert!(matches!(
            engine.process_frame(&mut header, &frame),
            Err(VisionError::StaleFrame)
        ));
        assert_eq!(header.num_results, 0);
    }

    #[test]
    fn process_frame_rejects_bad_stride() {
        let engine = VisionEngine::new();
        let mut header = ready_header(4, 4);
        header.frame_stride = 20;
        let frame = solid_frame(4, 4, [0, 0, 0, 255]);
        assert!(matches!(
            engine.process_frame(&mut header, &frame),
            Err(VisionError::BadStride { .. })
        ));
    }

    #[test]
    fn process_frame_fills_slots_in_trigger_order() {
        let mut engine = VisionEngine::new();

        // A 20x20 yellow block: 400 pixels, enough for a color trigger.
        let mut frame = solid_frame(64, 64, [0, 0, 0, 255]);
        for y in 10..30 {
            for x in 10..30 {
                let i = ((y * 64 + x) * 4) as usize;
                frame[i..i + 4].copy_from_slice(&[255, 255, 0, 255]);
            }
        }

        engine.add_trigger(color_trigger(7, Hsv::new(30, 255, 255))).unwrap();
        engine
            .add_trigger(Trigger {
                id: 8,
                name: "purple".into(),
                kind: TriggerKind::Color { target: Hsv::new(150, 255, 255) },
                region: Rect::FULL_FRAME,
                active: true,
            })
            .unwrap();
        engine
            .add_trigger(Trigger {
                id: 9,
                name: "inactive".into(),
                kind: TriggerKind::Color { target: Hsv::new(30, 255, 255) },
                region: Rect::FULL_FRAME,
                active: false,
            })
            .unwrap();

        let mut header = ready_header(64, 64);
        engine.process_frame(&mut header, &frame).unwrap();

        assert_eq!(header.num_results, 2);
        let first = header.results[0];
        let second = header.results[1];
        assert_eq!(first.trigger_id, 7);
        assert!(first.found);
        assert_eq!(first.location, Point2::new(19, 19));
        assert_eq!(second.trigger_id, 8);
        assert!(!second.found);
        assert_eq!(first.timestamp_ns, second.timestamp_ns);
        assert!(header.vision_latency_ns >= 0);
    }

    #[test]
    fn process_frame_caps_results_at_sixteen() {
        let mut engine = VisionEngine::new();
        for id in 0..20 {
            engine.add_trigger(color_trigger(id, Hsv::new(30, 255, 255))).unwrap();
        }
        let frame = solid_frame(32, 32, [0, 0, 0, 255]);
        let mut header = ready_header(32, 32);
        engine.process_frame(&mut header, &frame).unwrap();
        assert_eq!(header.num_results, MAX_RESULTS as u32);
    }

    #[test]
    fn edge_trigger_reports_midpoint_and_position() {
        let mut engine = VisionEngine::new();
        engine
            .add_trigger(Trigger {
                id: 3,
                name: "floor".into(),
                kind: TriggerKind::Edge { color: Hsv::default(), horizontal: true },
                region: Rect::FULL_FRAME,
                active: true,
            })
            .unwrap();

        let mut frame = solid_frame(40, 40, [0, 0, 0, 255]);
        for y in 20..40 {
            for x in 0..40 {
                let i = ((y * 40 + x) * 4) as usize;
                frame[i..i + 4].copy_from_slice(&[255, 255, 255, 255]);
            }
        }

        let mut header = ready_header(40, 40);
        engine.process_frame(&mut header, &frame).unwrap();

        let result = header.results[0];
        assert!(result.found);
        assert_eq!(result.location.x, 20);
        assert!((result.location.y - 20).abs() <= 1);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn template_trigger_uses_its_search_region() {
        let mut engine = VisionEngine::new();
        let frame = noise_frame(32, 32, 0x0bad_cafe);
        let patch = patch_of(&frame, 32, Rect::new(8, 8, 16, 16));
        let template =
            Template::from_rgba(5, "patch", 16, 16, &patch, 0.95, Rect::FULL_FRAME).unwrap();
        let index = engine.load_template(template).unwrap();
        engine
            .add_trigger(Trigger {
                id: 11,
                name: "patch".into(),
                kind: TriggerKind::Template { index },
                region: Rect::FULL_FRAME,
                active: true,
            })
            .unwrap();

        let mut header = ready_header(32, 32);
        engine.process_frame(&mut header, &frame).unwrap();

        let result = header.results[0];
        assert_eq!(result.trigger_id, 11);
        assert!(result.found);
        assert_eq!(result.bounding_box, Rect::new(8, 8, 16, 16));
    }

    #[test]
    fn toggling_a_trigger_changes_participation() {
        let mut engine = VisionEngine::new();
        engine.add_trigger(color_trigger(1, Hsv::new(30, 255, 255))).unwrap();
        engine.set_trigger_active(0, false).unwrap();

        let frame = solid_frame(16, 16, [0, 0, 0, 255]);
        let mut header = ready_header(16, 16);
        engine.process_frame(&mut header, &frame).unwrap();
        assert_eq!(header.num_results, 0);

        engine.set_trigger_active(0, true).unwrap();
        header.publish_frame();
        engine.process_frame(&mut header, &frame).unwrap();
        assert_eq!(header.num_results, 1);

        assert!(matches!(
            engine.set_trigger_active(5, true),
            Err(VisionError::UnknownTrigger(5))
        ));
    }
}
