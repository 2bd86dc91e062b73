use serde::Serialize;

/// A point in frame coordinates (origin top-left, x rightward, y downward).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Point2 {
    pub x: i32,
    pub y: i32,
}

impl Point2 {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// A rectangular region in frame coordinates. A zero-valued width/height
/// means "entire frame" at detector entry points.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// The whole-frame sentinel region.
    pub const FULL_FRAME: Rect = Rect::new(0, 0, 0, 0);

    /// Resolve the region against a frame of the given dimensions: negative
    /// origins are pulled to zero, zero extents expand to the frame, and the
    /// result is clipped to the frame bounds. Returns `None` when nothing of
    /// the region remains.
    pub fn clip_to(&self, frame_width: i32, frame_height: i32) -> Option<Rect> {
        let x = self.x.max(0);
        let y = self.y.max(0);
        let mut width = if self.width > 0 { self.width } else { frame_width };
        let mut height = if self.height > 0 { self.height } else { frame_height };

        if x + width > frame_width {
            width = frame_width - x;
        }
        if y + height > frame_height {
            height = frame_height - y;
        }

        if width <= 0 || height <= 0 {
            return None;
        }
        Some(Rect::new(x, y, width, height))
    }

    /// Center of the rectangle, rounded down.
    pub fn center(&self) -> Point2 {
        Point2::new(self.x + self.width / 2, self.y + self.height / 2)
    }
}

/// Color in HSV space on the halved hue scale: H in 0..=179 (one full turn
/// is 180), S and V in 0..=255. Conversion and comparison live in
/// [`crate::detector`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hsv {
    pub h: u8,
    pub s: u8,
    pub v: u8,
}

impl Hsv {
    pub const fn new(h: u8, s: u8, v: u8) -> Self {
        Self { h, s, v }
    }
}

/// Kind of input to synthesize. The injector process interprets the
/// accompanying [`ActionCommand`] fields.
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    #[default]
    None = 0,
    Tap = 1,
    Swipe = 2,
    LongPress = 3,
    Drag = 4,
    Wait = 5,
}

/// One action command handed back to the producer through the shared header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ActionCommand {
    pub kind: ActionKind,
    pub start: Point2,
    /// End point, for swipe and drag.
    pub end: Point2,
    pub duration_ms: i32,
    /// Hold time, for long press.
    pub hold_ms: i32,
    /// Randomization factor in 0.0..=1.0 applied by the injector.
    pub randomize: f32,
}

impl ActionCommand {
    pub const fn none() -> Self {
        Self {
            kind: ActionKind::None,
            start: Point2::new(0, 0),
            end: Point2::new(0, 0),
            duration_ms: 0,
            hold_ms: 0,
            randomize: 0.0,
        }
    }
}

/// Lifecycle state of the logic brain, mirrored into the shared header for
/// the producer to observe.
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GameState {
    #[default]
    Idle = 0,
    Detecting = 1,
    ActionPending = 2,
    Executing = 3,
    Paused = 4,
    Error = 5,
}

impl GameState {
    /// Decode a raw header word; unknown values collapse to `Error`.
    pub fn from_raw(raw: u32) -> GameState {
        match raw {
            0 => GameState::Idle,
            1 => GameState::Detecting,
            2 => GameState::ActionPending,
            3 => GameState::Executing,
            4 => GameState::Paused,
            _ => GameState::Error,
        }
    }
}

impl std::fmt::Display for GameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GameState::Idle => "IDLE",
            GameState::Detecting => "DETECTING",
            GameState::ActionPending => "ACTION_PENDING",
            GameState::Executing => "EXECUTING",
            GameState::Paused => "PAUSED",
            GameState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Per-trigger detection outcome written into one shared result slot.
///
/// `timestamp_ns` is the detection start time of the frame the result
/// belongs to; all slots of one frame carry the same stamp.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VisionResult {
    pub trigger_id: u32,
    pub found: bool,
    pub confidence: f32,
    pub location: Point2,
    pub bounding_box: Rect,
    pub timestamp_ns: i64,
}

/// A reference image owned by the vision engine. Pixel data is deep-copied
/// at construction and kept until the engine drops; `width * height * 4`
/// always equals `pixels.len()`.
#[derive(Debug, Clone)]
pub struct Template {
    pub id: u32,
    pub name: String,
    pub(crate) width: i32,
    pub(crate) height: i32,
    /// Match confidence threshold in 0.0..=1.0.
    pub threshold: f32,
    /// Region to search in; `Rect::FULL_FRAME` searches everywhere.
    pub search_region: Rect,
    pub(crate) pixels: Vec<u8>,
}

impl Template {
    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    /// Raw RGBA pixel data, row-major, stride `width * 4`.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Detection variant of a trigger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerKind {
    /// Match the template at this table index (validated when the trigger
    /// is added).
    Template { index: usize },
    /// Color blob within tolerance of the target.
    Color { target: Hsv },
    /// Gradient edge; `horizontal` scans rows, otherwise columns.
    Edge { color: Hsv, horizontal: bool },
}

/// A declarative detection request applied every frame while active.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub id: u32,
    pub name: String,
    pub kind: TriggerKind,
    pub region: Rect,
    pub active: bool,
}

/// One condition/action rule evaluated by the brain each frame.
#[derive(Debug, Clone)]
pub struct DecisionRule {
    pub condition: String,
    pub action: ActionKind,
    pub target: Point2,
    pub priority: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_passes_through_interior_region() {
        let r = Rect::new(10, 20, 30, 40).clip_to(100, 100).unwrap();
        assert_eq!(r, Rect::new(10, 20, 30, 40));
    }

    #[test]
    fn clip_expands_zero_extents_to_frame() {
        let r = Rect::FULL_FRAME.clip_to(640, 480).unwrap();
        assert_eq!(r, Rect::new(0, 0, 640, 480));
    }

    #[test]
    fn clip_trims_overhang() {
        let r = Rect::new(600, 400, 100, 100).clip_to(640, 480).unwrap();
        assert_eq!(r, Rect::new(600, 400, 40, 80));
    }

    #[test]
    fn clip_pulls_negative_origin_to_zero() {
        let r = Rect::new(-10, -10, 50, 50).clip_to(640, 480).unwrap();
        assert_eq!(r, Rect::new(0, 0, 50, 50));
    }

    #[test]
    fn clip_rejects_region_outside_frame() {
        assert!(Rect::new(700, 0, 10, 10).clip_to(640, 480).is_none());
        assert!(Rect::new(0, 0, 10, 10).clip_to(0, 0).is_none());
    }

    #[test]
    fn game_state_round_trips_through_raw() {
        for state in [
            GameState::Idle,
            GameState::Detecting,
            GameState::ActionPending,
            GameState::Executing,
            GameState::Paused,
            GameState::Error,
        ] {
            assert_eq!(GameState::from_raw(state as u32), state);
        }
        assert_eq!(GameState::from_raw(99), GameState::Error);
    }

    #[test]
    fn action_command_default_is_none() {
        assert_eq!(ActionCommand::default(), ActionCommand::none());
    }
}
