//! Real-time perception-and-decision core for screen-driven game
//! automation.
//!
//! An external capture process publishes RGBA frames into a shared region;
//! the [`vision`] engine detects templates, color blobs and edges in each
//! frame, the [`brain`] turns detections into an [`types::ActionCommand`]
//! via its blackboard and rule language, and the [`shm`] transport hands
//! frames in and results out with two atomic flags and no locks. The
//! [`runner`] ties it together in a 100 Hz polling loop; an external
//! process performs the actual input injection.

pub mod brain;
pub mod detector;
pub mod expr;
pub mod runner;
pub mod shm;
pub mod types;
pub mod vision;

pub use brain::BrainEngine;
pub use runner::Runner;
pub use shm::{SHM_NAME, SharedRegion};
pub use types::{ActionCommand, ActionKind, GameState, Template, Trigger, TriggerKind};
pub use vision::VisionEngine;
