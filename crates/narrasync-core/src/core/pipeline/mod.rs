//! Scene Pipeline Controller
//!
//! Plans a project from narrative text, generates stale scene assets through
//! the retry executor and applies per-scene edits.

mod controller;
mod events;
mod overrides;
mod report;

pub use controller::*;
pub use events::*;
pub use overrides::*;
pub use report::*;
