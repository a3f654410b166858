//! Scene state, fingerprints and durable storage.

mod assets;
mod fingerprint;
mod model;
mod store;

pub use assets::*;
pub use fingerprint::*;
pub use model::*;
pub use store::*;
