//! Instance configuration.
//!
//! - `options` - [`Options`], the recognized settings for one instance
//! - `duration` - human-readable duration parsing shared by the timeouts

mod duration;
mod options;

pub use duration::*;
pub use options::*;
