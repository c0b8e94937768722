//! Raster registration and change compositing for drawing sheets.

pub mod aligner;
pub mod codec;
pub mod compositor;
pub mod features;
pub mod transform;

pub use aligner::{Alignment, AlignmentReport, FeatureAligner};
pub use codec::{decode, encode_png, to_gray};
pub use compositor::{CompositeMode, CompositeOutput, OverlayCompositor, PixelStats};
pub use transform::AffineTransform;
