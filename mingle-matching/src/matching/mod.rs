pub mod detector;

pub use detector::{DetectError, Detection, MatchDetector};
