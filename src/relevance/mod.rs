pub mod expansion;
pub mod image;
pub mod text;

pub use image::{ImageClassifier, ImageSource, LabelDetector};
pub use text::{TextMode, relevant};
