pub mod classifier;
pub mod features;
pub mod verdict;

pub use classifier::{CategoryScore, Classifier, MIN_SAMPLES};
pub use features::{Features, Limits};
pub use verdict::{Contribution, Label, LabelScore, Verdict};
