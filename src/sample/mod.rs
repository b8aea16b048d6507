pub mod buffer;
pub mod peaks;
pub mod snapshot;

pub use buffer::{SampleBuffer, Window};
pub use peaks::{Peak, PeakState, PeakTracker};
pub use snapshot::{DeviceId, Metric, Reading, Snapshot};
