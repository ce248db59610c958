pub mod capture;
pub mod router;
pub mod snapshot;

pub use capture::CaptureWorker;
pub use router::{DeliveryPath, FrameRouter};
pub use snapshot::SnapshotSync;
