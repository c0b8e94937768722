//! Stage workers consuming the bus: OCR, Diff and Summary.

pub mod diff;
pub mod ocr;
pub mod pool;
pub mod runner;
pub mod summary;

pub use diff::DiffWorker;
pub use ocr::OcrWorker;
pub use pool::WorkerPool;
pub use runner::{handle_delivery, BatchReport, StageHandler, StageWorker};
pub use summary::SummaryWorker;
