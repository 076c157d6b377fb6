mod classifier;
mod level;
mod line;
mod scanner;

pub use classifier::Classifier;
pub use level::Level;
pub use line::{Cause, LogLine};
pub use scanner::{last_error, AsyncLogScanner, LogScanner};
