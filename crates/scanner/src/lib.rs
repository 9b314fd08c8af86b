pub mod clamd;
pub mod error;
pub mod scanner;
pub mod signature;
pub mod verdict;

pub use clamd::{ClamdConfig, ClamdScanner};
pub use error::ScanError;
pub use scanner::{DynScanner, Scanner};
pub use signature::{EICAR, SignatureScanner};
pub use verdict::ScanVerdict;
