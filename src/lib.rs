pub mod chain;
pub mod distributions;
pub mod error;
pub mod evidence;
pub mod gmm;
pub mod io;
pub mod linalg;
pub mod merge;
pub mod peak;
pub mod stats;
