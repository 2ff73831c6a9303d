//! Service layer separating image I/O from pipeline logic

pub mod io;

pub use io::ImageIOService;
