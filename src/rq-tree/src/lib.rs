mod downloader;
mod overlay;
mod processor;
mod share;
mod sweeper;

pub use downloader::*;
pub use overlay::*;
pub use processor::*;
pub use share::*;
pub use sweeper::*;

#[cfg(test)]
mod test_support;
