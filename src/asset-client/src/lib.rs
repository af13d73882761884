mod asset_client;
mod http_client;
mod uploader;
mod wire;

pub use asset_client::*;
pub use http_client::*;
pub use uploader::*;
pub use wire::*;
