pub mod http;
pub mod null;

pub use http::HttpServiceDispatcher;
pub use null::NullDispatcher;
