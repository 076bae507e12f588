pub mod transport;

pub use transport::ReqwestTransport;
