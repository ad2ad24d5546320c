pub mod image;
pub mod request;
