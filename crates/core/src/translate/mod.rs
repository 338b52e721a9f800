pub mod nonstream;
pub mod request;
pub mod stream;
