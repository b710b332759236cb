pub mod decoder;
pub mod encoder;

pub use decoder::{BodyDecoder, BodyItem, DecodeError, ResponseHead};
pub use encoder::RequestHead;
