mod decoder;
mod encoder;
mod value;

pub use decoder::Parser;
pub use value::Value;
