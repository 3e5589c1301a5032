//! HTTP/1.x wire handling: the request-head parser and the response
//! serializer.

pub use self::encode::ResponseBuilder;
pub use self::parse::RequestParser;

mod encode;
mod parse;
