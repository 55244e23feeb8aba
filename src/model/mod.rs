//! Model materialization: formats, scratch storage and the cached
//! decrypt-and-load pipeline.

pub mod format;
pub mod materializer;
pub mod scratch;
