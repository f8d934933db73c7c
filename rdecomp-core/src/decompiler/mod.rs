pub mod analysis;
pub mod cfg;
pub mod config;
pub mod decoder;
pub mod emitter;
pub mod error;
pub mod ir;
pub mod passes;
pub mod pipeline;
pub mod structurer;
pub mod validator;
