//! Boundary layer for running the PDFium engine behind a synchronous
//! callback contract, natively or inside a wasm sandbox.

pub mod bridge;
pub mod panic_handler;
pub mod pdf;
pub mod rpc;
pub mod sandbox;
pub mod settings;

#[doc(hidden)]
pub mod testing;
