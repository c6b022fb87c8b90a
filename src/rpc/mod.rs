//! Request/response protocol between host threads and the engine worker

mod dispatcher;
pub mod message;
mod worker;

pub use dispatcher::{Dispatcher, PendingReply};
pub use message::{
    Attachment, Command, ErrorPayload, Outcome, ProtocolError, RenderedImage, Reply, Request,
    RequestId, Response,
};
pub use worker::{Worker, WorkerEvent, run_worker};
