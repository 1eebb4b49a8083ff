//! Data and file contracts shared by the Miro engine and CLI: session
//! history, transcripts, manifests, turn receipts and the JSONL event log.

pub mod chat;
pub mod events;
pub mod session;
pub mod turns;
