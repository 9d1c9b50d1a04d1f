pub mod core;
pub mod embedding;
pub mod index;
pub mod llm;
pub mod rag;
pub mod server;
pub mod state;
