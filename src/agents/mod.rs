//! Chat agent roles plugged into the execution gate.

pub mod chat;

pub use chat::{build_chat_slot, AgentKind, ChatRequest, ChatRole, ChatSlot};
