// src/lib.rs

// Import the top-level `voidtable` module.
pub mod voidtable;

// Re-export the types most embedders need so they don't have to navigate the
// full module hierarchy.
pub use voidtable::action::{ActionDeclaration, ActionValidator};
pub use voidtable::agent::{AgentRole, AgentRuntime, BusLink};
pub use voidtable::bus::MessageBus;
pub use voidtable::llm::{LlmClient, LlmRequest, LlmResponse};
pub use voidtable::mechanics::{MechanicsEngine, OutcomeTier};
pub use voidtable::message::{Message, MessageType};
pub use voidtable::session::SessionOrchestrator;
