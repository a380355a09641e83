pub mod context;
pub mod delivery;
pub mod email;
pub mod message;
pub mod outbox;
pub mod response;
pub mod retry;
pub mod status;
pub mod template;
pub mod validation;
