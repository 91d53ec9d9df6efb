pub mod backoff;
pub mod conflict;
pub mod engine;
pub mod local_saves;
pub mod paths;
pub mod playtime;
pub mod progress;
pub mod queue;
pub mod settings;
pub mod store;
pub mod transfer;
