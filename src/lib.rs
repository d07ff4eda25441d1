pub mod app;
pub mod bot;
pub mod core;
pub mod error;
pub mod events;
pub mod prompting;
pub mod realtime;
pub mod store;
pub mod summary;
pub mod types;
pub mod whatsapp;
