pub mod chat;
pub mod game;
pub mod models;
pub mod state;
pub mod system;
pub mod universe;
