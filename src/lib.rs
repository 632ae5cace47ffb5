// FreEstream Server Library
// Restreaming orchestrator: one FFmpeg relay per destination

pub mod commands;
pub mod models;
pub mod services;
