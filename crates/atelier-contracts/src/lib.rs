pub mod config;
pub mod events;
pub mod jobs;
pub mod prompts;
pub mod providers;
pub mod runs;
