pub mod blob;
pub mod genai;
pub mod parse;
pub mod prompt;
pub mod store;
pub mod workflow;
