pub mod chat;
pub mod run;
pub mod transcription;
