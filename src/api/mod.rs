pub mod openai;
pub mod replicate;

pub use openai::{OpenAiPlanner, OpenAiVision};
pub use replicate::ReplicateProvider;
