pub mod evaluation;
pub mod events;
pub mod llm;
pub mod model;
pub mod prompts;
pub mod runtime;
pub mod speech;
pub mod store;
pub mod validator;

pub use evaluation::{EvaluationQueue, EvaluationWorker};
pub use events::{ClientEvent, ServerEvent};
pub use runtime::{Flow, InterviewRuntime, InterviewServices, RuntimeSettings};
pub use store::InterviewRepository;
