pub mod mistral;

pub use mistral::MistralBackend;
