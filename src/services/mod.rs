pub mod analysis;
pub mod extractor;
pub mod image_store;
pub mod notifier;
pub mod scanner;
pub mod state;
pub mod vision;
