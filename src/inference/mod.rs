pub mod image_pipeline;
pub mod models;
pub mod text_pipeline;
