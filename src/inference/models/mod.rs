pub mod llm;
pub mod stable_diffusion;
