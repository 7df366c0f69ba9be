pub mod client;
pub mod session;

pub use client::{HttpManagementApi, ManagementApi, DEFAULT_INFERENCE_URL, DEFAULT_MANAGEMENT_URL};
pub use session::{ModelKind, ServingDaemon, Session};
