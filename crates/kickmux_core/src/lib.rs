#![forbid(unsafe_code)]

pub mod cache;
pub mod collaborators;
pub mod config;
pub mod orchestrator;
pub mod services;

pub use cache::{BoundedCache, CacheError, RoomScopedCache};
pub use collaborators::{RoomDataSource, RoomEventSink};
pub use config::{KickmuxConfig, default_config_path, load_config_from_path};
pub use orchestrator::{
	Admission, ConnectionOrchestrator, OrchestratorConfig, OrchestratorError, OrchestratorStatus, StartupOptions,
	StartupReport,
};
pub use services::{HttpRoomDataSource, resolve_rooms};
