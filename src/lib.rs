pub mod app;
pub mod camera;
pub mod cascade;
pub mod cli;
pub mod config;
pub mod environment;
pub mod error;
pub mod hbao;
pub mod material;
pub mod mesh;
pub mod renderer;
pub mod scene;
pub mod time;

pub use app::{run, App, DemoScene};
pub use error::{PipelineError, PipelineResult};
