pub mod device_map;
pub mod error;
pub mod loader;
mod loader_factory;
pub mod pipeline;
pub mod processor;
pub mod stable_diffusion;
pub mod theme;
mod util;

pub use device_map::*;
pub use error::*;
pub use loader::*;
pub use loader_factory::*;
pub use pipeline::*;
pub use processor::{ImageProcessor, Operation};
pub use theme::ThemeTable;
pub(crate) use util::*;
