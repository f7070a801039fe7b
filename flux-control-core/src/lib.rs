pub mod control;
pub mod device_map;
pub mod error;
pub mod flux;
pub mod loader;
pub mod predictor;
pub mod request;
mod util;
pub mod weights;

pub use control::*;
pub use device_map::*;
pub use error::*;
pub use flux::{FluxControlLoader, FluxControlPipeline};
use image::DynamicImage;
pub use loader::*;
pub use predictor::*;
pub use request::*;
pub(crate) use util::*;
pub use weights::*;

/// A loaded generation pipeline. Runs are exclusive, hence `&mut self`.
pub trait ModelLike: Send {
    fn run(&mut self, params: &GenerationParams) -> anyhow::Result<DynamicImage>;
}
